//! Single-writer coordination for the mutating entry points.
//!
//! Acquisition never waits: a held lock surfaces immediately as
//! [`VibeError::Busy`] so the caller can back off and retry.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::errors::{VibeError, VibeResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationClass {
    Patch,
    Revert,
}

impl MutationClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationClass::Patch => "patch",
            MutationClass::Revert => "revert",
        }
    }
}

#[derive(Debug, Default)]
pub struct MutationCoordinator {
    patch_busy: Arc<AtomicBool>,
    revert_busy: Arc<AtomicBool>,
}

impl MutationCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    fn flag(&self, class: MutationClass) -> &Arc<AtomicBool> {
        match class {
            MutationClass::Patch => &self.patch_busy,
            MutationClass::Revert => &self.revert_busy,
        }
    }

    /// Takes the lock for `class`, or fails with `Busy` if it is held.
    pub fn try_acquire(&self, class: MutationClass) -> VibeResult<MutationPermit> {
        let flag = self.flag(class);
        if flag
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!(class = class.as_str(), "mutation rejected: busy");
            return Err(VibeError::Busy {
                operation: class.as_str().to_string(),
            });
        }
        Ok(MutationPermit {
            flag: Arc::clone(flag),
            class,
        })
    }

    pub fn is_busy(&self, class: MutationClass) -> bool {
        self.flag(class).load(Ordering::Acquire)
    }
}

/// Releases its lock when dropped, on success, error, or unwind alike.
#[derive(Debug)]
pub struct MutationPermit {
    flag: Arc<AtomicBool>,
    class: MutationClass,
}

impl MutationPermit {
    pub fn class(&self) -> MutationClass {
        self.class
    }
}

impl Drop for MutationPermit {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_is_busy_until_release() {
        let coordinator = MutationCoordinator::new();
        let permit = coordinator.try_acquire(MutationClass::Patch).unwrap();

        let err = coordinator.try_acquire(MutationClass::Patch).unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(err.to_string(), "patch in progress, try again");

        // Classes are independent.
        assert!(coordinator.try_acquire(MutationClass::Revert).is_ok());

        drop(permit);
        assert!(!coordinator.is_busy(MutationClass::Patch));
        assert!(coordinator.try_acquire(MutationClass::Patch).is_ok());
    }

    #[test]
    fn permit_released_on_panic() {
        let coordinator = Arc::new(MutationCoordinator::new());
        let inner = Arc::clone(&coordinator);
        let result = std::thread::spawn(move || {
            let _permit = inner.try_acquire(MutationClass::Revert).unwrap();
            panic!("boom");
        })
        .join();
        assert!(result.is_err());
        assert!(!coordinator.is_busy(MutationClass::Revert));
    }
}
