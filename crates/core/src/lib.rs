// # -----------------------------
// # crates/core/src/lib.rs
// # -----------------------------
//! Local change-control plane: diff application, snapshots, revert and
//! reapply, the event log, the mutation guard, and the action gateway.

pub mod apply;
pub mod changeset;
pub mod config;
pub mod engine;
pub mod errors;
pub mod events;
pub mod gateway;
pub mod guard;
pub mod minimal_diff;
pub mod ops;
pub mod patch_parser;
pub mod patcher;
pub mod revert;
pub mod snapshot;
pub mod vcs;
pub mod warning;
pub mod workspace;

pub use changeset::{ChangeType, FileChange};
pub use config::VibeConfig;
pub use engine::{
    ChangeControl, OpsResult, PatchOptions, PatchResult, RevertResult, TestRun, VcsRevert,
};
pub use errors::{ErrorCategory, VibeError, VibeResult};
pub use events::{Event, EventKind};
pub use gateway::{ActionGateway, AgentTurn, ClientState, TurnRequest};
pub use guard::{MutationClass, MutationCoordinator, MutationPermit};
pub use snapshot::{Side, SnapshotInfo};
pub use vcs::{GitCli, VcsChannel};
pub use warning::{Warning, WarningKind};
pub use workspace::Workspace;
