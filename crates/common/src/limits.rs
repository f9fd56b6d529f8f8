use serde::Serialize;

/// A limit value together with where it came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ResolvedLimit {
    pub value: u64,
    pub source: &'static str, // "param" | "env" | "default"
}

pub const TREE_DEPTH_DEFAULT: u64 = 2;
pub const TREE_DEPTH_MAX: u64 = 5;
pub const SEARCH_RESULTS_DEFAULT: u64 = 50;
pub const SEARCH_RESULTS_MAX: u64 = 200;

fn parse_env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok()?.trim().parse::<u64>().ok()
}

fn clamp(v: u64, min: u64, max: u64) -> u64 {
    if v < min {
        return min;
    }
    if v > max {
        return max;
    }
    v
}

fn resolve(param: Option<u64>, env_name: &str, default: u64, min: u64, max: u64) -> ResolvedLimit {
    if let Some(p) = param {
        ResolvedLimit {
            value: clamp(p, min, max),
            source: "param",
        }
    } else if let Some(envv) = parse_env_u64(env_name) {
        ResolvedLimit {
            value: clamp(envv, min, max),
            source: "env",
        }
    } else {
        ResolvedLimit {
            value: clamp(default, min, max),
            source: "default",
        }
    }
}

/// Resolve the byte budget for a single file read.
/// - param → env(VIBE_READ_MAX_BYTES) → default(`ceiling`), clamped [1..ceiling]
pub fn resolve_read_max_bytes(param: Option<u64>, ceiling: u64) -> ResolvedLimit {
    let ceiling = ceiling.max(1);
    resolve(param, "VIBE_READ_MAX_BYTES", ceiling, 1, ceiling)
}

/// Resolve the maximum number of search matches.
/// - param → env(VIBE_SEARCH_MAX_RESULTS) → default(50), clamped [1..200]
pub fn resolve_search_max_results(param: Option<u64>) -> ResolvedLimit {
    resolve(
        param,
        "VIBE_SEARCH_MAX_RESULTS",
        SEARCH_RESULTS_DEFAULT,
        1,
        SEARCH_RESULTS_MAX,
    )
}

/// Resolve the directory listing depth.
/// - param → env(VIBE_TREE_DEPTH) → default(2), clamped [0..5]
pub fn resolve_tree_depth(param: Option<u64>) -> ResolvedLimit {
    resolve(
        param,
        "VIBE_TREE_DEPTH",
        TREE_DEPTH_DEFAULT,
        0,
        TREE_DEPTH_MAX,
    )
}
