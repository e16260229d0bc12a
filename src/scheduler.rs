pub mod inter_pod_affinity;
pub mod labels;
pub mod plugins;

/// Normalized scores run from 0 to this value, most preferred highest.
pub const MAX_NODE_SCORE: u64 = 10;
