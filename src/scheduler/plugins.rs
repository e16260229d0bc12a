use crate::scheduler::labels::SelectorError;
use crate::state::NodeInfo;
use k8s_openapi::api::core::v1::Pod;
use std::collections::BTreeMap;

pub trait Plugin {
    fn name(&self) -> &str;
}

#[derive(thiserror::Error, Debug)]
pub enum ScoreError {
    #[error("{0}")]
    Selector(#[from] SelectorError),
}

/// A priority function: ranks every node for a pod in one call. Scores are
/// already normalized to `0..=MAX_NODE_SCORE`; the caller combines them
/// across scorers by weight.
pub trait Score: Plugin {
    fn score(&self, pod: &Pod, nodes: &[NodeInfo]) -> Result<BTreeMap<String, u64>, ScoreError>;
}
