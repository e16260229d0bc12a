use k8s_openapi::api::core::v1::Pod;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::errors::CoxswainError;

/// A node plus the pods currently assigned to it, as supplied by whatever is
/// watching the cluster (a cache refresh, a state file, a test fixture).
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "kebab-case")]
pub struct NodeInfo {
    pub node_name: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub pods: Vec<Pod>,
}

impl NodeInfo {
    /// The subset of resident pods that declare inter-pod affinity or
    /// anti-affinity. When the scored pod carries no constraints of its own,
    /// only these can contribute to its score.
    pub fn pods_with_affinity(&self) -> Vec<&Pod> {
        self.pods.iter().filter(|p| pod_has_affinity(p)).collect()
    }
}

pub fn pod_has_affinity(pod: &Pod) -> bool {
    pod.spec
        .as_ref()
        .and_then(|s| s.affinity.as_ref())
        .map(|a| a.pod_affinity.is_some() || a.pod_anti_affinity.is_some())
        .unwrap_or(false)
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "kebab-case")]
pub struct ClusterSnapshot {
    pub nodes: Vec<NodeInfo>,
}

impl ClusterSnapshot {
    pub fn load(path: &str) -> Result<ClusterSnapshot, CoxswainError> {
        let path = shellexpand::tilde(path).to_string();
        let file = std::fs::File::open(Path::new(&path))?;
        let snapshot = serde_yaml::from_reader(file)?;
        Ok(snapshot)
    }
}
