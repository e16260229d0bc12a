use k8s_openapi::api::core::v1::{Pod, PodAffinity, PodAffinityTerm, PodAntiAffinity};
use k8s_openapi::api::core::v1::WeightedPodAffinityTerm;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread;

use crate::scheduler::labels::{selector_matches, SelectorError};
use crate::scheduler::plugins::{Plugin, Score, ScoreError};
use crate::scheduler::MAX_NODE_SCORE;
use crate::state::NodeInfo;

pub const DEFAULT_HARD_POD_AFFINITY_WEIGHT: u32 = 1;

/// Topology keys consulted when a preferred anti-affinity term leaves its
/// topology key empty.
pub const DEFAULT_FAILURE_DOMAIN_KEYS: [&str; 3] = [
    "kubernetes.io/hostname",
    "topology.kubernetes.io/zone",
    "topology.kubernetes.io/region",
];

const SCORING_WORKERS: usize = 16;

#[derive(Clone, Debug, Default)]
pub struct Topologies {
    pub default_keys: Vec<String>,
}

impl Topologies {
    /// True when both label sets carry the topology key with equal values. An
    /// empty key falls back to the default failure domain keys, matching on
    /// any of them.
    pub fn nodes_have_same_topology_value(
        &self,
        a: &BTreeMap<String, String>,
        b: &BTreeMap<String, String>,
        key: &str,
    ) -> bool {
        if key.is_empty() {
            return self
                .default_keys
                .iter()
                .any(|k| labels_share_value(a, b, k));
        }
        labels_share_value(a, b, key)
    }
}

fn labels_share_value(
    a: &BTreeMap<String, String>,
    b: &BTreeMap<String, String>,
    key: &str,
) -> bool {
    match (a.get(key), b.get(key)) {
        (Some(x), Some(y)) => x == y,
        _ => false,
    }
}

/// Scores nodes by how well the pod's soft inter-pod affinity and
/// anti-affinity terms align with the pods already placed on nodes sharing a
/// topology domain.
///
/// Symmetry is considered for the soft terms of resident pods in both
/// directions, and for the *hard* affinity terms of residents via the
/// configured weight constant. Hard terms of the pod being scored are the
/// filter stage's business and are deliberately not processed here.
pub struct InterPodAffinity {
    hard_pod_affinity_weight: u32,
    topologies: Topologies,
}

impl Default for InterPodAffinity {
    fn default() -> Self {
        Self::new(DEFAULT_HARD_POD_AFFINITY_WEIGHT)
    }
}

impl InterPodAffinity {
    pub fn new(hard_pod_affinity_weight: u32) -> Self {
        InterPodAffinity {
            hard_pod_affinity_weight,
            topologies: Topologies {
                default_keys: DEFAULT_FAILURE_DOMAIN_KEYS
                    .iter()
                    .map(|k| k.to_string())
                    .collect(),
            },
        }
    }

    pub fn with_failure_domains(mut self, keys: Vec<String>) -> Self {
        self.topologies = Topologies { default_keys: keys };
        self
    }

    /// Adds `weight` to every node sharing `fixed_node`'s topology value for
    /// the term's key, provided `pod_to_check` matches the term's selector
    /// and namespaces.
    fn process_term(
        &self,
        counts: &mut HashMap<String, f64>,
        nodes: &[NodeInfo],
        term: &PodAffinityTerm,
        defining_pod: &Pod,
        pod_to_check: &Pod,
        fixed_node: &NodeInfo,
        weight: f64,
    ) -> Result<(), SelectorError> {
        if !pod_matches_term(term, defining_pod, pod_to_check)? {
            return Ok(());
        }
        for node in nodes {
            if self.topologies.nodes_have_same_topology_value(
                &node.labels,
                &fixed_node.labels,
                &term.topology_key,
            ) {
                *counts.entry(node.node_name.clone()).or_insert(0.0) += weight;
            }
        }
        Ok(())
    }

    fn process_weighted_terms(
        &self,
        counts: &mut HashMap<String, f64>,
        nodes: &[NodeInfo],
        terms: &[WeightedPodAffinityTerm],
        defining_pod: &Pod,
        pod_to_check: &Pod,
        fixed_node: &NodeInfo,
        multiplier: i64,
    ) -> Result<(), SelectorError> {
        for term in terms {
            let weight = (i64::from(term.weight) * multiplier) as f64;
            self.process_term(
                counts,
                nodes,
                &term.pod_affinity_term,
                defining_pod,
                pod_to_check,
                fixed_node,
                weight,
            )?;
        }
        Ok(())
    }

    fn process_existing_pod(
        &self,
        counts: &mut HashMap<String, f64>,
        nodes: &[NodeInfo],
        pod: &Pod,
        pod_affinity: Option<&PodAffinity>,
        pod_anti_affinity: Option<&PodAntiAffinity>,
        existing: &Pod,
        existing_node: &NodeInfo,
    ) -> Result<(), SelectorError> {
        let existing_affinity = existing.spec.as_ref().and_then(|s| s.affinity.as_ref());
        let existing_pod_affinity = existing_affinity.and_then(|a| a.pod_affinity.as_ref());
        let existing_pod_anti_affinity =
            existing_affinity.and_then(|a| a.pod_anti_affinity.as_ref());

        // For every soft affinity term of the scored pod that the resident
        // matches, bump every node sharing the resident node's topology value.
        if let Some(terms) = pod_affinity
            .and_then(|a| a.preferred_during_scheduling_ignored_during_execution.as_ref())
        {
            self.process_weighted_terms(counts, nodes, terms, pod, existing, existing_node, 1)?;
        }
        if let Some(terms) = pod_anti_affinity
            .and_then(|a| a.preferred_during_scheduling_ignored_during_execution.as_ref())
        {
            self.process_weighted_terms(counts, nodes, terms, pod, existing, existing_node, -1)?;
        }

        if let Some(existing_pod_affinity) = existing_pod_affinity {
            // Symmetry: a resident's hard affinity terms also pull the scored
            // pod towards the resident's domain, weighted by the constant.
            if self.hard_pod_affinity_weight > 0 {
                if let Some(terms) = existing_pod_affinity
                    .required_during_scheduling_ignored_during_execution
                    .as_ref()
                {
                    for term in terms {
                        self.process_term(
                            counts,
                            nodes,
                            term,
                            existing,
                            pod,
                            existing_node,
                            f64::from(self.hard_pod_affinity_weight),
                        )?;
                    }
                }
            }
            if let Some(terms) = existing_pod_affinity
                .preferred_during_scheduling_ignored_during_execution
                .as_ref()
            {
                self.process_weighted_terms(counts, nodes, terms, existing, pod, existing_node, 1)?;
            }
        }
        if let Some(terms) = existing_pod_anti_affinity
            .and_then(|a| a.preferred_during_scheduling_ignored_during_execution.as_ref())
        {
            self.process_weighted_terms(counts, nodes, terms, existing, pod, existing_node, -1)?;
        }
        Ok(())
    }
}

impl Plugin for InterPodAffinity {
    fn name(&self) -> &str {
        "InterPodAffinity"
    }
}

impl Score for InterPodAffinity {
    fn score(&self, pod: &Pod, nodes: &[NodeInfo]) -> Result<BTreeMap<String, u64>, ScoreError> {
        let affinity = pod.spec.as_ref().and_then(|s| s.affinity.as_ref());
        let pod_affinity = affinity.and_then(|a| a.pod_affinity.as_ref());
        let pod_anti_affinity = affinity.and_then(|a| a.pod_anti_affinity.as_ref());
        let has_constraints = pod_affinity.is_some() || pod_anti_affinity.is_some();

        let next = AtomicUsize::new(0);
        let workers = SCORING_WORKERS.min(nodes.len().max(1));
        let (tx, rx) = mpsc::channel::<Result<HashMap<String, f64>, SelectorError>>();

        // Fan out over nodes. Workers drain a shared index and accumulate
        // into private delta maps; ownership of each delta moves back over
        // the channel so accumulation never contends on a lock.
        thread::scope(|scope| {
            for _ in 0..workers {
                let tx = tx.clone();
                let next = &next;
                scope.spawn(move || {
                    let mut counts: HashMap<String, f64> = HashMap::new();
                    let mut first_error: Option<SelectorError> = None;
                    loop {
                        let i = next.fetch_add(1, Ordering::Relaxed);
                        let Some(node_info) = nodes.get(i) else {
                            break;
                        };
                        // A match against any resident affects every node in
                        // that resident's topology domain, so a constrained
                        // pod requires a full scan. An unconstrained pod can
                        // only be matched by residents that declare affinity
                        // themselves.
                        let residents: Vec<&Pod> = match has_constraints {
                            true => node_info.pods.iter().collect(),
                            false => node_info.pods_with_affinity(),
                        };
                        for existing in residents {
                            if let Err(err) = self.process_existing_pod(
                                &mut counts,
                                nodes,
                                pod,
                                pod_affinity,
                                pod_anti_affinity,
                                existing,
                                node_info,
                            ) {
                                first_error.get_or_insert(err);
                            }
                        }
                    }
                    let _ = tx.send(match first_error {
                        Some(err) => Err(err),
                        None => Ok(counts),
                    });
                });
            }
        });
        drop(tx);

        let mut counts: HashMap<String, f64> = HashMap::with_capacity(nodes.len());
        let mut first_error: Option<SelectorError> = None;
        for delta in rx {
            match delta {
                Ok(delta) => {
                    for (node_name, weight) in delta {
                        *counts.entry(node_name).or_insert(0.0) += weight;
                    }
                }
                Err(err) => {
                    first_error.get_or_insert(err);
                }
            }
        }
        if let Some(err) = first_error {
            return Err(err.into());
        }

        let result = normalize_counts(nodes, &counts);
        if log::log_enabled!(log::Level::Debug) {
            let pod_name = pod.metadata.name.as_deref().unwrap_or_default();
            for (node_name, score) in &result {
                log::debug!("{pod_name} -> {node_name}: inter-pod affinity score {score}");
            }
        }
        Ok(result)
    }
}

/// Scales raw per-node counts linearly into `0..=MAX_NODE_SCORE`. The
/// minimum is seeded at zero: negative contributions can lower the floor,
/// positive ones never raise it. A flat count map normalizes to all zeros.
fn normalize_counts(nodes: &[NodeInfo], counts: &HashMap<String, f64>) -> BTreeMap<String, u64> {
    let mut max_count = 0f64;
    let mut min_count = 0f64;
    for node in nodes {
        let count = counts.get(&node.node_name).copied().unwrap_or(0.0);
        if count > max_count {
            max_count = count;
        }
        if count < min_count {
            min_count = count;
        }
    }
    let spread = max_count - min_count;

    let mut result = BTreeMap::new();
    for node in nodes {
        let count = counts.get(&node.node_name).copied().unwrap_or(0.0);
        let fscore = match spread > 0.0 {
            true => MAX_NODE_SCORE as f64 * ((count - min_count) / spread),
            false => 0.0,
        };
        result.insert(node.node_name.clone(), fscore as u64);
    }
    result
}

fn pod_matches_term(
    term: &PodAffinityTerm,
    defining_pod: &Pod,
    pod_to_check: &Pod,
) -> Result<bool, SelectorError> {
    let empty = BTreeMap::new();
    let labels = pod_to_check.metadata.labels.as_ref().unwrap_or(&empty);
    let matched = selector_matches(term.label_selector.as_ref(), labels)?;

    let namespaces = term_namespaces(defining_pod, term);
    let namespace = pod_to_check.metadata.namespace.clone().unwrap_or_default();

    Ok(matched && namespaces.contains(&namespace))
}

/// A term with no namespaces applies within the defining pod's own namespace.
fn term_namespaces(defining_pod: &Pod, term: &PodAffinityTerm) -> HashSet<String> {
    match term.namespaces.as_deref() {
        Some(namespaces) if !namespaces.is_empty() => namespaces.iter().cloned().collect(),
        _ => HashSet::from([defining_pod.metadata.namespace.clone().unwrap_or_default()]),
    }
}
