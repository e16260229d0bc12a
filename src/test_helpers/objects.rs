use crate::state::NodeInfo;
use k8s_openapi::api::core::v1::{
    Affinity, Pod, PodAffinity, PodAffinityTerm, PodAntiAffinity, PodSpec,
    WeightedPodAffinityTerm,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use std::collections::BTreeMap;

fn label_map(labels: &[(&str, &str)]) -> BTreeMap<String, String> {
    labels
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

pub fn test_pod(name: &str, ns: &str, labels: &[(&str, &str)]) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(ns.to_string()),
            labels: Some(label_map(labels)),
            ..Default::default()
        },
        spec: Some(PodSpec::default()),
        ..Default::default()
    }
}

pub fn label_selector(labels: &[(&str, &str)]) -> LabelSelector {
    LabelSelector {
        match_labels: Some(label_map(labels)),
        ..Default::default()
    }
}

pub fn affinity_term(selector_labels: &[(&str, &str)], topology_key: &str) -> PodAffinityTerm {
    PodAffinityTerm {
        label_selector: Some(label_selector(selector_labels)),
        topology_key: topology_key.to_string(),
        ..Default::default()
    }
}

pub fn weighted_term(
    weight: i32,
    selector: &[(&str, &str)],
    key: &str,
) -> WeightedPodAffinityTerm {
    WeightedPodAffinityTerm {
        weight,
        pod_affinity_term: affinity_term(selector, key),
    }
}

pub fn pod_with_affinity(
    name: &str,
    ns: &str,
    labels: &[(&str, &str)],
    preferred: Vec<WeightedPodAffinityTerm>,
    required: Vec<PodAffinityTerm>,
) -> Pod {
    let mut pod = test_pod(name, ns, labels);
    pod.spec = Some(PodSpec {
        affinity: Some(Affinity {
            pod_affinity: Some(PodAffinity {
                preferred_during_scheduling_ignored_during_execution: Some(preferred),
                required_during_scheduling_ignored_during_execution: match required.is_empty() {
                    true => None,
                    false => Some(required),
                },
            }),
            ..Default::default()
        }),
        ..Default::default()
    });
    pod
}

pub fn pod_with_anti_affinity(
    name: &str,
    ns: &str,
    labels: &[(&str, &str)],
    preferred: Vec<WeightedPodAffinityTerm>,
) -> Pod {
    let mut pod = test_pod(name, ns, labels);
    pod.spec = Some(PodSpec {
        affinity: Some(Affinity {
            pod_anti_affinity: Some(PodAntiAffinity {
                preferred_during_scheduling_ignored_during_execution: Some(preferred),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    });
    pod
}

pub fn node_info(name: &str, labels: &[(&str, &str)], pods: Vec<Pod>) -> NodeInfo {
    NodeInfo {
        node_name: name.to_string(),
        labels: label_map(labels),
        pods,
    }
}
