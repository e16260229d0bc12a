use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, LabelSelectorRequirement};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SelectorError {
    #[error("operator {operator} for key {key} requires at least one value")]
    MissingValues { key: String, operator: String },
    #[error("operator {operator} for key {key} does not take values")]
    UnexpectedValues { key: String, operator: String },
    #[error("unknown selector operator {operator} for key {key}")]
    UnknownOperator { key: String, operator: String },
}

/// Evaluates a label selector against a label set.
///
/// A `None` selector selects nothing. An empty selector selects everything.
/// Malformed requirements are reported even when an earlier requirement has
/// already failed to match, so that a bad selector is always surfaced.
pub fn selector_matches(
    selector: Option<&LabelSelector>,
    labels: &BTreeMap<String, String>,
) -> Result<bool, SelectorError> {
    let selector = match selector {
        Some(s) => s,
        None => return Ok(false),
    };

    let mut matched = true;

    if let Some(match_labels) = &selector.match_labels {
        for (key, value) in match_labels {
            if labels.get(key) != Some(value) {
                matched = false;
            }
        }
    }

    if let Some(expressions) = &selector.match_expressions {
        for requirement in expressions {
            if !requirement_matches(requirement, labels)? {
                matched = false;
            }
        }
    }

    Ok(matched)
}

fn requirement_matches(
    requirement: &LabelSelectorRequirement,
    labels: &BTreeMap<String, String>,
) -> Result<bool, SelectorError> {
    let values = requirement.values.as_deref().unwrap_or_default();
    let value = labels.get(&requirement.key);

    match requirement.operator.as_str() {
        "In" => {
            if values.is_empty() {
                return Err(SelectorError::MissingValues {
                    key: requirement.key.clone(),
                    operator: requirement.operator.clone(),
                });
            }
            Ok(value.is_some_and(|v| values.contains(v)))
        }
        "NotIn" => {
            if values.is_empty() {
                return Err(SelectorError::MissingValues {
                    key: requirement.key.clone(),
                    operator: requirement.operator.clone(),
                });
            }
            Ok(value.is_none_or(|v| !values.contains(v)))
        }
        "Exists" => {
            if !values.is_empty() {
                return Err(SelectorError::UnexpectedValues {
                    key: requirement.key.clone(),
                    operator: requirement.operator.clone(),
                });
            }
            Ok(value.is_some())
        }
        "DoesNotExist" => {
            if !values.is_empty() {
                return Err(SelectorError::UnexpectedValues {
                    key: requirement.key.clone(),
                    operator: requirement.operator.clone(),
                });
            }
            Ok(value.is_none())
        }
        _ => Err(SelectorError::UnknownOperator {
            key: requirement.key.clone(),
            operator: requirement.operator.clone(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::objects::label_selector;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn requirement(key: &str, operator: &str, values: &[&str]) -> LabelSelectorRequirement {
        LabelSelectorRequirement {
            key: key.to_string(),
            operator: operator.to_string(),
            values: match values.is_empty() {
                true => None,
                false => Some(values.iter().map(|v| v.to_string()).collect()),
            },
        }
    }

    #[test]
    fn test_nil_selector_matches_nothing() {
        assert_eq!(selector_matches(None, &labels(&[("app", "web")])), Ok(false));
    }

    #[test]
    fn test_empty_selector_matches_everything() {
        let selector = LabelSelector::default();
        assert_eq!(
            selector_matches(Some(&selector), &labels(&[("app", "web")])),
            Ok(true)
        );
        assert_eq!(selector_matches(Some(&selector), &labels(&[])), Ok(true));
    }

    #[test]
    fn test_match_labels() {
        let selector = label_selector(&[("app", "web")]);
        assert_eq!(
            selector_matches(Some(&selector), &labels(&[("app", "web"), ("env", "prod")])),
            Ok(true)
        );
        assert_eq!(
            selector_matches(Some(&selector), &labels(&[("app", "api")])),
            Ok(false)
        );
        assert_eq!(selector_matches(Some(&selector), &labels(&[])), Ok(false));
    }

    #[test]
    fn test_match_expressions() {
        let selector = LabelSelector {
            match_expressions: Some(vec![
                requirement("app", "In", &["web", "api"]),
                requirement("tier", "DoesNotExist", &[]),
            ]),
            ..Default::default()
        };
        assert_eq!(
            selector_matches(Some(&selector), &labels(&[("app", "api")])),
            Ok(true)
        );
        assert_eq!(
            selector_matches(Some(&selector), &labels(&[("app", "api"), ("tier", "db")])),
            Ok(false)
        );

        let selector = LabelSelector {
            match_expressions: Some(vec![requirement("env", "NotIn", &["dev"])]),
            ..Default::default()
        };
        // key absent counts as not-in
        assert_eq!(selector_matches(Some(&selector), &labels(&[])), Ok(true));

        let selector = LabelSelector {
            match_expressions: Some(vec![requirement("env", "Exists", &[])]),
            ..Default::default()
        };
        assert_eq!(
            selector_matches(Some(&selector), &labels(&[("env", "prod")])),
            Ok(true)
        );
        assert_eq!(selector_matches(Some(&selector), &labels(&[])), Ok(false));
    }

    #[test]
    fn test_malformed_requirements() {
        let selector = LabelSelector {
            match_expressions: Some(vec![requirement("app", "In", &[])]),
            ..Default::default()
        };
        assert!(matches!(
            selector_matches(Some(&selector), &labels(&[])),
            Err(SelectorError::MissingValues { .. })
        ));

        let selector = LabelSelector {
            match_expressions: Some(vec![requirement("app", "Exists", &["web"])]),
            ..Default::default()
        };
        assert!(matches!(
            selector_matches(Some(&selector), &labels(&[])),
            Err(SelectorError::UnexpectedValues { .. })
        ));

        let selector = LabelSelector {
            match_expressions: Some(vec![requirement("app", "Near", &["web"])]),
            ..Default::default()
        };
        assert!(matches!(
            selector_matches(Some(&selector), &labels(&[])),
            Err(SelectorError::UnknownOperator { .. })
        ));
    }

    #[test]
    fn test_malformed_requirement_reported_after_non_match() {
        // A selector that already failed on match_labels must still surface a
        // later malformed expression.
        let selector = LabelSelector {
            match_labels: Some(labels(&[("app", "web")])),
            match_expressions: Some(vec![requirement("env", "In", &[])]),
        };
        assert!(matches!(
            selector_matches(Some(&selector), &labels(&[("app", "api")])),
            Err(SelectorError::MissingValues { .. })
        ));
    }
}
