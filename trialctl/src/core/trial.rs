//! Trial identification and selection.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::core::activity::TrialItem;
use crate::core::experiment::Experiment;
use crate::error::{Error, Result};

/// How the caller identifies the trial to patch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrialSelector {
    /// A trial name such as `web-tuning-7`; the number is its trailing suffix.
    Name(String),
    Number(u64),
}

impl TrialSelector {
    /// Build a selector from CLI-style flags. A name wins over a number; a
    /// negative number means "unset".
    pub fn from_flags(name: &str, number: i64) -> Result<Self> {
        if !name.is_empty() {
            return Ok(TrialSelector::Name(name.to_string()));
        }
        u64::try_from(number)
            .map(TrialSelector::Number)
            .map_err(|_| Error::Resolution("a trial name or number must be specified".to_string()))
    }

    pub fn number(&self) -> Result<u64> {
        match self {
            TrialSelector::Name(name) => parse_trial_number(name),
            TrialSelector::Number(number) => Ok(*number),
        }
    }
}

/// Parse the ordinal from the segment after the last `-` (`"exp-7"` → 7).
///
/// Only ASCII digits are accepted, so signs and whitespace are rejected.
pub fn parse_trial_number(name: &str) -> Result<u64> {
    let suffix = name.rsplit_once('-').map_or(name, |(_, suffix)| suffix);
    if suffix.is_empty() || !suffix.bytes().all(|b| b.is_ascii_digit()) {
        return Err(Error::InvalidTrialIdentifier {
            name: name.to_string(),
        });
    }
    suffix
        .parse::<u64>()
        .map_err(|_| Error::InvalidTrialIdentifier {
            name: name.to_string(),
        })
}

/// First trial whose number matches.
pub fn select_trial<'a>(
    trials: &'a [TrialItem],
    number: u64,
    experiment: &str,
) -> Result<&'a TrialItem> {
    trials
        .iter()
        .find(|trial| trial.number == number)
        .ok_or_else(|| Error::TrialNotFound {
            experiment: experiment.to_string(),
            number,
        })
}

/// A trial resolved against its experiment, ready for template rendering.
#[derive(Debug, Clone, PartialEq)]
pub struct Trial {
    pub name: String,
    pub namespace: String,
    pub number: u64,
    pub assignments: BTreeMap<String, Value>,
}

impl Trial {
    pub fn from_item(experiment: &Experiment, item: &TrialItem) -> Self {
        let mut assignments: BTreeMap<String, Value> = experiment
            .spec
            .parameters
            .iter()
            .filter_map(|param| {
                param
                    .baseline
                    .clone()
                    .map(|baseline| (param.name.clone(), baseline))
            })
            .collect();
        for assignment in &item.assignments {
            assignments.insert(assignment.parameter_name.clone(), assignment.value.clone());
        }

        Self {
            name: format!("{}-{:03}", experiment.metadata.name, item.number),
            namespace: experiment.metadata.namespace.clone(),
            number: item.number,
            assignments,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::activity::Assignment;
    use crate::core::experiment::{ExperimentSpec, ObjectMeta, Parameter};
    use serde_json::json;

    fn trial(number: u64) -> TrialItem {
        TrialItem {
            number,
            status: None,
            assignments: Vec::new(),
            labels: BTreeMap::new(),
        }
    }

    #[test]
    fn parses_trailing_number() {
        assert_eq!(parse_trial_number("exp-7").expect("parse"), 7);
        assert_eq!(parse_trial_number("my-exp-0042").expect("parse"), 42);
        assert_eq!(parse_trial_number("12").expect("parse"), 12);
    }

    #[test]
    fn rejects_non_numeric_suffixes() {
        for name in ["exp-x", "exp-", "exp-+3", "exp- 3", "exp-3a", "exp--"] {
            let err = parse_trial_number(name).expect_err(name);
            assert!(
                matches!(err, Error::InvalidTrialIdentifier { .. }),
                "{name}: {err}"
            );
        }
    }

    #[test]
    fn selects_matching_number() {
        let trials = vec![trial(1), trial(7), trial(9)];
        let number = TrialSelector::Name("exp-7".to_string())
            .number()
            .expect("number");
        assert_eq!(select_trial(&trials, number, "exp").expect("found").number, 7);
    }

    #[test]
    fn missing_number_is_not_found() {
        let trials = vec![trial(1)];
        let err = select_trial(&trials, 3, "exp").expect_err("missing");
        assert!(matches!(err, Error::TrialNotFound { number: 3, .. }));
    }

    #[test]
    fn flags_prefer_name_and_require_one() {
        assert_eq!(
            TrialSelector::from_flags("exp-2", 5).expect("name"),
            TrialSelector::Name("exp-2".to_string())
        );
        assert_eq!(
            TrialSelector::from_flags("", 5).expect("number"),
            TrialSelector::Number(5)
        );
        assert!(TrialSelector::from_flags("", -1).is_err());
    }

    #[test]
    fn assignments_override_baselines() {
        let experiment = Experiment {
            api_version: "optimize.trialctl.dev/v1beta2".to_string(),
            kind: "Experiment".to_string(),
            metadata: ObjectMeta {
                name: "exp".to_string(),
                namespace: "default".to_string(),
                other: Default::default(),
            },
            spec: ExperimentSpec {
                parameters: vec![
                    Parameter {
                        name: "replicas".to_string(),
                        baseline: Some(json!(1)),
                        ..Parameter::default()
                    },
                    Parameter {
                        name: "cpu".to_string(),
                        baseline: Some(json!(250)),
                        ..Parameter::default()
                    },
                ],
                ..ExperimentSpec::default()
            },
            other: Default::default(),
        };
        let item = TrialItem {
            number: 4,
            status: None,
            assignments: vec![Assignment {
                parameter_name: "replicas".to_string(),
                value: json!(3),
            }],
            labels: BTreeMap::new(),
        };

        let trial = Trial::from_item(&experiment, &item);
        assert_eq!(trial.name, "exp-004");
        assert_eq!(trial.namespace, "default");
        assert_eq!(trial.assignments["replicas"], json!(3));
        assert_eq!(trial.assignments["cpu"], json!(250));
    }
}
