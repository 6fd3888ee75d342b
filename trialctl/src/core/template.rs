//! Conversion between Experiments and their API-facing templates.
//!
//! A Scan uploads the template derived from a freshly generated Experiment; a
//! Run merges the stored template back so edits made through the API survive
//! regeneration.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::experiment::{Experiment, Metric, Parameter};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExperimentTemplate {
    #[serde(default)]
    pub parameters: Vec<TemplateParameter>,
    #[serde(default)]
    pub metrics: Vec<TemplateMetric>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParameterType {
    #[default]
    Int,
    Categorical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bounds {
    pub min: i64,
    pub max: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TemplateParameter {
    pub name: String,
    #[serde(rename = "type", default)]
    pub parameter_type: ParameterType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bounds: Option<Bounds>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baseline: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TemplateMetric {
    pub name: String,
    #[serde(default)]
    pub minimize: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
}

/// Project an Experiment onto its template representation.
pub fn experiment_to_template(experiment: &Experiment) -> ExperimentTemplate {
    ExperimentTemplate {
        parameters: experiment
            .spec
            .parameters
            .iter()
            .map(parameter_to_template)
            .collect(),
        metrics: experiment
            .spec
            .metrics
            .iter()
            .map(|metric| TemplateMetric {
                name: metric.name.clone(),
                minimize: metric.minimize,
                query: metric.query.clone(),
            })
            .collect(),
    }
}

fn parameter_to_template(param: &Parameter) -> TemplateParameter {
    if param.values.is_empty() {
        TemplateParameter {
            name: param.name.clone(),
            parameter_type: ParameterType::Int,
            bounds: param.bounds().map(|(min, max)| Bounds { min, max }),
            baseline: param.baseline.clone(),
            values: Vec::new(),
        }
    } else {
        TemplateParameter {
            name: param.name.clone(),
            parameter_type: ParameterType::Categorical,
            bounds: None,
            baseline: param.baseline.clone(),
            values: param.values.clone(),
        }
    }
}

/// Overlay stored template values onto `experiment`.
///
/// Stored values win for entries present on both sides; entries only in the
/// template are appended in template order.
pub fn apply_template(experiment: &mut Experiment, template: &ExperimentTemplate) {
    for stored in &template.parameters {
        match experiment
            .spec
            .parameters
            .iter_mut()
            .find(|param| param.name == stored.name)
        {
            Some(param) => overlay_parameter(param, stored),
            None => {
                let mut param = Parameter {
                    name: stored.name.clone(),
                    ..Parameter::default()
                };
                overlay_parameter(&mut param, stored);
                experiment.spec.parameters.push(param);
            }
        }
    }

    for stored in &template.metrics {
        match experiment
            .spec
            .metrics
            .iter_mut()
            .find(|metric| metric.name == stored.name)
        {
            Some(metric) => {
                metric.minimize = stored.minimize;
                if stored.query.is_some() {
                    metric.query.clone_from(&stored.query);
                }
            }
            None => experiment.spec.metrics.push(Metric {
                name: stored.name.clone(),
                minimize: stored.minimize,
                query: stored.query.clone(),
                ..Metric::default()
            }),
        }
    }
}

fn overlay_parameter(param: &mut Parameter, stored: &TemplateParameter) {
    if let Some(bounds) = stored.bounds {
        param.min = Some(bounds.min);
        param.max = Some(bounds.max);
    }
    if stored.baseline.is_some() {
        param.baseline.clone_from(&stored.baseline);
    }
    if !stored.values.is_empty() {
        param.values.clone_from(&stored.values);
    }
}
