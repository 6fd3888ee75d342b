//! `trialctl patch`: compose a trial-specific manifest from local inputs.
//!
//! Inputs are aggregated into an in-memory file set. When an Application is
//! present it defines the resource set and its generated assets supply the
//! Experiment; otherwise the Experiment must be among the inputs. The
//! requested completed trial is fetched from the remote API, its patches are
//! rendered, and the overlay of resources and patches is returned as YAML.

use std::io::Read;

use tracing::{debug, info, instrument};

use crate::core::activity::{TrialItem, TrialListQuery};
use crate::core::application::Application;
use crate::core::experiment::Experiment;
use crate::core::manifest::{ManifestSet, ResourceKind, aggregate, extract_single};
use crate::core::overlay::{Composer, FileSet, MemoryFileSet, OverlayComposer};
use crate::core::patch::PatchRenderer;
use crate::core::trial::{Trial, TrialSelector, select_trial};
use crate::error::{Error, Result};
use crate::io::api::ExperimentsApi;
use crate::io::generator::Generator;
use crate::io::input::read_inputs;

/// Options for [`run_patch`].
#[derive(Debug, Clone)]
pub struct PatchOptions {
    /// Input paths; `-` reads standard input.
    pub files: Vec<String>,
    pub trial: TrialSelector,
}

/// Run the batch patch pipeline and return the composed manifest.
///
/// Fails fast: nothing is returned unless every stage succeeds.
#[instrument(skip_all, fields(inputs = opts.files.len()))]
pub async fn run_patch<R: Read>(
    opts: &PatchOptions,
    api: &dyn ExperimentsApi,
    generator: &dyn Generator,
    stdin: R,
) -> Result<String> {
    // Reject a malformed identifier before touching the API.
    let number = opts.trial.number()?;

    let mut files = MemoryFileSet::new();
    let input_names = read_inputs(&opts.files, stdin, &mut files)?;
    let inputs = aggregate(&files, &input_names)?;

    let application: Option<Application> = extract_single(&inputs, &ResourceKind::Application)?;
    let input_experiment: Option<Experiment> = extract_single(&inputs, &ResourceKind::Experiment)?;

    let (resources, experiment) = match application {
        Some(app) => {
            info!(application = %app.metadata.name, "generating experiment from application");
            let mut resources = app.resource_names();
            let generated = write_generated_assets(&mut files, &mut resources, generator, &app)?;
            (resources, generated.or(input_experiment))
        }
        None => (input_names, input_experiment),
    };
    let experiment = experiment.ok_or_else(|| {
        Error::Resolution("unable to identify an experiment or application".to_string())
    })?;

    let item = resolve_trial(api, &experiment.metadata.name, number).await?;
    let trial = Trial::from_item(&experiment, &item);
    debug!(trial = %trial.name, "resolved trial");

    let patches = PatchRenderer::new().render_all(&experiment.spec.patches, &trial)?;
    OverlayComposer.compose(&files, &resources, &patches)
}

/// Run the generator and store every generated document as
/// `application-assets<idx>.yaml`. Returns the first generated Experiment.
fn write_generated_assets(
    files: &mut MemoryFileSet,
    resources: &mut Vec<String>,
    generator: &dyn Generator,
    app: &Application,
) -> Result<Option<Experiment>> {
    let generated = generator.generate(app)?;
    let assets = ManifestSet::from_bytes("generated assets", &generated)?;

    let mut experiment = None;
    for (idx, doc) in assets.documents().iter().enumerate() {
        let name = format!("application-assets{idx}.yaml");
        let yaml = serde_yaml::to_string(&doc.value).map_err(|err| Error::input(&name, err))?;
        files.write(&name, yaml.into_bytes());
        resources.push(name);

        if experiment.is_none() && doc.kind == ResourceKind::Experiment {
            let parsed: Experiment = serde_json::from_value(doc.value.clone())
                .map_err(|err| Error::input("generated experiment", err))?;
            experiment = Some(parsed);
        }
    }
    Ok(experiment)
}

/// Find the completed trial numbered `number` of experiment `experiment`.
#[instrument(skip(api))]
pub async fn resolve_trial(
    api: &dyn ExperimentsApi,
    experiment: &str,
    number: u64,
) -> Result<TrialItem> {
    let item = api.get_experiment_by_name(experiment).await?;
    if item.trials_url.is_empty() {
        return Err(Error::UnresolvableTrial {
            experiment: experiment.to_string(),
        });
    }
    let list = api
        .get_all_trials(&item.trials_url, &TrialListQuery::completed())
        .await?;
    select_trial(&list.trials, number, experiment).cloned()
}
