//! Experiment generation from an Application descriptor.

use std::process::Command;

use tracing::{debug, instrument};

use crate::core::application::Application;
use crate::error::{Error, Result};
use crate::io::config::GeneratorConfig;
use crate::io::process::{RunLimits, run_bounded};

/// Environment variable carrying the default container-resource selectors.
pub const SELECTORS_ENV: &str = "TRIALCTL_CONTAINER_SELECTORS";

/// Renders an Application into concrete manifests (Experiment plus supporting
/// RBAC and ConfigMap documents).
pub trait Generator: Send + Sync {
    fn generate(&self, app: &Application) -> Result<Vec<u8>>;
}

/// Generator backed by an external command.
///
/// The Application is written to stdin as YAML; the command prints a
/// multi-document manifest stream on stdout.
#[derive(Debug, Clone)]
pub struct CommandGenerator {
    config: GeneratorConfig,
}

impl CommandGenerator {
    pub fn new(config: GeneratorConfig) -> Self {
        Self { config }
    }

    fn render_error(&self, message: impl ToString) -> Error {
        Error::Render {
            template: "generator".to_string(),
            message: message.to_string(),
        }
    }
}

impl Generator for CommandGenerator {
    #[instrument(skip_all, fields(application = %app.metadata.name))]
    fn generate(&self, app: &Application) -> Result<Vec<u8>> {
        let input = serde_yaml::to_string(app).map_err(|err| self.render_error(err))?;
        let selectors = serde_json::to_string(&app.container_resources_selectors())
            .map_err(|err| self.render_error(err))?;

        let (program, args) = self
            .config
            .command
            .split_first()
            .ok_or_else(|| self.render_error("generator command is empty"))?;
        let mut cmd = Command::new(program);
        cmd.args(args).env(SELECTORS_ENV, selectors);

        let output = run_bounded(cmd, Some(input.into_bytes()), RunLimits::from(&self.config))
            .and_then(|out| out.ensure_success(program))
            .map_err(|err| self.render_error(format!("{err:#}")))?;

        debug!(bytes = output.stdout.bytes.len(), "generated manifests");
        Ok(output.stdout.bytes)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::core::experiment::ObjectMeta;
    use serde_json::Map;

    fn app() -> Application {
        Application {
            api_version: crate::core::application::APPLICATION_API_VERSION.to_string(),
            kind: "Application".to_string(),
            metadata: ObjectMeta {
                name: "shop".to_string(),
                ..ObjectMeta::default()
            },
            resources: vec!["web.yaml".to_string()],
            parameters: None,
            scenarios: Vec::new(),
            objectives: Vec::new(),
            other: Map::new(),
        }
    }

    fn generator(script: &str) -> CommandGenerator {
        CommandGenerator::new(GeneratorConfig {
            command: vec!["sh".to_string(), "-c".to_string(), script.to_string()],
            ..GeneratorConfig::default()
        })
    }

    #[test]
    fn passes_application_on_stdin() {
        let out = generator("cat").generate(&app()).expect("generate");
        let text = String::from_utf8(out).expect("utf8");
        assert!(text.contains("name: shop"));
        assert!(text.contains("kind: Application"));
    }

    #[test]
    fn exposes_selectors_in_environment() {
        let out = generator("cat >/dev/null; printf %s \"$TRIALCTL_CONTAINER_SELECTORS\"")
            .generate(&app())
            .expect("generate");
        let selectors: serde_json::Value = serde_json::from_slice(&out).expect("json");
        assert_eq!(selectors[0]["kind"], "Deployment");
    }

    #[test]
    fn failing_command_is_render_error() {
        let err = generator("cat >/dev/null; echo nope >&2; exit 1")
            .generate(&app())
            .expect_err("failure");
        assert!(matches!(err, Error::Render { .. }));
        assert!(err.to_string().contains("nope"));
    }
}
