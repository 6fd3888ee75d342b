//! Error types shared by the patch pipeline, the deployer, and the orchestrator.

/// The result type used throughout trialctl.
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of an [`Error`], used for exit codes and reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Input,
    Resolution,
    Render,
    Deploy,
    RemoteApi,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Input => "input",
            ErrorKind::Resolution => "resolution",
            ErrorKind::Render => "render",
            ErrorKind::Deploy => "deploy",
            ErrorKind::RemoteApi => "remote_api",
        }
    }
}

/// Errors produced while resolving, rendering, or deploying trial resources.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A manifest source could not be read or is not valid YAML.
    #[error("invalid input {source_name}: {message}")]
    Input {
        source_name: String,
        message: String,
    },

    /// A required object (application, experiment, scenario link) is missing.
    #[error("{0}")]
    Resolution(String),

    /// The trial name does not end in a base-10 number.
    #[error("invalid trial identifier {name:?}: expected a numeric suffix after the last '-'")]
    InvalidTrialIdentifier { name: String },

    /// No completed trial carries the requested number.
    #[error("trial not found: experiment {experiment} has no completed trial {number}")]
    TrialNotFound { experiment: String, number: u64 },

    /// The experiment lookup did not return a trials collection.
    #[error("unable to identify trial: experiment {experiment} has no trials URL")]
    UnresolvableTrial { experiment: String },

    /// Template execution failed.
    #[error("render {template}: {message}")]
    Render { template: String, message: String },

    /// A rendered patch body is not a JSON object.
    #[error("malformed patch {key}: {message}")]
    MalformedPatch { key: String, message: String },

    /// A rendered target reference is missing its kind or name.
    #[error("patch {key} renders an empty target ({field} is empty)")]
    EmptyTarget { key: String, field: &'static str },

    /// A cluster Get/Create/Update call failed.
    #[error("{resource}: {operation}: {message}")]
    Deploy {
        resource: &'static str,
        operation: &'static str,
        message: String,
    },

    /// A call to the remote API failed.
    #[error("remote api {operation}: {message}")]
    RemoteApi {
        operation: &'static str,
        message: String,
    },
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Input { .. } => ErrorKind::Input,
            Error::Resolution(_)
            | Error::InvalidTrialIdentifier { .. }
            | Error::TrialNotFound { .. }
            | Error::UnresolvableTrial { .. } => ErrorKind::Resolution,
            Error::Render { .. } | Error::MalformedPatch { .. } | Error::EmptyTarget { .. } => {
                ErrorKind::Render
            }
            Error::Deploy { .. } => ErrorKind::Deploy,
            Error::RemoteApi { .. } => ErrorKind::RemoteApi,
        }
    }

    pub(crate) fn input(source_name: impl Into<String>, message: impl ToString) -> Self {
        Error::Input {
            source_name: source_name.into(),
            message: message.to_string(),
        }
    }

    pub(crate) fn remote(operation: &'static str, message: impl ToString) -> Self {
        Error::RemoteApi {
            operation,
            message: message.to_string(),
        }
    }
}
