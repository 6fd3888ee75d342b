//! Stable exit codes for trialctl commands.

use crate::error::ErrorKind;

/// Command succeeded.
pub const OK: i32 = 0;
/// Configuration, I/O, or any other unclassified failure.
pub const FAILURE: i32 = 1;
/// An input manifest was unreadable or malformed.
pub const INPUT: i32 = 2;
/// Application, Experiment, or trial could not be resolved.
pub const RESOLUTION: i32 = 3;
/// A patch template failed to render.
pub const RENDER: i32 = 4;
/// The remote API rejected or failed a request.
pub const REMOTE_API: i32 = 5;

pub fn for_kind(kind: ErrorKind) -> i32 {
    match kind {
        ErrorKind::Input => INPUT,
        ErrorKind::Resolution => RESOLUTION,
        ErrorKind::Render => RENDER,
        ErrorKind::RemoteApi => REMOTE_API,
        ErrorKind::Deploy => FAILURE,
    }
}

/// Exit code for a top-level error, looking through `anyhow` context layers.
pub fn for_error(err: &anyhow::Error) -> i32 {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<crate::error::Error>())
        .map_or(FAILURE, |err| for_kind(err.kind()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use anyhow::Context;

    #[test]
    fn maps_wrapped_errors_by_kind() {
        let err = Err::<(), _>(Error::InvalidTrialIdentifier {
            name: "exp-x".to_string(),
        })
        .context("patch")
        .expect_err("error");
        assert_eq!(for_error(&err), RESOLUTION);
        assert_eq!(for_error(&anyhow::anyhow!("plain")), FAILURE);
    }
}
