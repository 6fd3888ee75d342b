//! Trial patching and activity-driven experiment orchestration.
//!
//! The crate turns abstract trial parameter assignments into concrete,
//! target-scoped patches over a set of manifests, and drives the deployment of
//! generated experiments in response to remote activity notifications.
//!
//! - **[`core`]**: Pure, deterministic logic (manifests, trial selection, patch
//!   rendering, overlay composition, template conversion). No I/O.
//! - **[`io`]**: Side-effecting collaborators (config, input files, child
//!   processes, the remote API, the cluster). Each sits behind a trait so tests
//!   can substitute in-memory fakes.
//!
//! Orchestration modules ([`patch`], [`deploy`], [`orchestrator`]) combine the
//! two to implement the `trialctl patch` command and the controller loop.

pub mod core;
pub mod deploy;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod orchestrator;
pub mod patch;
pub mod shutdown;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
