//! Deterministic, pure logic shared by the patch pipeline and the orchestrator.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod activity;
pub mod application;
pub mod experiment;
pub mod manifest;
pub mod overlay;
pub mod patch;
pub mod template;
pub mod trial;
