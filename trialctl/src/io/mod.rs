//! Side-effecting collaborators: config, inputs, processes, remote API, cluster.

pub mod api;
pub mod cluster;
pub mod config;
pub mod generator;
pub mod input;
pub mod process;
