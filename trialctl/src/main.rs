//! trialctl command line.
//!
//! `trialctl patch` prints the manifests of a completed trial: the input
//! resources with the trial's parameter assignments patched in.

use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::debug;

use trialctl::core::trial::TrialSelector;
use trialctl::exit_codes;
use trialctl::io::api::HttpApi;
use trialctl::io::config::{DEFAULT_CONFIG_PATH, TrialctlConfig, load_config};
use trialctl::io::generator::CommandGenerator;
use trialctl::patch::{PatchOptions, run_patch};

#[derive(Parser)]
#[command(
    name = "trialctl",
    version,
    about = "Render and deploy experiment trials"
)]
struct Cli {
    /// Configuration file.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Remote API address, overriding `api.address` from the config file.
    #[arg(long, global = true)]
    address: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a patched manifest using the parameters of a completed trial.
    Patch {
        /// Experiment and related manifests to patch, `-` for stdin.
        #[arg(short = 'f', long = "file", required = true)]
        files: Vec<String>,

        /// Trial number.
        #[arg(long = "trialnumber", default_value_t = -1, allow_negative_numbers = true)]
        trial_number: i64,

        /// Trial name; its trailing number identifies the trial.
        #[arg(long = "trialname", default_value = "")]
        trial_name: String,
    },
}

fn main() {
    trialctl::logging::init("warn");
    if let Err(err) = run() {
        eprintln!("{err:#}");
        std::process::exit(exit_codes::for_error(&err));
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli.config)?.with_address(cli.address);
    match cli.command {
        Command::Patch {
            files,
            trial_number,
            trial_name,
        } => cmd_patch(&config, files, trial_number, &trial_name),
    }
}

fn cmd_patch(
    config: &TrialctlConfig,
    files: Vec<String>,
    trial_number: i64,
    trial_name: &str,
) -> Result<()> {
    let trial = TrialSelector::from_flags(trial_name, trial_number)?;
    // A bad identifier fails before the API client is even configured.
    trial.number()?;
    let opts = PatchOptions { files, trial };
    let api = HttpApi::new(&config.api, &config.controller)?;
    let generator = CommandGenerator::new(config.generator.clone());

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("build tokio runtime")?;
    let output = runtime.block_on(run_patch(&opts, &api, &generator, std::io::stdin().lock()))?;
    debug!(bytes = output.len(), "composed manifest");

    let mut stdout = std::io::stdout().lock();
    stdout
        .write_all(output.as_bytes())
        .context("write manifest to stdout")?;
    if !output.ends_with('\n') {
        stdout.write_all(b"\n").context("write manifest to stdout")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_patch_with_name() {
        let cli = Cli::parse_from([
            "trialctl",
            "patch",
            "-f",
            "app.yaml",
            "--file",
            "-",
            "--trialname",
            "shop-7",
        ]);
        let Command::Patch {
            files,
            trial_number,
            trial_name,
        } = cli.command;
        assert_eq!(files, vec!["app.yaml", "-"]);
        assert_eq!(trial_number, -1);
        assert_eq!(trial_name, "shop-7");
        assert_eq!(cli.config, PathBuf::from(DEFAULT_CONFIG_PATH));
    }

    #[test]
    fn parse_global_flags_after_subcommand() {
        let cli = Cli::parse_from([
            "trialctl",
            "patch",
            "-f",
            "exp.yaml",
            "--trialnumber",
            "3",
            "--address",
            "http://localhost:8080",
        ]);
        assert_eq!(cli.address.as_deref(), Some("http://localhost:8080"));
        let Command::Patch { trial_number, .. } = cli.command;
        assert_eq!(trial_number, 3);
    }

    #[test]
    fn file_flag_is_required() {
        assert!(Cli::try_parse_from(["trialctl", "patch", "--trialnumber", "1"]).is_err());
    }
}
