//! Bounded execution of external commands (the experiment generator).

use std::io::{self, Read, Write};
use std::process::{Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use tracing::{debug, instrument, warn};
use wait_timeout::ChildExt;

use crate::io::config::GeneratorConfig;

/// Wall-clock and memory bounds for one command run.
#[derive(Debug, Clone, Copy)]
pub struct RunLimits {
    pub timeout: Duration,
    /// Per stream; bytes past the limit are drained and counted, not stored.
    pub output_limit_bytes: usize,
}

impl From<&GeneratorConfig> for RunLimits {
    fn from(config: &GeneratorConfig) -> Self {
        Self {
            timeout: config.timeout(),
            output_limit_bytes: config.output_limit_bytes,
        }
    }
}

/// One captured output stream.
#[derive(Debug, Default)]
pub struct Captured {
    pub bytes: Vec<u8>,
    pub truncated: u64,
}

impl Captured {
    pub fn lossy(&self) -> String {
        String::from_utf8_lossy(&self.bytes).trim().to_string()
    }
}

#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Captured,
    pub stderr: Captured,
    pub timed_out: bool,
}

impl CommandOutput {
    /// Fail unless the command exited zero, in time, with its full stdout kept.
    pub fn ensure_success(self, label: &str) -> Result<Self> {
        if self.timed_out {
            bail!("{label} timed out");
        }
        if !self.status.success() {
            bail!("{label} exited with {}: {}", self.status, self.stderr.lossy());
        }
        if self.stdout.truncated > 0 {
            bail!("{label} output exceeded the limit by {} bytes", self.stdout.truncated);
        }
        Ok(self)
    }
}

/// Run `cmd`, feeding it `stdin`, and capture both output streams within `limits`.
///
/// Stdin is written from its own thread and both pipes are drained
/// concurrently, so the timeout holds even for a child that never reads its
/// input.
#[instrument(skip_all, fields(program = ?cmd.get_program(), timeout_secs = limits.timeout.as_secs()))]
pub fn run_bounded(mut cmd: Command, stdin: Option<Vec<u8>>, limits: RunLimits) -> Result<CommandOutput> {
    cmd.stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = cmd
        .spawn()
        .with_context(|| format!("spawn {:?}", cmd.get_program()))?;

    let stdout = child.stdout.take().context("stdout was not piped")?;
    let stderr = child.stderr.take().context("stderr was not piped")?;
    let stdout_reader = spawn_capture(stdout, limits.output_limit_bytes);
    let stderr_reader = spawn_capture(stderr, limits.output_limit_bytes);

    let writer = match stdin {
        Some(input) => {
            let mut pipe = child.stdin.take().context("stdin was not piped")?;
            Some(thread::spawn(move || {
                if let Err(err) = pipe.write_all(&input) {
                    warn!(error = %err, "child closed stdin early");
                }
            }))
        }
        None => None,
    };

    let (status, timed_out) = match child.wait_timeout(limits.timeout).context("wait for command")? {
        Some(status) => (status, false),
        None => {
            warn!(timeout_secs = limits.timeout.as_secs(), "command timed out, killing");
            child.kill().context("kill command")?;
            (child.wait().context("wait for killed command")?, true)
        }
    };

    if let Some(writer) = writer {
        writer.join().map_err(|_| anyhow!("stdin writer panicked"))?;
    }
    let stdout = join_capture(stdout_reader).context("capture stdout")?;
    let stderr = join_capture(stderr_reader).context("capture stderr")?;

    debug!(
        exit_code = ?status.code(),
        timed_out,
        stdout_bytes = stdout.bytes.len(),
        stdout_truncated = stdout.truncated,
        "command finished"
    );
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        timed_out,
    })
}

fn spawn_capture<R: Read + Send + 'static>(reader: R, limit: usize) -> JoinHandle<io::Result<Captured>> {
    thread::spawn(move || capture_limited(reader, limit))
}

fn join_capture(handle: JoinHandle<io::Result<Captured>>) -> Result<Captured> {
    handle
        .join()
        .map_err(|_| anyhow!("output reader panicked"))?
        .map_err(Into::into)
}

fn capture_limited<R: Read>(mut reader: R, limit: usize) -> io::Result<Captured> {
    let mut bytes = Vec::new();
    (&mut reader).take(limit as u64).read_to_end(&mut bytes)?;
    // Keep draining so the child never blocks on a full pipe.
    let truncated = io::copy(&mut reader, &mut io::sink())?;
    Ok(Captured { bytes, truncated })
}
