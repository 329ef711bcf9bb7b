use anyhow::{anyhow, Context, Result};

use std::path::Path;
use std::{fs, time::Duration};
use subprocess::{ExitStatus, Popen, PopenConfig, Redirection};
use tempfile::NamedTempFile;

/// Result of a program invocation.
pub struct RunResult {
    /// Captured stdout.
    pub output: Vec<u8>,
    /// Exit status, if the program terminated in time.
    pub status: Option<ExitStatus>,
}

impl RunResult {
    /// `true` if the test case terminates.
    pub fn terminated(&self) -> bool {
        self.status.is_some()
    }

    /// `true` if the program was killed by a signal.
    pub fn crashed(&self) -> bool {
        matches!(self.status, Some(ExitStatus::Signaled(_)))
    }

    /// `true` if the program exited normally with code 0.
    pub fn succeeded(&self) -> bool {
        self.status.is_some_and(|s| s.success())
    }
}

/// run a program on one test case for a bounded number of seconds
///
/// # Arguments
/// - `program`: the program to run; it receives the path of a file holding the test case
/// - `test_case`: the raw bytes of the test case
/// - `timeout`: number of seconds before we kill the program; defaults to 5
///
/// # Notes
/// We will *ignore* stderr and *return* stdout.
pub fn run(program: &Path, test_case: &[u8], timeout: Option<u64>) -> Result<RunResult> {
    // We dump the test case to a temporary file
    let file = NamedTempFile::new()?;
    fs::write(&file, test_case)?;

    let case_path = file
        .path()
        .to_str()
        .ok_or(anyhow!("Unable to coerce temp path into string."))?;
    let program_path = program
        .to_str()
        .ok_or(anyhow!("Unable to coerce program path into string."))?;

    let mut p = Popen::create(
        &[program_path, case_path],
        PopenConfig {
            stdout: Redirection::Pipe,
            stderr: Redirection::Pipe,
            ..Default::default()
        },
    )
    .with_context(|| format!("failed to start {}", program.display()))?;

    let limit = Duration::from_secs(timeout.unwrap_or(5));
    let mut communicator = p.communicate_start(None).limit_time(limit);
    let output = match communicator.read() {
        Ok((out, _)) => out,
        Err(err) => err.capture.0,
    }
    .unwrap_or_default();

    // stdout may close a moment before the process is reaped.
    let status = p.wait_timeout(Duration::from_millis(100))?;
    if status.is_none() {
        p.kill()?;
        p.wait()?;
    }

    Ok(RunResult { output, status })
}
