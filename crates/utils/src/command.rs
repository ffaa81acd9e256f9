//! Helpers intended for [`std::process::Command`].

use std::process::{Command, ExitStatus, Stdio};

use anyhow::{Context, Result};

/// Helpers intended for [`std::process::Command`].
pub trait CommandRunExt {
    /// Log (at debug level) the full child commandline.
    fn log_debug(&mut self) -> &mut Self;

    /// Execute the child process, discarding stdout. On failure the
    /// captured stderr is included in the error.
    fn run_capture_stderr(&mut self) -> Result<()>;

    /// Execute the child process and return its stdout as a string.
    fn run_get_string(&mut self) -> Result<String>;

    /// The program and its arguments, quoted so the result could be pasted
    /// back into a shell.
    fn to_string_pretty(&self) -> String;
}

fn check_status(cmd: &str, status: ExitStatus, stderr: &[u8]) -> Result<()> {
    if status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(stderr);
    let stderr = stderr.trim();
    if stderr.is_empty() {
        anyhow::bail!("{cmd} failed: {status}")
    }
    anyhow::bail!("{cmd} failed: {status}: {stderr}")
}

impl CommandRunExt for Command {
    fn log_debug(&mut self) -> &mut Self {
        tracing::debug!("exec: {}", self.to_string_pretty());
        self
    }

    fn run_capture_stderr(&mut self) -> Result<()> {
        let cmd = self.to_string_pretty();
        let output = self
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .with_context(|| format!("Spawning {cmd}"))?;
        check_status(&cmd, output.status, &output.stderr)
    }

    fn run_get_string(&mut self) -> Result<String> {
        let cmd = self.to_string_pretty();
        let output = self
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .with_context(|| format!("Spawning {cmd}"))?;
        check_status(&cmd, output.status, &output.stderr)?;
        String::from_utf8(output.stdout).with_context(|| format!("Parsing output of {cmd}"))
    }

    fn to_string_pretty(&self) -> String {
        std::iter::once(self.get_program())
            .chain(self.get_args())
            .map(|arg| {
                let arg = arg.to_string_lossy();
                match shlex::try_quote(&arg) {
                    Ok(quoted) => quoted.into_owned(),
                    Err(_) => arg.into_owned(),
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}
