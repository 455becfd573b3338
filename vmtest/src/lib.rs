// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Host-side helpers for VM integration tests.
//!
//! `vmtest` drives a guest over the OpenSSH client binaries: it waits for a
//! guest to come up (or go down), runs commands and copies files, and runs a
//! test script on the guest while polling a status file for the verdict.

pub mod config;
pub mod inspect;
pub mod locate;
pub mod probe;
pub mod runner;
pub mod shell;
pub mod status;
pub mod wait;

#[cfg(test)]
mod test_support;

pub use config::HarnessConfig;
pub use runner::JobContext;
pub use runner::RemoteScriptJob;
pub use runner::ScriptRunner;
pub use shell::CopyDirection;
pub use shell::GuestEndpoint;
pub use shell::RemoteShell;
pub use shell::ShellError;
pub use shell::SshClient;
pub use status::JobOutcome;
pub use status::TerminalStatus;

use jiff::Timestamp;
use std::process::Command;
use std::process::Stdio;
use thiserror::Error;

/// Error running command
#[derive(Error, Debug)]
pub enum CommandError {
    /// failed to launch command
    #[error("failed to launch command")]
    Launch(#[from] std::io::Error),
    /// command exited with non-zero status
    #[error("command exited with non-zero status ({0}): {1}")]
    Command(std::process::ExitStatus, String),
    /// command output is not utf-8
    #[error("command output is not utf-8")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// Run a command on the host and return the output
pub fn run_host_cmd(mut cmd: Command) -> Result<String, CommandError> {
    cmd.stderr(Stdio::piped())
        .stdout(Stdio::piped())
        .stdin(Stdio::null());

    let cmd_debug = format!("{cmd:?}");
    tracing::debug!(cmd = cmd_debug, "executing command");

    let start = Timestamp::now();
    let output = cmd.output()?;
    let time_elapsed = Timestamp::now() - start;

    let stdout_str = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr_str = String::from_utf8_lossy(&output.stderr).to_string();
    tracing::debug!(
        cmd = cmd_debug,
        stdout_str,
        stderr_str,
        "command exited in {:.3}s with status {}",
        time_elapsed.total(jiff::Unit::Second).unwrap_or_default(),
        output.status
    );

    if !output.status.success() {
        return Err(CommandError::Command(output.status, stderr_str));
    }

    Ok(String::from_utf8(output.stdout)?.trim().to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn host_cmd_trims_stdout() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo '  hello  '"]);
        assert_eq!(run_host_cmd(cmd).unwrap(), "hello");
    }

    #[cfg(unix)]
    #[test]
    fn host_cmd_reports_stderr_on_failure() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo oops >&2; exit 3"]);
        match run_host_cmd(cmd) {
            Err(CommandError::Command(status, stderr)) => {
                assert_eq!(status.code(), Some(3));
                assert_eq!(stderr.trim(), "oops");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn host_cmd_missing_binary_is_launch_error() {
        let cmd = Command::new("vmtest-definitely-not-a-real-binary");
        assert!(matches!(run_host_cmd(cmd), Err(CommandError::Launch(_))));
    }
}
