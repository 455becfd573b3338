// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Remote command channel to a guest.
//!
//! The [`RemoteShell`] trait is the seam the rest of the crate is written
//! against. [`SshClient`] implements it by invoking the OpenSSH `ssh` and
//! `scp` binaries found on the host.

use crate::CommandError;
use crate::run_host_cmd;
use std::ffi::OsString;
use std::path::Path;
use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;
use thiserror::Error;

/// One reachable guest machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestEndpoint {
    /// IPv4 address (or host name) of the guest.
    pub address: String,
    /// User to log in as.
    pub user: String,
    /// Private key used to authenticate.
    pub key: PathBuf,
}

impl GuestEndpoint {
    /// Creates a new endpoint.
    pub fn new(address: impl Into<String>, user: impl Into<String>, key: impl Into<PathBuf>) -> Self {
        Self {
            address: address.into(),
            user: user.into(),
            key: key.into(),
        }
    }

    /// The `user@address` login target.
    pub fn target(&self) -> String {
        format!("{}@{}", self.user, self.address)
    }

    /// Checks that the endpoint is usable before any remote call is made.
    pub fn validate(&self) -> Result<(), ShellError> {
        if self.address.trim().is_empty() {
            return Err(ShellError::InvalidEndpoint("address is empty"));
        }
        if self.user.trim().is_empty() {
            return Err(ShellError::InvalidEndpoint("user is empty"));
        }
        if self.key.as_os_str().is_empty() {
            return Err(ShellError::InvalidEndpoint("key path is empty"));
        }
        Ok(())
    }
}

/// Direction of a file transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyDirection {
    /// Host to guest.
    ToGuest,
    /// Guest to host.
    FromGuest,
}

/// Errors from the remote command channel.
#[derive(Error, Debug)]
pub enum ShellError {
    /// a client binary could not be found
    #[error("could not find the `{name}` client binary")]
    MissingClient {
        /// binary name
        name: &'static str,
        /// lookup failure
        #[source]
        source: which::Error,
    },
    /// the endpoint failed validation
    #[error("invalid guest endpoint: {0}")]
    InvalidEndpoint(&'static str),
    /// the local side of a transfer does not exist
    #[error("local path does not exist: {}", .0.display())]
    MissingLocalPath(PathBuf),
    /// the client process failed
    #[error("remote shell command failed")]
    Command(#[from] CommandError),
}

/// A channel that can run commands on, and copy files to and from, a guest.
pub trait RemoteShell {
    /// Runs `command` on the guest and returns its trimmed stdout.
    fn exec(&self, endpoint: &GuestEndpoint, command: &str) -> Result<String, ShellError>;

    /// Copies `local` to or from `remote`.
    ///
    /// Directories are copied recursively.
    fn copy(
        &self,
        endpoint: &GuestEndpoint,
        local: &Path,
        remote: &str,
        direction: CopyDirection,
    ) -> Result<(), ShellError>;
}

impl<T: RemoteShell + ?Sized> RemoteShell for &T {
    fn exec(&self, endpoint: &GuestEndpoint, command: &str) -> Result<String, ShellError> {
        (**self).exec(endpoint, command)
    }

    fn copy(
        &self,
        endpoint: &GuestEndpoint,
        local: &Path,
        remote: &str,
        direction: CopyDirection,
    ) -> Result<(), ShellError> {
        (**self).copy(endpoint, local, remote, direction)
    }
}

/// [`RemoteShell`] backed by the OpenSSH client binaries.
///
/// Host keys are trusted on first use: a guest seen for the first time is
/// added to the known hosts file without prompting, while a changed key for a
/// known guest is still rejected by `ssh`.
#[derive(Debug, Clone)]
pub struct SshClient {
    ssh: PathBuf,
    scp: PathBuf,
    port: u16,
    connect_timeout: Duration,
}

impl SshClient {
    /// Creates a client, resolving `ssh` and `scp` on `PATH` unless explicit
    /// paths are given.
    pub fn new(ssh: Option<PathBuf>, scp: Option<PathBuf>) -> Result<Self, ShellError> {
        let ssh = match ssh {
            Some(path) => path,
            None => which::which("ssh")
                .map_err(|source| ShellError::MissingClient { name: "ssh", source })?,
        };
        let scp = match scp {
            Some(path) => path,
            None => which::which("scp")
                .map_err(|source| ShellError::MissingClient { name: "scp", source })?,
        };
        Ok(Self {
            ssh,
            scp,
            port: 22,
            connect_timeout: Duration::from_secs(10),
        })
    }

    /// Sets the guest SSH port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Sets the connection phase timeout. Sub-second values round up to one
    /// second, which is the client's granularity.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    fn common_options(&self, endpoint: &GuestEndpoint) -> Vec<OsString> {
        let timeout_secs = self.connect_timeout.as_secs().max(1);
        let mut args: Vec<OsString> = vec!["-i".into(), endpoint.key.clone().into_os_string()];
        for option in [
            "StrictHostKeyChecking=accept-new".to_owned(),
            "BatchMode=yes".to_owned(),
            "LogLevel=ERROR".to_owned(),
            format!("ConnectTimeout={timeout_secs}"),
        ] {
            args.push("-o".into());
            args.push(option.into());
        }
        args
    }

    fn ssh_command(&self, endpoint: &GuestEndpoint, command: &str) -> Command {
        let mut cmd = Command::new(&self.ssh);
        cmd.args(self.common_options(endpoint))
            .arg("-p")
            .arg(self.port.to_string())
            .arg(endpoint.target())
            .arg("--")
            .arg(command);
        cmd
    }

    fn scp_command(
        &self,
        endpoint: &GuestEndpoint,
        local: &Path,
        remote: &str,
        direction: CopyDirection,
    ) -> Command {
        let remote = format!("{}:{remote}", endpoint.target());
        let mut cmd = Command::new(&self.scp);
        cmd.args(self.common_options(endpoint))
            .arg("-P")
            .arg(self.port.to_string());
        match direction {
            CopyDirection::ToGuest => {
                if local.is_dir() {
                    cmd.arg("-r");
                }
                cmd.arg(local).arg(remote);
            }
            CopyDirection::FromGuest => {
                // The remote side can't be inspected up front; `-r` is a
                // no-op for a plain file.
                cmd.arg("-r").arg(remote).arg(local);
            }
        }
        cmd
    }
}

impl RemoteShell for SshClient {
    fn exec(&self, endpoint: &GuestEndpoint, command: &str) -> Result<String, ShellError> {
        endpoint.validate()?;
        Ok(run_host_cmd(self.ssh_command(endpoint, command))?)
    }

    fn copy(
        &self,
        endpoint: &GuestEndpoint,
        local: &Path,
        remote: &str,
        direction: CopyDirection,
    ) -> Result<(), ShellError> {
        endpoint.validate()?;
        if direction == CopyDirection::ToGuest && !local.exists() {
            return Err(ShellError::MissingLocalPath(local.to_owned()));
        }
        run_host_cmd(self.scp_command(endpoint, local, remote, direction))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> SshClient {
        SshClient::new(Some("ssh".into()), Some("scp".into()))
            .unwrap()
            .with_port(2222)
            .with_connect_timeout(Duration::from_millis(200))
    }

    fn endpoint() -> GuestEndpoint {
        GuestEndpoint::new("10.0.0.5", "root", "ssh/id_rsa")
    }

    fn args(cmd: &Command) -> Vec<String> {
        cmd.get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn ssh_command_line() {
        let cmd = client().ssh_command(&endpoint(), "uname -a");
        assert_eq!(
            args(&cmd),
            [
                "-i",
                "ssh/id_rsa",
                "-o",
                "StrictHostKeyChecking=accept-new",
                "-o",
                "BatchMode=yes",
                "-o",
                "LogLevel=ERROR",
                "-o",
                "ConnectTimeout=1",
                "-p",
                "2222",
                "root@10.0.0.5",
                "--",
                "uname -a",
            ]
        );
    }

    #[test]
    fn scp_directory_to_guest_is_recursive() {
        let dir = tempfile::tempdir().unwrap();
        let cmd = client().scp_command(&endpoint(), dir.path(), "scripts", CopyDirection::ToGuest);
        let args = args(&cmd);
        assert!(args.contains(&"-r".to_owned()));
        assert_eq!(args.last().unwrap(), "root@10.0.0.5:scripts");
    }

    #[test]
    fn scp_file_to_guest_is_not_recursive() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("test.sh");
        fs_err::write(&file, "echo hi").unwrap();
        let cmd = client().scp_command(&endpoint(), &file, "test.sh", CopyDirection::ToGuest);
        assert!(!args(&cmd).contains(&"-r".to_owned()));
    }

    #[test]
    fn scp_from_guest_puts_remote_first() {
        let cmd = client().scp_command(
            &endpoint(),
            Path::new("state.txt"),
            "state.txt",
            CopyDirection::FromGuest,
        );
        let args = args(&cmd);
        let n = args.len();
        assert_eq!(args[n - 2], "root@10.0.0.5:state.txt");
        assert_eq!(args[n - 1], "state.txt");
    }

    #[test]
    fn invalid_endpoint_is_rejected_before_spawning() {
        let bad = GuestEndpoint::new("", "root", "ssh/id_rsa");
        assert!(matches!(
            client().exec(&bad, "true"),
            Err(ShellError::InvalidEndpoint(_))
        ));
    }

    #[test]
    fn missing_local_source_is_rejected() {
        let err = client()
            .copy(
                &endpoint(),
                Path::new("/nonexistent/vmtest/file"),
                "file",
                CopyDirection::ToGuest,
            )
            .unwrap_err();
        assert!(matches!(err, ShellError::MissingLocalPath(_)));
    }
}
