// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Harness configuration.
//!
//! Every field has a default, so an empty JSON object (or no file at all) is
//! a valid configuration.

use crate::runner::RunnerSettings;
use crate::shell::GuestEndpoint;
use crate::shell::ShellError;
use crate::shell::SshClient;
use crate::wait::WaitSettings;
use serde::Deserialize;
use serde::Serialize;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors loading a configuration file.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// the file could not be read
    #[error("failed to read config file")]
    Read(#[source] std::io::Error),
    /// the file is not valid JSON for [`HarnessConfig`]
    #[error("failed to parse config file")]
    Parse(#[source] serde_json::Error),
}

/// Layout of the local harness and timing budgets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HarnessConfig {
    /// Directory holding private keys.
    pub key_dir: PathBuf,
    /// Directory holding guest-bound test scripts.
    pub script_dir: PathBuf,
    /// Directory for transient staging files.
    pub work_dir: PathBuf,
    /// Where retrieved logs are moved. Logs stay in `work_dir` when unset.
    pub log_dir: Option<PathBuf>,
    /// Guest login user.
    pub user: String,
    /// Guest SSH port.
    pub ssh_port: u16,
    /// Explicit `ssh` binary; looked up on `PATH` when unset.
    pub ssh_binary: Option<PathBuf>,
    /// Explicit `scp` binary; looked up on `PATH` when unset.
    pub scp_binary: Option<PathBuf>,
    /// Connection phase timeout for the ssh client.
    pub connect_timeout_secs: u64,
    /// Pause between status file fetches.
    pub poll_interval_secs: u64,
    /// Number of non-terminal status reads before a job times out.
    pub poll_budget: u32,
    /// Timeout of a single port probe.
    pub probe_timeout_secs: u64,
    /// Pause between readiness attempts.
    pub wait_interval_secs: u64,
    /// Overall readiness budget.
    pub wait_timeout_secs: u64,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            key_dir: "ssh".into(),
            script_dir: "remote-scripts".into(),
            work_dir: ".".into(),
            log_dir: None,
            user: "root".into(),
            ssh_port: 22,
            ssh_binary: None,
            scp_binary: None,
            connect_timeout_secs: 10,
            poll_interval_secs: 5,
            poll_budget: 600,
            probe_timeout_secs: 2,
            wait_interval_secs: 5,
            wait_timeout_secs: 300,
        }
    }
}

impl HarnessConfig {
    /// Loads a configuration from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = fs_err::read_to_string(path.as_ref()).map_err(ConfigError::Read)?;
        Self::from_json(&text)
    }

    /// Parses a configuration from JSON text.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(text).map_err(ConfigError::Parse)
    }

    /// Builds the endpoint for `address` using the key named `key_name` in
    /// the key directory.
    pub fn endpoint(&self, address: &str, key_name: &str) -> GuestEndpoint {
        GuestEndpoint::new(address, self.user.clone(), self.key_dir.join(key_name))
    }

    /// Builds an ssh client with this configuration's transport options.
    pub fn ssh_client(&self) -> Result<SshClient, ShellError> {
        Ok(
            SshClient::new(self.ssh_binary.clone(), self.scp_binary.clone())?
                .with_port(self.ssh_port)
                .with_connect_timeout(Duration::from_secs(self.connect_timeout_secs)),
        )
    }

    /// Readiness waiter settings.
    pub fn wait_settings(&self) -> WaitSettings {
        WaitSettings {
            overall: Duration::from_secs(self.wait_timeout_secs),
            attempt_cost: Duration::from_secs(self.probe_timeout_secs),
            interval: Duration::from_secs(self.wait_interval_secs),
        }
    }

    /// Script runner settings.
    pub fn runner_settings(&self) -> RunnerSettings {
        RunnerSettings {
            script_dir: self.script_dir.clone(),
            work_dir: self.work_dir.clone(),
            log_dir: self.log_dir.clone(),
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            poll_budget: self.poll_budget,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_is_default() {
        assert_eq!(HarnessConfig::from_json("{}").unwrap(), HarnessConfig::default());
    }

    #[test]
    fn fields_override_defaults() {
        let config = HarnessConfig::from_json(
            r#"{ "user": "tester", "log_dir": "logs", "poll_budget": 3, "ssh_port": 2222 }"#,
        )
        .unwrap();
        assert_eq!(config.user, "tester");
        assert_eq!(config.log_dir, Some(PathBuf::from("logs")));
        assert_eq!(config.poll_budget, 3);
        assert_eq!(config.ssh_port, 2222);
        assert_eq!(config.script_dir, PathBuf::from("remote-scripts"));
    }

    #[test]
    fn unknown_field_is_rejected() {
        assert!(matches!(
            HarnessConfig::from_json(r#"{ "pol_budget": 3 }"#),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("harness.json");
        fs_err::write(&path, r#"{ "key_dir": "keys" }"#).unwrap();
        let config = HarnessConfig::load(&path).unwrap();
        let endpoint = config.endpoint("10.1.1.1", "id_rsa");
        assert_eq!(endpoint.key, Path::new("keys").join("id_rsa"));
        assert_eq!(endpoint.user, "root");
    }

    #[test]
    fn missing_file_is_read_error() {
        assert!(matches!(
            HarnessConfig::load("/nonexistent/vmtest.json"),
            Err(ConfigError::Read(_))
        ));
    }
}
