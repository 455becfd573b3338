// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Running a test script on a guest and collecting its verdict.
//!
//! A job moves through fixed phases, each starting only after the previous
//! one's remote calls have returned:
//!
//! 1. stage: upload a generated wrapper and the test script
//! 2. prepare: normalize line endings and mark both executable
//! 3. execute: start the wrapper detached on the guest
//! 4. poll: fetch the guest's status file until it holds a terminal keyword
//! 5. collect: fetch the script's log
//!
//! Staging files in the local working directory are removed on every exit
//! path. Those files have fixed names, so only one job may run at a time
//! against a given working directory.

use crate::shell::CopyDirection;
use crate::shell::GuestEndpoint;
use crate::shell::RemoteShell;
use crate::shell::ShellError;
use crate::status::JobOutcome;
use crate::status::STATUS_FILE;
use crate::status::TerminalStatus;
use jiff::Timestamp;
use std::io;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Name of the generated wrapper script, locally and on the guest.
pub const WRAPPER_FILE: &str = "runtest.sh";

/// Settings shared by every job a [`ScriptRunner`] runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerSettings {
    /// Directory holding guest-bound test scripts.
    pub script_dir: PathBuf,
    /// Directory for transient staging files.
    pub work_dir: PathBuf,
    /// Where retrieved logs are moved, if anywhere.
    pub log_dir: Option<PathBuf>,
    /// Pause between status file fetches.
    pub poll_interval: Duration,
    /// Non-terminal status reads allowed before a job times out.
    pub poll_budget: u32,
}

/// One script run on a guest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteScriptJob {
    /// Script file name, relative to the script directory locally and to
    /// the home directory on the guest.
    pub script: String,
    /// Log file the wrapper redirects the script's stdout into.
    pub log_file: String,
    /// Status file the script writes its verdict into.
    pub status_file: String,
    /// Polling budget, in iterations.
    pub budget: u32,
}

impl RemoteScriptJob {
    /// Creates a job for `script` with the standard log and status names.
    pub fn new(script: impl Into<String>, budget: u32) -> Self {
        let script = script.into();
        Self {
            log_file: format!("{script}.log"),
            status_file: STATUS_FILE.to_owned(),
            script,
            budget,
        }
    }

    fn wrapper_line(&self) -> String {
        format!("./{} > {}\n", self.script, self.log_file)
    }
}

/// Everything a phase needs to know about the running job.
#[derive(Debug, Clone, Copy)]
pub struct JobContext<'a> {
    /// The guest.
    pub endpoint: &'a GuestEndpoint,
    /// The job.
    pub job: &'a RemoteScriptJob,
    /// Runner settings.
    pub settings: &'a RunnerSettings,
}

impl JobContext<'_> {
    fn local_status(&self) -> PathBuf {
        self.settings.work_dir.join(&self.job.status_file)
    }

    fn local_wrapper(&self) -> PathBuf {
        self.settings.work_dir.join(WRAPPER_FILE)
    }

    fn local_log(&self) -> PathBuf {
        self.settings.work_dir.join(&self.job.log_file)
    }

    fn local_script(&self) -> PathBuf {
        self.settings.script_dir.join(&self.job.script)
    }
}

#[derive(Error, Debug)]
enum SetupError {
    #[error("invalid job: {0}")]
    Invalid(String),
    #[error("failed to write {}", .0.display())]
    Local(PathBuf, #[source] io::Error),
    #[error("failed to copy {file} to the guest")]
    Stage {
        file: String,
        #[source]
        source: ShellError,
    },
    #[error("`{command}` failed on the guest")]
    Prepare {
        command: String,
        #[source]
        source: ShellError,
    },
}

/// Removes staging files when dropped.
struct StagingFiles(Vec<PathBuf>);

impl Drop for StagingFiles {
    fn drop(&mut self) {
        for path in &self.0 {
            remove_if_exists(path);
        }
    }
}

fn remove_if_exists(path: &Path) {
    match fs_err::remove_file(path) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => {
            tracing::warn!(error = &err as &dyn std::error::Error, "failed to remove staging file");
        }
    }
}

fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

/// Runs test scripts on guests through a [`RemoteShell`].
pub struct ScriptRunner<S> {
    shell: S,
    settings: RunnerSettings,
}

impl<S: RemoteShell> ScriptRunner<S> {
    /// Creates a runner.
    pub fn new(shell: S, settings: RunnerSettings) -> Self {
        Self { shell, settings }
    }

    /// The runner's settings.
    pub fn settings(&self) -> &RunnerSettings {
        &self.settings
    }

    /// Runs `script` on `endpoint` with the configured polling budget.
    pub fn run(&self, endpoint: &GuestEndpoint, script: &str) -> JobOutcome {
        let job = RemoteScriptJob::new(script, self.settings.poll_budget);
        self.run_job(&JobContext {
            endpoint,
            job: &job,
            settings: &self.settings,
        })
    }

    /// Runs one job to completion.
    pub fn run_job(&self, ctx: &JobContext<'_>) -> JobOutcome {
        let start = Timestamp::now();
        tracing::info!(
            address = %ctx.endpoint.address,
            script = %ctx.job.script,
            "running remote script"
        );

        let _staging = match self.setup(ctx) {
            Ok(staging) => staging,
            Err(err) => {
                tracing::error!(
                    script = %ctx.job.script,
                    error = &err as &dyn std::error::Error,
                    "remote script setup failed"
                );
                return JobOutcome::Error(err.to_string());
            }
        };

        self.execute(ctx);
        let outcome = self.poll(ctx);
        self.collect(ctx);

        let elapsed = (Timestamp::now() - start)
            .total(jiff::Unit::Second)
            .unwrap_or_default();
        if outcome.succeeded() {
            tracing::info!(script = %ctx.job.script, "remote script completed in {elapsed:.1}s");
        } else {
            tracing::error!(
                script = %ctx.job.script,
                %outcome,
                "remote script did not complete ({elapsed:.1}s)"
            );
        }
        outcome
    }

    fn validate(&self, ctx: &JobContext<'_>) -> Result<(), SetupError> {
        ctx.endpoint
            .validate()
            .map_err(|err| SetupError::Invalid(err.to_string()))?;
        for (what, name) in [
            ("script", &ctx.job.script),
            ("log file", &ctx.job.log_file),
            ("status file", &ctx.job.status_file),
        ] {
            if !is_plain_file_name(name) {
                return Err(SetupError::Invalid(format!(
                    "{what} name {name:?} is not a plain file name"
                )));
            }
        }
        if ctx.job.budget == 0 {
            return Err(SetupError::Invalid("polling budget is zero".into()));
        }
        if !ctx.local_script().is_file() {
            return Err(SetupError::Invalid(format!(
                "script {} does not exist",
                ctx.local_script().display()
            )));
        }
        Ok(())
    }

    fn setup(&self, ctx: &JobContext<'_>) -> Result<StagingFiles, SetupError> {
        self.validate(ctx)?;
        // Staging paths are only built from names that passed validation.
        let staging = StagingFiles(vec![ctx.local_status(), ctx.local_wrapper()]);
        self.stage(ctx)?;
        self.prepare(ctx)?;
        Ok(staging)
    }

    fn stage(&self, ctx: &JobContext<'_>) -> Result<(), SetupError> {
        let wrapper = ctx.local_wrapper();
        fs_err::write(&wrapper, ctx.job.wrapper_line())
            .map_err(|err| SetupError::Local(wrapper.clone(), err))?;

        for (local, remote) in [
            (wrapper, WRAPPER_FILE),
            (ctx.local_script(), ctx.job.script.as_str()),
        ] {
            tracing::debug!(file = remote, "staging file on guest");
            self.shell
                .copy(ctx.endpoint, &local, remote, CopyDirection::ToGuest)
                .map_err(|source| SetupError::Stage {
                    file: remote.to_owned(),
                    source,
                })?;
        }
        Ok(())
    }

    fn prepare(&self, ctx: &JobContext<'_>) -> Result<(), SetupError> {
        for file in [WRAPPER_FILE, ctx.job.script.as_str()] {
            for command in [format!("dos2unix -q {file}"), format!("chmod 755 {file}")] {
                self.shell
                    .exec(ctx.endpoint, &command)
                    .map_err(|source| SetupError::Prepare {
                        command: command.clone(),
                        source,
                    })?;
            }
        }
        Ok(())
    }

    fn execute(&self, ctx: &JobContext<'_>) {
        // The script reports through the status file, so how the launch
        // itself exits is only informational.
        let command = format!("nohup ./{WRAPPER_FILE} > /dev/null 2>&1 &");
        match self.shell.exec(ctx.endpoint, &command) {
            Ok(_) => tracing::debug!(script = %ctx.job.script, "started wrapper"),
            Err(err) => tracing::debug!(
                script = %ctx.job.script,
                error = &err as &dyn std::error::Error,
                "wrapper launch reported an error"
            ),
        }
    }

    fn poll(&self, ctx: &JobContext<'_>) -> JobOutcome {
        let local = ctx.local_status();
        let mut remaining = ctx.job.budget;
        loop {
            // A leftover copy would mask a fetch that produced nothing.
            remove_if_exists(&local);

            if let Err(err) =
                self.shell
                    .copy(ctx.endpoint, &local, &ctx.job.status_file, CopyDirection::FromGuest)
            {
                tracing::error!(
                    error = &err as &dyn std::error::Error,
                    "failed to fetch status file"
                );
                return JobOutcome::Error("failed to fetch status file".into());
            }

            let content = match fs_err::read_to_string(&local) {
                Ok(content) => content,
                Err(err) => {
                    tracing::warn!(
                        error = &err as &dyn std::error::Error,
                        "status fetch reported success but the file is missing"
                    );
                    return JobOutcome::Error("status file missing after fetch".into());
                }
            };

            match TerminalStatus::parse(&content) {
                TerminalStatus::Completed => return JobOutcome::Completed,
                TerminalStatus::Aborted => return JobOutcome::Aborted,
                TerminalStatus::Failed => return JobOutcome::Failed,
                TerminalStatus::Empty => {
                    tracing::warn!("status file is empty");
                    return JobOutcome::Error("status file is empty".into());
                }
                TerminalStatus::Running(state) => {
                    remaining -= 1;
                    tracing::info!(%state, remaining, "remote script still running");
                    if remaining == 0 {
                        tracing::error!(
                            budget = ctx.job.budget,
                            "timed out waiting for remote script"
                        );
                        return JobOutcome::TimedOut;
                    }
                    if !ctx.settings.poll_interval.is_zero() {
                        std::thread::sleep(ctx.settings.poll_interval);
                    }
                }
            }
        }
    }

    fn collect(&self, ctx: &JobContext<'_>) {
        let local = ctx.local_log();
        remove_if_exists(&local);

        if let Err(err) =
            self.shell
                .copy(ctx.endpoint, &local, &ctx.job.log_file, CopyDirection::FromGuest)
        {
            tracing::warn!(
                log = %ctx.job.log_file,
                error = &err as &dyn std::error::Error,
                "failed to fetch log file"
            );
            return;
        }

        match fs_err::metadata(&local) {
            Ok(meta) if meta.len() > 0 => {}
            Ok(_) => {
                tracing::warn!(log = %ctx.job.log_file, "log file is empty");
                return;
            }
            Err(_) => {
                tracing::warn!(log = %ctx.job.log_file, "log file is missing after fetch");
                return;
            }
        }

        let Some(log_dir) = &ctx.settings.log_dir else {
            tracing::info!(log = %local.display(), "retrieved log file");
            return;
        };
        match relocate(&local, log_dir) {
            Ok(dest) => tracing::info!(log = %dest.display(), "retrieved log file"),
            Err(err) => tracing::warn!(
                log = %local.display(),
                error = &err as &dyn std::error::Error,
                "failed to move log file into the log directory"
            ),
        }
    }
}

fn relocate(file: &Path, dir: &Path) -> io::Result<PathBuf> {
    fs_err::create_dir_all(dir)?;
    let dest = dir.join(
        file.file_name()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no file name"))?,
    );
    // Renames fail across filesystems; fall back to copy and delete.
    if fs_err::rename(file, &dest).is_err() {
        fs_err::copy(file, &dest)?;
        fs_err::remove_file(file)?;
    }
    Ok(dest)
}
