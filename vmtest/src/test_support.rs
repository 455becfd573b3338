// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A scripted [`RemoteShell`] for unit tests.

use crate::CommandError;
use crate::shell::CopyDirection;
use crate::shell::GuestEndpoint;
use crate::shell::RemoteShell;
use crate::shell::ShellError;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::collections::HashSet;
use std::collections::VecDeque;
use std::path::Path;

/// What a fetch of a guest file produces.
#[derive(Debug, Clone)]
pub enum Fetch {
    /// The transfer succeeds and writes this content locally.
    Content(String),
    /// The transfer reports success but leaves no local file.
    Vanish,
    /// The transfer itself fails.
    TransportError,
}

/// A recorded call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Exec(String),
    CopyTo(String),
    CopyFrom(String),
}

#[derive(Default)]
struct State {
    calls: Vec<Call>,
    exec_outputs: Vec<(String, Result<String, ()>)>,
    fetches: HashMap<String, VecDeque<Fetch>>,
    failing_uploads: HashSet<String>,
}

/// Fake channel. Exec results are matched by command prefix, fetch results
/// are consumed in order per remote path with the last one repeating.
#[derive(Default)]
pub struct FakeShell {
    state: Mutex<State>,
}

pub fn transport_error() -> ShellError {
    ShellError::Command(CommandError::Launch(std::io::Error::other(
        "simulated transport failure",
    )))
}

pub fn endpoint() -> GuestEndpoint {
    GuestEndpoint::new("192.0.2.10", "root", "ssh/id_rsa")
}

impl FakeShell {
    pub fn new() -> Self {
        Self::default()
    }

    /// Commands starting with `prefix` print `output`.
    pub fn on_exec(self, prefix: &str, output: &str) -> Self {
        self.state
            .lock()
            .exec_outputs
            .push((prefix.to_owned(), Ok(output.to_owned())));
        self
    }

    /// Commands starting with `prefix` fail.
    pub fn fail_exec(self, prefix: &str) -> Self {
        self.state
            .lock()
            .exec_outputs
            .push((prefix.to_owned(), Err(())));
        self
    }

    /// Queues fetch results for `remote`.
    pub fn on_fetch(self, remote: &str, fetches: impl IntoIterator<Item = Fetch>) -> Self {
        self.state
            .lock()
            .fetches
            .entry(remote.to_owned())
            .or_default()
            .extend(fetches);
        self
    }

    /// Uploads to `remote` fail.
    pub fn fail_upload(self, remote: &str) -> Self {
        self.state.lock().failing_uploads.insert(remote.to_owned());
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().calls.clone()
    }

    pub fn fetch_count(&self, remote: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| **c == Call::CopyFrom(remote.to_owned()))
            .count()
    }

    pub fn exec_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, Call::Exec(_)))
            .count()
    }
}

impl RemoteShell for FakeShell {
    fn exec(&self, _endpoint: &GuestEndpoint, command: &str) -> Result<String, ShellError> {
        let mut state = self.state.lock();
        state.calls.push(Call::Exec(command.to_owned()));
        let result = state
            .exec_outputs
            .iter()
            .find(|(prefix, _)| command.starts_with(prefix.as_str()))
            .map(|(_, result)| result.clone());
        match result {
            Some(Ok(output)) => Ok(output),
            Some(Err(())) => Err(transport_error()),
            None => Ok(String::new()),
        }
    }

    fn copy(
        &self,
        _endpoint: &GuestEndpoint,
        local: &Path,
        remote: &str,
        direction: CopyDirection,
    ) -> Result<(), ShellError> {
        let mut state = self.state.lock();
        match direction {
            CopyDirection::ToGuest => {
                state.calls.push(Call::CopyTo(remote.to_owned()));
                if state.failing_uploads.contains(remote) {
                    return Err(transport_error());
                }
                Ok(())
            }
            CopyDirection::FromGuest => {
                state.calls.push(Call::CopyFrom(remote.to_owned()));
                let fetch = match state.fetches.get_mut(remote) {
                    Some(queue) if queue.len() > 1 => queue.pop_front(),
                    Some(queue) => queue.front().cloned(),
                    None => None,
                };
                match fetch {
                    Some(Fetch::Content(content)) => {
                        fs_err::write(local, content)
                            .map_err(|e| ShellError::Command(CommandError::Launch(e)))?;
                        Ok(())
                    }
                    Some(Fetch::Vanish) => Ok(()),
                    Some(Fetch::TransportError) | None => Err(transport_error()),
                }
            }
        }
    }
}
