// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The status file protocol between a guest test script and the host.
//!
//! A guest test script records its own outcome by writing one of the
//! terminal keywords into a status file in its home directory. Anything else
//! means the script is still going.

use std::fmt;

/// Name of the status file in the guest's home directory.
pub const STATUS_FILE: &str = "state.txt";

const COMPLETED: &str = "TestCompleted";
const ABORTED: &str = "TestAborted";
const FAILED: &str = "TestFailed";

/// The parsed contents of a status file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalStatus {
    /// `TestCompleted`
    Completed,
    /// `TestAborted`
    Aborted,
    /// `TestFailed`
    Failed,
    /// The file exists but holds nothing.
    Empty,
    /// Any other content, e.g. `TestRunning`.
    Running(String),
}

impl TerminalStatus {
    /// Parses status file content. Only an exact keyword (ignoring
    /// surrounding whitespace) is terminal.
    pub fn parse(content: &str) -> Self {
        match content.trim() {
            "" => Self::Empty,
            COMPLETED => Self::Completed,
            ABORTED => Self::Aborted,
            FAILED => Self::Failed,
            other => Self::Running(other.to_owned()),
        }
    }

    /// Whether polling should stop on this value.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Aborted | Self::Failed)
    }
}

/// The verdict of one remote script job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// The guest reported `TestCompleted`.
    Completed,
    /// The guest reported `TestAborted`.
    Aborted,
    /// The guest reported `TestFailed`.
    Failed,
    /// The polling budget ran out before a terminal keyword appeared.
    TimedOut,
    /// The outcome could not be observed.
    Error(String),
}

impl JobOutcome {
    /// Only a completed job is a pass.
    pub fn succeeded(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

impl fmt::Display for JobOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => f.write_str("completed"),
            Self::Aborted => f.write_str("aborted"),
            Self::Failed => f.write_str("failed"),
            Self::TimedOut => f.write_str("timed out"),
            Self::Error(reason) => write!(f, "error: {reason}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keywords_are_terminal() {
        assert_eq!(TerminalStatus::parse("TestCompleted\n"), TerminalStatus::Completed);
        assert_eq!(TerminalStatus::parse("TestAborted"), TerminalStatus::Aborted);
        assert_eq!(TerminalStatus::parse("  TestFailed  "), TerminalStatus::Failed);
    }

    #[test]
    fn substring_is_not_a_match() {
        let status = TerminalStatus::parse("NotTestCompletedYet");
        assert_eq!(status, TerminalStatus::Running("NotTestCompletedYet".into()));
        assert!(!status.is_terminal());
        assert!(!TerminalStatus::parse("testcompleted").is_terminal());
    }

    #[test]
    fn whitespace_only_is_empty() {
        assert_eq!(TerminalStatus::parse(" \r\n"), TerminalStatus::Empty);
        assert!(!TerminalStatus::Empty.is_terminal());
    }

    #[test]
    fn only_completed_succeeds() {
        assert!(JobOutcome::Completed.succeeded());
        for outcome in [
            JobOutcome::Aborted,
            JobOutcome::Failed,
            JobOutcome::TimedOut,
            JobOutcome::Error("x".into()),
        ] {
            assert!(!outcome.succeeded(), "{outcome}");
        }
    }
}
