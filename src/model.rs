use std::fmt::{self, Display};

use chrono::{DateTime, FixedOffset};

use crate::sync::SyncError;

/// Metadata of a single commit, as resolved from a remote tracking ref.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitReference {
    pub id: String,
    pub author: String,
    pub time: DateTime<FixedOffset>,
    pub message: String,
}

impl CommitReference {
    pub fn short_id(&self) -> &str {
        self.id.get(..7).unwrap_or(&self.id)
    }

    /// First line of the commit message.
    pub fn summary(&self) -> &str {
        self.message.lines().next().unwrap_or_default().trim()
    }
}

impl Display for CommitReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} by {} on {}: {}",
            self.short_id(),
            self.author,
            self.time.format("%Y-%m-%d %H:%M:%S %z"),
            self.summary()
        )
    }
}

/// Outcome of comparing the local HEAD with the remote tracking ref.
#[derive(Debug)]
pub enum UpdateCheck {
    UpToDate,
    Changed { local: String, remote: String },
    /// The remote could not be queried, so nothing is known about it.
    Inconclusive(SyncError),
}

impl UpdateCheck {
    pub fn has_update(&self) -> bool {
        matches!(self, UpdateCheck::Changed { .. })
    }
}

/// What a single poll cycle decided to do about the remote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateDecision {
    pub remote_changed: bool,
    pub trigger: Option<CommitReference>,
}

impl UpdateDecision {
    pub fn unchanged() -> Self {
        UpdateDecision {
            remote_changed: false,
            trigger: None,
        }
    }

    pub fn changed(trigger: Option<CommitReference>) -> Self {
        UpdateDecision {
            remote_changed: true,
            trigger,
        }
    }
}

/// A program with its arguments, parsed from a whitespace separated command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        CommandSpec {
            program: program.into(),
            args,
        }
    }

    /// Returns `None` for a blank command line.
    pub fn parse(command_line: &str) -> Option<Self> {
        let mut parts = command_line.split_whitespace().map(str::to_owned);
        let program = parts.next()?;
        Some(CommandSpec {
            program,
            args: parts.collect(),
        })
    }
}

impl Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}
