use thiserror::Error;

use crate::model::{CommitReference, UpdateCheck};

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Network error while talking to the remote: {0}")]
    Network(git2::Error),
    #[error("Authentication failed: {0}")]
    Auth(git2::Error),
    #[error("Branch {branch} cannot be fast-forwarded to the remote, resolve the divergence manually")]
    PullConflict { branch: String },
    #[error("HEAD is detached, there is no branch to track")]
    DetachedHead,
    #[error("Remote reference {reference} was not found")]
    MissingRemoteRef { reference: String },
    #[error("Git error: {0}")]
    Git(git2::Error),
    #[error("IO error: {0}")]
    IO(#[from] std::io::Error),
    #[error("Repository task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl From<git2::Error> for SyncError {
    fn from(error: git2::Error) -> Self {
        use git2::{ErrorClass, ErrorCode};

        if error.code() == ErrorCode::Auth {
            return SyncError::Auth(error);
        }
        match error.class() {
            ErrorClass::Net | ErrorClass::Http | ErrorClass::Ssh | ErrorClass::Ssl => {
                SyncError::Network(error)
            }
            _ => SyncError::Git(error),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PullOutcome {
    UpToDate,
    FastForwarded { from: String, to: String },
}

/// Keeps a local checkout in step with its remote.
pub trait RepositorySync {
    /// Fetches and fast-forwards the current branch. Never merges.
    fn pull_latest(&self) -> Result<PullOutcome, SyncError>;

    /// Fetches and compares HEAD with the remote tracking ref of the current branch.
    fn has_remote_update(&self) -> UpdateCheck;

    fn latest_remote_commit(&self) -> Option<CommitReference>;
}
