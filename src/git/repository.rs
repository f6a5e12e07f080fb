use std::path::{Path, PathBuf};

use chrono::{DateTime, FixedOffset, Offset, Utc};
use git2::{build::CheckoutBuilder, build::RepoBuilder, Commit, Oid, Repository};
use log::{debug, info, trace, warn};

use crate::{
    git::transport::GitTransport,
    model::{CommitReference, UpdateCheck},
    sync::{PullOutcome, RepositorySync, SyncError},
};

/// A local checkout tracking a single remote.
///
/// The checkout path never changes after construction. The tracked branch is
/// whatever HEAD points to, it is not configured.
pub struct GitRepository {
    path: PathBuf,
    url: String,
    remote_name: String,
    transport: GitTransport,
    git_repo: Repository,
}

impl GitRepository {
    /// Opens the checkout at `path`, cloning `url` into it first when absent.
    pub fn ensure_present(
        url: &str,
        path: &Path,
        remote_name: &str,
        transport: GitTransport,
    ) -> Result<GitRepository, SyncError> {
        let git_repo = if path.join(".git").exists() {
            trace!("Opening existing checkout at {}", path.display());
            let repo = Repository::open(path)?;
            Self::ensure_remote_url(&repo, remote_name, url)?;
            repo
        } else {
            info!("Cloning {} into {}", url, path.display());
            std::fs::create_dir_all(path)?;
            let mut builder = RepoBuilder::new();
            builder.fetch_options(transport.fetch_options());
            if remote_name != "origin" {
                let remote_name = remote_name.to_owned();
                builder.remote_create(move |repo, _name, url| repo.remote(&remote_name, url));
            }
            let repo = builder.clone(url, path)?;
            info!("Cloned {}", url);
            repo
        };

        Ok(GitRepository {
            path: path.to_path_buf(),
            url: url.to_owned(),
            remote_name: remote_name.to_owned(),
            transport,
            git_repo,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn current_branch(&self) -> Result<String, SyncError> {
        let head = self.git_repo.head()?;
        if !head.is_branch() {
            return Err(SyncError::DetachedHead);
        }
        head.shorthand()
            .map(str::to_owned)
            .ok_or(SyncError::DetachedHead)
    }

    pub fn fetch(&self) -> Result<(), SyncError> {
        debug!("Fetching {} from {}", self.remote_name, self.url);
        let mut remote = self.git_repo.find_remote(&self.remote_name)?;
        let refspecs: Vec<String> = remote
            .refspecs()
            .filter_map(|refspec| refspec.str().map(|s| s.to_string()))
            .collect();
        let mut options = self.transport.fetch_options();
        remote.fetch(&refspecs, Some(&mut options), None)?;
        Ok(())
    }

    fn ensure_remote_url(repo: &Repository, remote_name: &str, url: &str) -> Result<(), SyncError> {
        let remote = repo.find_remote(remote_name)?;
        if remote.url() != Some(url) {
            warn!(
                "Updating url of remote {} from {:?} to {}",
                remote_name,
                remote.url(),
                url
            );
            repo.remote_set_url(remote_name, url)?;
        }
        Ok(())
    }

    fn remote_tracking_ref(&self, branch: &str) -> String {
        format!("refs/remotes/{}/{}", self.remote_name, branch)
    }

    fn resolve_remote_head(&self, branch: &str) -> Result<Oid, SyncError> {
        let reference = self.remote_tracking_ref(branch);
        match self.git_repo.refname_to_id(&reference) {
            Ok(oid) => Ok(oid),
            Err(e) if e.code() == git2::ErrorCode::NotFound => {
                Err(SyncError::MissingRemoteRef { reference })
            }
            Err(e) => Err(e.into()),
        }
    }

    fn local_head(&self) -> Result<Oid, SyncError> {
        Ok(self.git_repo.head()?.peel_to_commit()?.id())
    }

    fn check_for_update(&self) -> Result<UpdateCheck, SyncError> {
        let branch = self.current_branch()?;
        self.fetch()?;
        let local = self.local_head()?;
        let remote = self.resolve_remote_head(&branch)?;
        trace!("Local HEAD {}, {} at {}", local, self.remote_tracking_ref(&branch), remote);
        if local == remote {
            Ok(UpdateCheck::UpToDate)
        } else {
            Ok(UpdateCheck::Changed {
                local: local.to_string(),
                remote: remote.to_string(),
            })
        }
    }

    fn fast_forward(&self, branch: &str) -> Result<PullOutcome, SyncError> {
        let remote_ref = self
            .git_repo
            .find_reference(&self.remote_tracking_ref(branch))
            .map_err(|_| SyncError::MissingRemoteRef {
                reference: self.remote_tracking_ref(branch),
            })?;
        let incoming = self.git_repo.reference_to_annotated_commit(&remote_ref)?;
        let (analysis, _) = self.git_repo.merge_analysis(&[&incoming])?;

        if analysis.is_up_to_date() {
            return Ok(PullOutcome::UpToDate);
        }
        if !analysis.is_fast_forward() {
            return Err(SyncError::PullConflict {
                branch: branch.to_owned(),
            });
        }

        let local_ref_name = format!("refs/heads/{branch}");
        let mut local_ref = self.git_repo.find_reference(&local_ref_name)?;
        let from = local_ref.peel_to_commit()?.id();
        local_ref.set_target(incoming.id(), "fast-forward")?;
        self.git_repo.set_head(&local_ref_name)?;
        self.git_repo
            .checkout_head(Some(CheckoutBuilder::default().force()))?;

        Ok(PullOutcome::FastForwarded {
            from: from.to_string(),
            to: incoming.id().to_string(),
        })
    }
}

impl RepositorySync for GitRepository {
    fn pull_latest(&self) -> Result<PullOutcome, SyncError> {
        info!("Pulling latest changes from {}", self.remote_name);
        let branch = self.current_branch()?;
        self.fetch()?;
        let outcome = self.fast_forward(&branch)?;
        match &outcome {
            PullOutcome::UpToDate => info!("Branch {} is already up to date", branch),
            PullOutcome::FastForwarded { from, to } => {
                info!("Fast-forwarded {} from {} to {}", branch, from, to)
            }
        }
        Ok(outcome)
    }

    fn has_remote_update(&self) -> UpdateCheck {
        self.check_for_update()
            .unwrap_or_else(UpdateCheck::Inconclusive)
    }

    fn latest_remote_commit(&self) -> Option<CommitReference> {
        let branch = self.current_branch().ok()?;
        debug!("Current branch: {}", branch);
        let oid = self.resolve_remote_head(&branch).ok()?;
        match self.git_repo.find_commit(oid) {
            Ok(commit) => Some(commit_reference(&commit)),
            Err(error) => {
                warn!("Could not read commit {}: {}", oid, error);
                None
            }
        }
    }
}

fn commit_reference(commit: &Commit<'_>) -> CommitReference {
    let time = commit.time();
    let offset = FixedOffset::east_opt(time.offset_minutes() * 60).unwrap_or(Utc.fix());
    let time = DateTime::from_timestamp(time.seconds(), 0)
        .unwrap_or_default()
        .with_timezone(&offset);

    CommitReference {
        id: commit.id().to_string(),
        author: commit.author().name().unwrap_or_default().to_owned(),
        time,
        message: commit.message().unwrap_or_default().to_owned(),
    }
}
