use std::{
    fs::File,
    path::{Path, PathBuf},
};

use fs4::fs_std::FileExt;
use log::debug;
use thiserror::Error;

/// Exclusive advisory lock held for as long as the value lives.
#[derive(Debug)]
pub struct FileLock {
    _file: File,
    path: PathBuf,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Another watchdog already holds {0}")]
    Held(PathBuf),
    #[error(transparent)]
    IO(#[from] std::io::Error),
}

impl FileLock {
    /// Fails immediately instead of waiting when the lock is taken.
    pub fn try_new(path: &Path) -> Result<Self, Error> {
        let file = File::create(path)?;
        match file.try_lock_exclusive() {
            Ok(true) => {
                debug!("Acquired lock {}", path.display());
                Ok(Self {
                    _file: file,
                    path: path.to_path_buf(),
                })
            }
            Ok(false) => Err(Error::Held(path.to_path_buf())),
            Err(error) if error.raw_os_error() == fs4::lock_contended_error().raw_os_error() => {
                Err(Error::Held(path.to_path_buf()))
            }
            Err(error) => Err(error.into()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
