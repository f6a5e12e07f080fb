use std::{path::Path, process::Stdio};

use async_trait::async_trait;
use log::{error, info};
use thiserror::Error;
use tokio::process::Command;

use crate::{model::CommandSpec, output::forward_output};

const BUILD_LOG_TARGET: &str = "repo_watchdog::build";

#[derive(Error, Debug)]
pub enum BuildError {
    #[error("Build failed with exit code {exit_code}")]
    Failed { exit_code: i32 },
    #[error("Build was terminated by a signal")]
    Terminated,
    #[error("Could not start the build command: {0}")]
    Spawn(std::io::Error),
    #[error("IO error while waiting for the build: {0}")]
    IO(#[from] std::io::Error),
}

/// Produces the application artifact from a checkout.
#[async_trait]
pub trait BuildRunner {
    /// Runs to completion before returning. A failed build leaves the
    /// previous artifact in place.
    async fn build(&self, source_dir: &Path) -> Result<(), BuildError>;
}

pub struct CommandBuildRunner {
    command: CommandSpec,
}

impl CommandBuildRunner {
    pub fn new(command: CommandSpec) -> Self {
        CommandBuildRunner { command }
    }

    fn command(&self, source_dir: &Path) -> Command {
        let mut cmd = if cfg!(windows) {
            let mut c = Command::new("cmd");
            c.arg("/C").arg(&self.command.program);
            c
        } else {
            Command::new(&self.command.program)
        };
        cmd.args(&self.command.args)
            .current_dir(source_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl BuildRunner for CommandBuildRunner {
    async fn build(&self, source_dir: &Path) -> Result<(), BuildError> {
        info!(
            "Building `{}` in {}",
            self.command,
            source_dir.display()
        );

        let mut child = self
            .command(source_dir)
            .spawn()
            .map_err(BuildError::Spawn)?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let (_, status) = tokio::join!(
            forward_output(stdout, stderr, BUILD_LOG_TARGET, "build"),
            child.wait()
        );
        let status = status?;

        match status.code() {
            Some(0) => {
                info!("Build completed successfully");
                Ok(())
            }
            Some(exit_code) => {
                error!("Build failed with exit code {}", exit_code);
                Err(BuildError::Failed { exit_code })
            }
            None => {
                error!("Build was terminated by a signal");
                Err(BuildError::Terminated)
            }
        }
    }
}
