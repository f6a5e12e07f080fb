use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use log::info;
use tokio::sync::mpsc;

use crate::{
    build::CommandBuildRunner,
    flock::FileLock,
    git::{GitRepository, GitTransport, HttpCredentials},
    model::CommandSpec,
    supervisor::ProcessSupervisor,
    watchdog::UpdateLoop,
};

mod builder;

pub use builder::WatchdogBuilder;

const CHECKOUT_DIRECTORY_NAME: &str = "checkout";
const LOCK_FILE_NAME: &str = ".lock";

/// A fully configured watchdog for one application.
pub struct Watchdog {
    name: String,
    repository_url: String,
    remote_name: String,
    install_directory: PathBuf,
    build_command: CommandSpec,
    launch_command: CommandSpec,
    poll_interval: Duration,
    stop_timeout: Duration,
    credentials: HttpCredentials,
}

impl Watchdog {
    pub fn builder() -> WatchdogBuilder {
        WatchdogBuilder::default()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn install_directory(&self) -> &Path {
        &self.install_directory
    }

    pub fn checkout_directory(&self) -> PathBuf {
        self.install_directory.join(CHECKOUT_DIRECTORY_NAME)
    }

    /// Clones the repository if needed, then keeps the application updated
    /// and running until `shutdown_rx` fires.
    pub async fn run(self, shutdown_rx: mpsc::Receiver<()>) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.install_directory)?;
        let lock = FileLock::try_new(&self.install_directory.join(LOCK_FILE_NAME))?;
        info!("Holding watchdog lock {}", lock.path().display());

        let checkout = self.checkout_directory();
        let transport = GitTransport::new(self.credentials);
        let repository = GitRepository::ensure_present(
            &self.repository_url,
            &checkout,
            &self.remote_name,
            transport,
        )?;

        let update_loop = UpdateLoop::new(
            repository,
            CommandBuildRunner::new(self.build_command),
            ProcessSupervisor::new(self.name, self.stop_timeout),
            checkout,
            self.launch_command,
            self.poll_interval,
        );

        update_loop.prepare().await;
        update_loop.run(shutdown_rx).await;
        Ok(())
    }
}
