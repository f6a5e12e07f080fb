use std::{path::PathBuf, time::Duration};

use anyhow::{anyhow, bail};
use home::home_dir;

use crate::{git::HttpCredentials, model::CommandSpec, Watchdog};

const DEFAULT_REMOTE_NAME: &str = "origin";
const DEFAULT_BUILD_COMMAND: &str = "mvn clean package -DskipTests";
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(60);
const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Default)]
pub struct WatchdogBuilder {
    repository_url: Option<String>,
    remote_name: Option<String>,
    install_directory: Option<PathBuf>,
    build_command: Option<String>,
    launch_command: Option<String>,
    poll_interval: Option<Duration>,
    stop_timeout: Option<Duration>,
    http_username: Option<String>,
    http_password: Option<String>,
}

impl WatchdogBuilder {
    /// Url of the repository to follow. Required.
    pub fn repository_url(mut self, url: impl Into<String>) -> Self {
        self.repository_url = Some(url.into());
        self
    }

    /// Defaults to `origin`.
    pub fn remote_name(mut self, name: impl Into<String>) -> Self {
        self.remote_name = Some(name.into());
        self
    }

    /// Location of the checkout and the lock file.
    ///
    /// Defaults to `$HOME/.repo-watchdog/<repository name>`.
    pub fn install_directory(mut self, path: impl Into<PathBuf>) -> Self {
        self.install_directory = Some(path.into());
        self
    }

    /// Whitespace separated build command line.
    ///
    /// Defaults to `mvn clean package -DskipTests`.
    pub fn build_command(mut self, command: impl Into<String>) -> Self {
        self.build_command = Some(command.into());
        self
    }

    /// Whitespace separated command line starting the application. Required.
    pub fn launch_command(mut self, command: impl Into<String>) -> Self {
        self.launch_command = Some(command.into());
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }

    /// Grace period between SIGTERM and SIGKILL when stopping the application.
    pub fn stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = Some(timeout);
        self
    }

    pub fn http_credentials(mut self, username: Option<String>, password: Option<String>) -> Self {
        self.http_username = username;
        self.http_password = password;
        self
    }

    pub fn try_build(self) -> anyhow::Result<Watchdog> {
        let Self {
            repository_url,
            remote_name,
            install_directory,
            build_command,
            launch_command,
            poll_interval,
            stop_timeout,
            http_username,
            http_password,
        } = self;

        let repository_url = repository_url
            .filter(|url| !url.trim().is_empty())
            .ok_or_else(|| anyhow!("A repository url is required"))?;
        let name = name_from_url(&repository_url);

        let install_directory = match install_directory {
            Some(path) => path,
            None => default_install_directory(&name)?,
        };

        let build_command = build_command.as_deref().unwrap_or(DEFAULT_BUILD_COMMAND);
        let build_command = CommandSpec::parse(build_command)
            .ok_or_else(|| anyhow!("The build command is empty"))?;
        let launch_command = launch_command
            .as_deref()
            .and_then(CommandSpec::parse)
            .ok_or_else(|| anyhow!("A launch command is required"))?;

        let poll_interval = poll_interval.unwrap_or(DEFAULT_POLL_INTERVAL);
        if poll_interval.is_zero() {
            bail!("The poll interval must be greater than zero");
        }

        Ok(Watchdog {
            name,
            repository_url,
            remote_name: remote_name.unwrap_or_else(|| DEFAULT_REMOTE_NAME.to_owned()),
            install_directory,
            build_command,
            launch_command,
            poll_interval,
            stop_timeout: stop_timeout.unwrap_or(DEFAULT_STOP_TIMEOUT),
            credentials: HttpCredentials::new(http_username, http_password),
        })
    }
}

/// Last path segment of the url without a `.git` suffix.
fn name_from_url(url: &str) -> String {
    let last = url
        .trim_end_matches('/')
        .rsplit(['/', ':', '\\'])
        .next()
        .unwrap_or(url);
    let name = last.strip_suffix(".git").unwrap_or(last);
    if name.is_empty() {
        "app".to_owned()
    } else {
        name.to_owned()
    }
}

fn default_install_directory(name: &str) -> anyhow::Result<PathBuf> {
    let mut install_directory = home_dir()
        .ok_or_else(|| anyhow!("Could not find home dir. Please define $HOME env variable."))?;
    install_directory.push(".repo-watchdog");
    install_directory.push(name);
    Ok(install_directory)
}
