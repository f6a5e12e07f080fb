use std::{collections::HashMap, path::PathBuf};

use config::{Config, ConfigError, Environment};
use serde::Deserialize;

/// Settings read from `WATCHDOG_*` environment variables.
pub struct WatchdogConfig {
    pub repository_url: Option<String>,
    pub remote: Option<String>,
    pub install_dir: Option<PathBuf>,
    pub build_command: Option<String>,
    pub launch_command: Option<String>,
    pub poll_interval: Option<u64>,
    pub stop_timeout: Option<u64>,
    pub git_username: Option<String>,
    pub git_password: Option<String>,
}

impl WatchdogConfig {
    pub fn load() -> anyhow::Result<Self> {
        Ok(Self::from_raw(RawConfig::load(None)?))
    }

    fn from_raw(raw_config: RawConfig) -> Self {
        Self {
            repository_url: raw_config.repository.url,
            remote: raw_config.repository.remote,
            install_dir: raw_config.install.dir,
            build_command: raw_config.build.command,
            launch_command: raw_config.launch.command,
            poll_interval: raw_config.poll.interval,
            stop_timeout: raw_config.stop.timeout,
            git_username: raw_config.git.username,
            git_password: raw_config.git.password,
        }
    }
}

#[derive(Default, Debug, Deserialize, PartialEq, Eq)]
struct RawConfig {
    #[serde(default)]
    repository: RepositoryConfig,
    #[serde(default)]
    install: InstallConfig,
    #[serde(default)]
    build: CommandConfig,
    #[serde(default)]
    launch: CommandConfig,
    #[serde(default)]
    poll: PollConfig,
    #[serde(default)]
    stop: StopConfig,
    #[serde(default)]
    git: GitConfig,
}

#[derive(Default, Debug, Deserialize, PartialEq, Eq)]
struct RepositoryConfig {
    url: Option<String>,
    remote: Option<String>,
}

#[derive(Default, Debug, Deserialize, PartialEq, Eq)]
struct InstallConfig {
    dir: Option<PathBuf>,
}

#[derive(Default, Debug, Deserialize, PartialEq, Eq)]
struct CommandConfig {
    command: Option<String>,
}

#[derive(Default, Debug, Deserialize, PartialEq, Eq)]
struct PollConfig {
    interval: Option<u64>,
}

#[derive(Default, Debug, Deserialize, PartialEq, Eq)]
struct StopConfig {
    timeout: Option<u64>,
}

#[derive(Default, Debug, Deserialize, PartialEq, Eq)]
struct GitConfig {
    username: Option<String>,
    password: Option<String>,
}

impl RawConfig {
    fn load(env: Option<HashMap<String, String>>) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(
                Environment::with_prefix("WATCHDOG")
                    .separator("_")
                    .source(env),
            )
            .build()?
            .try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;

    #[test]
    fn load_empty() {
        let env = HashMap::from([]);
        let config = RawConfig::load(Some(env)).unwrap();
        assert_eq!(config, RawConfig::default())
    }

    #[test]
    fn load_environment() {
        let env = HashMap::from([
            (
                "WATCHDOG_REPOSITORY_URL".to_owned(),
                "https://example.com/org/app.git".to_owned(),
            ),
            ("WATCHDOG_INSTALL_DIR".to_owned(), "/opt/app".to_owned()),
            (
                "WATCHDOG_LAUNCH_COMMAND".to_owned(),
                "java -jar app.jar".to_owned(),
            ),
            ("WATCHDOG_POLL_INTERVAL".to_owned(), "30".to_owned()),
            ("WATCHDOG_STOP_TIMEOUT".to_owned(), "5".to_owned()),
            ("WATCHDOG_GIT_USERNAME".to_owned(), "deploy".to_owned()),
        ]);
        let config = RawConfig::load(Some(env)).unwrap();
        assert_eq!(
            config,
            RawConfig {
                repository: RepositoryConfig {
                    url: Some("https://example.com/org/app.git".to_owned()),
                    remote: None,
                },
                install: InstallConfig {
                    dir: Some("/opt/app".into())
                },
                build: CommandConfig { command: None },
                launch: CommandConfig {
                    command: Some("java -jar app.jar".to_owned())
                },
                poll: PollConfig { interval: Some(30) },
                stop: StopConfig { timeout: Some(5) },
                git: GitConfig {
                    username: Some("deploy".to_owned()),
                    password: None,
                },
            }
        )
    }
}
