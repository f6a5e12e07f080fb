use std::path::PathBuf;

use clap::Parser;

/// Keeps a locally running application on the latest revision of its git repository.
///
/// Every option can also be set through the matching `WATCHDOG_*` environment
/// variable, e.g. `WATCHDOG_REPOSITORY_URL` or `WATCHDOG_POLL_INTERVAL`.
#[derive(Debug, Parser)]
#[clap(version)]
pub struct CliArgs {
    /// Url of the git repository to follow.
    #[clap(short, long)]
    pub url: Option<String>,
    /// Name of the remote to fetch from.
    /// Defaults to `origin`.
    #[clap(long)]
    pub remote: Option<String>,
    /// Directory holding the checkout and the instance lock.
    /// Defaults to `$HOME/.repo-watchdog/<repository name>`.
    #[clap(short, long)]
    pub install_dir: Option<PathBuf>,
    /// Command building the application, run inside the checkout.
    /// Defaults to `mvn clean package -DskipTests`.
    #[clap(short, long)]
    pub build_command: Option<String>,
    /// Command starting the application, run inside the checkout.
    #[clap(short, long)]
    pub launch_command: Option<String>,
    /// Seconds between two checks of the remote.
    /// Defaults to 60.
    #[clap(long)]
    pub interval: Option<u64>,
    /// Seconds a stopped application gets to exit before it is killed.
    /// Defaults to 10.
    #[clap(long)]
    pub stop_timeout: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        CliArgs::command().debug_assert()
    }

    #[test]
    fn parse_short_flags() {
        let args = CliArgs::parse_from([
            "repo-watchdog",
            "-u",
            "https://example.com/org/app.git",
            "-l",
            "java -jar app.jar",
            "--interval",
            "30",
        ]);
        assert_eq!(args.url.as_deref(), Some("https://example.com/org/app.git"));
        assert_eq!(args.launch_command.as_deref(), Some("java -jar app.jar"));
        assert_eq!(args.interval, Some(30));
        assert_eq!(args.stop_timeout, None);
    }
}
