use std::time::Duration;

use clap::Parser;
use log::{error, info, warn};
use tokio::sync::mpsc;

use repo_watchdog::{cli_args::CliArgs, config::WatchdogConfig, Watchdog};

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(e) = run() {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    let cli_args = CliArgs::parse();
    let config = WatchdogConfig::load()?;

    let mut builder = Watchdog::builder().http_credentials(config.git_username, config.git_password);
    if let Some(url) = cli_args.url.or(config.repository_url) {
        builder = builder.repository_url(url);
    }
    if let Some(remote) = cli_args.remote.or(config.remote) {
        builder = builder.remote_name(remote);
    }
    if let Some(dir) = cli_args.install_dir.or(config.install_dir) {
        builder = builder.install_directory(dir);
    }
    if let Some(command) = cli_args.build_command.or(config.build_command) {
        builder = builder.build_command(command);
    }
    if let Some(command) = cli_args.launch_command.or(config.launch_command) {
        builder = builder.launch_command(command);
    }
    if let Some(seconds) = cli_args.interval.or(config.poll_interval) {
        builder = builder.poll_interval(Duration::from_secs(seconds));
    }
    if let Some(seconds) = cli_args.stop_timeout.or(config.stop_timeout) {
        builder = builder.stop_timeout(Duration::from_secs(seconds));
    }
    let watchdog = builder.try_build()?;
    info!(
        "Watching {} from {}",
        watchdog.name(),
        watchdog.install_directory().display()
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    let result = runtime.block_on(async move {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        tokio::spawn(async move {
            match wait_for_shutdown_signal().await {
                Ok(()) => {
                    let _ = shutdown_tx.send(()).await;
                }
                Err(e) => {
                    warn!("Failed to listen for shutdown signals: {}", e);
                    // a dropped sender would stop the watchdog
                    let _sender = shutdown_tx;
                    std::future::pending::<()>().await;
                }
            }
        });
        watchdog.run(shutdown_rx).await
    });
    // A git operation abandoned on shutdown may still hold a blocking thread
    runtime.shutdown_timeout(Duration::from_secs(1));
    result
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result?,
        _ = sigterm.recv() => info!("SIGTERM received"),
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
