use std::{
    path::PathBuf,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use log::{debug, error, info, warn};
use tokio::{sync::mpsc, time::MissedTickBehavior};

use crate::{
    build::BuildRunner,
    model::{CommandSpec, CommitReference, UpdateCheck, UpdateDecision},
    supervisor::Supervisor,
    sync::{RepositorySync, SyncError},
};

/// What a poll cycle did to the supervised application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleAction {
    /// Nothing to do, the application keeps running.
    Idle,
    /// Stopped the old instance and launched the new build.
    Restarted,
    /// The update could not be pulled, the running instance was kept.
    PullFailed,
    /// The new revision did not build, the running instance was kept.
    BuildFailed,
    /// The application was not running and got relaunched without a rebuild.
    SelfHealed,
    LaunchFailed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub decision: UpdateDecision,
    pub action: CycleAction,
}

/// Polls the repository and keeps the supervised application on the latest
/// successful build.
///
/// Repository operations block on the network, they run on the blocking pool.
pub struct UpdateLoop<R, B, S> {
    repository: Arc<Mutex<R>>,
    builder: B,
    supervisor: S,
    source_dir: PathBuf,
    launch: CommandSpec,
    interval: Duration,
}

impl<R, B, S> UpdateLoop<R, B, S>
where
    R: RepositorySync + Send + 'static,
    B: BuildRunner,
    S: Supervisor,
{
    pub fn new(
        repository: R,
        builder: B,
        supervisor: S,
        source_dir: PathBuf,
        launch: CommandSpec,
        interval: Duration,
    ) -> Self {
        UpdateLoop {
            repository: Arc::new(Mutex::new(repository)),
            builder,
            supervisor,
            source_dir,
            launch,
            interval,
        }
    }

    pub fn supervisor(&self) -> &S {
        &self.supervisor
    }

    /// Brings the checkout up to date and builds it once before polling starts.
    /// Failures are logged; the first cycle launches whatever artifact exists.
    pub async fn prepare(&self) {
        if let Err(error) = self.pull().await {
            warn!("Initial pull failed: {}", error);
        }
        if let Err(error) = self.builder.build(&self.source_dir).await {
            error!("Initial build failed: {}", error);
        }
    }

    /// Runs poll cycles until a shutdown message arrives or the sender is
    /// dropped, then stops the supervised application.
    pub async fn run(&self, mut shutdown_rx: mpsc::Receiver<()>) {
        info!("Polling for updates every {:?}", self.interval);
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => {
                    info!("Shutdown requested");
                    break;
                }
                _ = interval.tick() => {}
            }
            // Dropping a cycle is safe: builds are killed and a pending stop is finished below
            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => {
                    info!("Shutdown requested, abandoning the current cycle");
                    break;
                }
                _ = self.run_cycle() => {}
            }
        }

        self.supervisor.stop().await;
        info!("Watchdog stopped");
    }

    pub async fn run_cycle(&self) -> CycleReport {
        let check = self
            .on_repository(|repository| repository.has_remote_update())
            .await
            .unwrap_or_else(UpdateCheck::Inconclusive);
        match check {
            UpdateCheck::Changed { local, remote } => {
                info!("Repository needs update ({} -> {})", local, remote);
                return self.apply_update().await;
            }
            UpdateCheck::UpToDate => info!("Repository is up to date"),
            UpdateCheck::Inconclusive(error) => {
                warn!("Could not check the remote for updates: {}", error)
            }
        }

        CycleReport {
            decision: UpdateDecision::unchanged(),
            action: self.self_heal().await,
        }
    }

    async fn apply_update(&self) -> CycleReport {
        if let Err(error) = self.pull().await {
            error!("Pull failed: {}", error);
            let action = match self.self_heal().await {
                CycleAction::Idle => CycleAction::PullFailed,
                action => action,
            };
            return CycleReport {
                decision: UpdateDecision::changed(None),
                action,
            };
        }

        let trigger = self
            .on_repository(|repository| repository.latest_remote_commit())
            .await
            .unwrap_or_else(|error| {
                warn!("{}", error);
                None
            });
        match &trigger {
            Some(commit) => log_commit(commit),
            None => warn!("Could not resolve the latest remote commit"),
        }
        let decision = UpdateDecision::changed(trigger);

        if let Err(error) = self.builder.build(&self.source_dir).await {
            error!("{}, keeping the current instance", error);
            return CycleReport {
                decision,
                action: CycleAction::BuildFailed,
            };
        }

        self.supervisor.stop().await;
        let action = if self.launch().await {
            CycleAction::Restarted
        } else {
            CycleAction::LaunchFailed
        };
        CycleReport { decision, action }
    }

    async fn pull(&self) -> Result<(), SyncError> {
        let outcome = self
            .on_repository(|repository| repository.pull_latest())
            .await??;
        debug!("Pull finished: {:?}", outcome);
        Ok(())
    }

    async fn on_repository<T, F>(&self, operation: F) -> Result<T, SyncError>
    where
        F: FnOnce(&R) -> T + Send + 'static,
        T: Send + 'static,
    {
        let repository = Arc::clone(&self.repository);
        let result = tokio::task::spawn_blocking(move || {
            // A panicking operation leaves the checkout as git left it, keep using it
            let repository = repository.lock().unwrap_or_else(PoisonError::into_inner);
            operation(&*repository)
        })
        .await?;
        Ok(result)
    }

    async fn self_heal(&self) -> CycleAction {
        if self.supervisor.is_running().await {
            return CycleAction::Idle;
        }
        info!("Application is not running, launching it");
        if self.launch().await {
            CycleAction::SelfHealed
        } else {
            CycleAction::LaunchFailed
        }
    }

    async fn launch(&self) -> bool {
        match self.supervisor.launch(&self.launch, &self.source_dir).await {
            Ok(()) => true,
            Err(error) => {
                error!("Launch failed: {}", error);
                false
            }
        }
    }
}

fn log_commit(commit: &CommitReference) {
    info!("Latest version: {}", commit);
    info!("  Commit: {}", commit.id);
    let body = commit.message.trim();
    if body != commit.summary() {
        info!("  Message:\n{}", body);
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        path::Path,
        sync::{Arc, Mutex},
    };

    use async_trait::async_trait;
    use chrono::DateTime;
    use pretty_assertions::assert_eq;

    use crate::{
        build::BuildError,
        supervisor::LaunchError,
        sync::{PullOutcome, SyncError},
    };

    use super::*;

    type Events = Arc<Mutex<Vec<&'static str>>>;

    struct FakeRepository {
        checks: Mutex<VecDeque<UpdateCheck>>,
        pull_conflict: bool,
        check_delay: Duration,
        events: Events,
    }

    impl RepositorySync for FakeRepository {
        fn pull_latest(&self) -> Result<PullOutcome, SyncError> {
            self.events.lock().unwrap().push("pull");
            if self.pull_conflict {
                return Err(SyncError::PullConflict {
                    branch: "main".to_owned(),
                });
            }
            Ok(PullOutcome::FastForwarded {
                from: "a".to_owned(),
                to: "b".to_owned(),
            })
        }

        fn has_remote_update(&self) -> UpdateCheck {
            std::thread::sleep(self.check_delay);
            self.checks
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(UpdateCheck::UpToDate)
        }

        fn latest_remote_commit(&self) -> Option<CommitReference> {
            Some(commit())
        }
    }

    struct FakeBuilder {
        fails: bool,
        events: Events,
    }

    #[async_trait]
    impl BuildRunner for FakeBuilder {
        async fn build(&self, _source_dir: &Path) -> Result<(), BuildError> {
            self.events.lock().unwrap().push("build");
            if self.fails {
                Err(BuildError::Failed { exit_code: 1 })
            } else {
                Ok(())
            }
        }
    }

    struct FakeSupervisor {
        running: Mutex<bool>,
        launch_fails: bool,
        events: Events,
    }

    #[async_trait]
    impl Supervisor for FakeSupervisor {
        async fn launch(&self, _spec: &CommandSpec, _work_dir: &Path) -> Result<(), LaunchError> {
            let mut running = self.running.lock().unwrap();
            assert!(!*running, "launch issued while an instance is live");
            self.events.lock().unwrap().push("launch");
            if self.launch_fails {
                return Err(LaunchError::Spawn {
                    program: "app".to_owned(),
                    source: std::io::Error::new(std::io::ErrorKind::NotFound, "missing"),
                });
            }
            *running = true;
            Ok(())
        }

        async fn is_running(&self) -> bool {
            *self.running.lock().unwrap()
        }

        async fn stop(&self) {
            let mut running = self.running.lock().unwrap();
            if *running {
                *running = false;
                self.events.lock().unwrap().push("stop");
            }
        }
    }

    fn commit() -> CommitReference {
        CommitReference {
            id: "0123456789abcdef0123456789abcdef01234567".to_owned(),
            author: "Jane Doe".to_owned(),
            time: DateTime::parse_from_rfc3339("2024-03-01T12:30:00+00:00").unwrap(),
            message: "Add feature\n".to_owned(),
        }
    }

    fn changed() -> UpdateCheck {
        UpdateCheck::Changed {
            local: "a".to_owned(),
            remote: "b".to_owned(),
        }
    }

    struct Scenario {
        checks: Vec<UpdateCheck>,
        pull_conflict: bool,
        check_delay: Duration,
        build_fails: bool,
        launch_fails: bool,
        running: bool,
    }

    impl Default for Scenario {
        fn default() -> Self {
            Scenario {
                checks: vec![],
                pull_conflict: false,
                check_delay: Duration::ZERO,
                build_fails: false,
                launch_fails: false,
                running: true,
            }
        }
    }

    impl Scenario {
        fn build(self) -> (UpdateLoop<FakeRepository, FakeBuilder, FakeSupervisor>, Events) {
            let events = Events::default();
            let update_loop = UpdateLoop::new(
                FakeRepository {
                    checks: Mutex::new(self.checks.into()),
                    pull_conflict: self.pull_conflict,
                    check_delay: self.check_delay,
                    events: events.clone(),
                },
                FakeBuilder {
                    fails: self.build_fails,
                    events: events.clone(),
                },
                FakeSupervisor {
                    running: Mutex::new(self.running),
                    launch_fails: self.launch_fails,
                    events: events.clone(),
                },
                PathBuf::from("/tmp/checkout"),
                CommandSpec::new("java", vec!["-jar".to_owned(), "app.jar".to_owned()]),
                Duration::from_millis(10),
            );
            (update_loop, events)
        }
    }

    fn recorded(events: &Events) -> Vec<&'static str> {
        events.lock().unwrap().clone()
    }

    #[tokio::test]
    async fn steady_state_does_nothing() {
        let (update_loop, events) = Scenario::default().build();

        for _ in 0..2 {
            let report = update_loop.run_cycle().await;
            assert_eq!(
                report,
                CycleReport {
                    decision: UpdateDecision::unchanged(),
                    action: CycleAction::Idle
                }
            );
        }
        assert_eq!(recorded(&events), Vec::<&str>::new());
        assert!(update_loop.supervisor().is_running().await);
    }

    #[tokio::test]
    async fn update_rebuilds_then_restarts_in_order() {
        let (update_loop, events) = Scenario {
            checks: vec![changed()],
            ..Default::default()
        }
        .build();

        let report = update_loop.run_cycle().await;
        assert_eq!(
            report,
            CycleReport {
                decision: UpdateDecision::changed(Some(commit())),
                action: CycleAction::Restarted
            }
        );
        assert_eq!(recorded(&events), vec!["pull", "build", "stop", "launch"]);
        assert!(update_loop.supervisor().is_running().await);
    }

    #[tokio::test]
    async fn failed_build_keeps_running_instance() {
        let (update_loop, events) = Scenario {
            checks: vec![changed()],
            build_fails: true,
            ..Default::default()
        }
        .build();

        let report = update_loop.run_cycle().await;
        assert_eq!(report.action, CycleAction::BuildFailed);
        assert_eq!(recorded(&events), vec!["pull", "build"]);
        assert!(update_loop.supervisor().is_running().await);
    }

    #[tokio::test]
    async fn failed_build_does_not_launch_when_nothing_runs() {
        let (update_loop, events) = Scenario {
            checks: vec![changed()],
            build_fails: true,
            running: false,
            ..Default::default()
        }
        .build();

        assert_eq!(update_loop.run_cycle().await.action, CycleAction::BuildFailed);
        assert_eq!(recorded(&events), vec!["pull", "build"]);
        assert!(!update_loop.supervisor().is_running().await);
    }

    #[tokio::test]
    async fn dead_application_is_relaunched_without_build() {
        let (update_loop, events) = Scenario {
            running: false,
            ..Default::default()
        }
        .build();

        assert_eq!(update_loop.run_cycle().await.action, CycleAction::SelfHealed);
        assert_eq!(recorded(&events), vec!["launch"]);
        assert!(update_loop.supervisor().is_running().await);
    }

    #[tokio::test]
    async fn failed_launch_is_retried_next_cycle() {
        let (update_loop, events) = Scenario {
            running: false,
            launch_fails: true,
            ..Default::default()
        }
        .build();

        assert_eq!(update_loop.run_cycle().await.action, CycleAction::LaunchFailed);
        assert_eq!(update_loop.run_cycle().await.action, CycleAction::LaunchFailed);
        assert_eq!(recorded(&events), vec!["launch", "launch"]);
    }

    #[tokio::test]
    async fn inconclusive_check_skips_update_but_self_heals() {
        let (update_loop, events) = Scenario {
            checks: vec![UpdateCheck::Inconclusive(SyncError::DetachedHead)],
            running: false,
            ..Default::default()
        }
        .build();

        let report = update_loop.run_cycle().await;
        assert_eq!(report.decision, UpdateDecision::unchanged());
        assert_eq!(report.action, CycleAction::SelfHealed);
        assert_eq!(recorded(&events), vec!["launch"]);
    }

    #[tokio::test]
    async fn pull_conflict_keeps_running_instance() {
        let (update_loop, events) = Scenario {
            checks: vec![changed()],
            pull_conflict: true,
            ..Default::default()
        }
        .build();

        let report = update_loop.run_cycle().await;
        assert_eq!(report.action, CycleAction::PullFailed);
        assert_eq!(report.decision, UpdateDecision::changed(None));
        assert_eq!(recorded(&events), vec!["pull"]);
        assert!(update_loop.supervisor().is_running().await);
    }

    #[tokio::test]
    async fn pull_conflict_still_self_heals() {
        let (update_loop, events) = Scenario {
            checks: vec![changed()],
            pull_conflict: true,
            running: false,
            ..Default::default()
        }
        .build();

        assert_eq!(update_loop.run_cycle().await.action, CycleAction::SelfHealed);
        assert_eq!(recorded(&events), vec!["pull", "launch"]);
    }

    #[tokio::test]
    async fn prepare_pulls_and_builds_without_launching() {
        let (update_loop, events) = Scenario {
            running: false,
            ..Default::default()
        }
        .build();

        update_loop.prepare().await;
        assert_eq!(recorded(&events), vec!["pull", "build"]);
        assert!(!update_loop.supervisor().is_running().await);
    }

    #[tokio::test]
    async fn shutdown_stops_application() {
        let (update_loop, events) = Scenario::default().build();
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        shutdown_tx.send(()).await.unwrap();

        update_loop.run(shutdown_rx).await;
        assert_eq!(recorded(&events), vec!["stop"]);
        assert!(!update_loop.supervisor().is_running().await);
    }

    #[tokio::test]
    async fn run_launches_then_stops_on_shutdown() {
        let (update_loop, events) = Scenario {
            running: false,
            ..Default::default()
        }
        .build();
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let _ = shutdown_tx.send(()).await;
        });

        update_loop.run(shutdown_rx).await;
        assert_eq!(recorded(&events), vec!["launch", "stop"]);
    }

    #[tokio::test]
    async fn shutdown_interrupts_hanging_check() {
        let (update_loop, events) = Scenario {
            check_delay: Duration::from_secs(3),
            ..Default::default()
        }
        .build();
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let _ = shutdown_tx.send(()).await;
        });

        tokio::time::timeout(Duration::from_secs(1), update_loop.run(shutdown_rx))
            .await
            .expect("shutdown waited for the remote check");
        assert_eq!(recorded(&events), vec!["stop"]);
        assert!(!update_loop.supervisor().is_running().await);
    }
}
