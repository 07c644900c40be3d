//! 部署编排
//!
//! 一次部署严格按顺序执行：
//! 1. Updating: 工作目录快进到目标版本，失败立即结束
//! 2. Restarting: supervisor 重启应用栈，失败立即结束（不探测）
//! 3. Probing: 等待 settle，然后按计划探测公共端口
//!
//! 整个过程持有部署锁，同一宿主机上的部署因此串行执行。

use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::Instrument;

use crate::domain::deploy::{
    DeployOutcome, DeployPhase, DeploymentAttempt, Trigger, STAGE_READINESS, STAGE_RESTART,
    STAGE_UPDATE,
};
use crate::domain::probe::{ProbeSummary, ReadinessPolicy};
use crate::domain::unit::UnitState;
use crate::infra::{DeployLock, LockError};

use super::readiness::{probe_until_listening, PortProbe, ReadinessTimeoutError};
use super::supervisor::{RestartError, ServiceSupervisor};
use super::updater::{SourceUpdater, UpdateError};

/// 部署失败原因
#[derive(Debug, Error)]
pub enum DeployError {
    #[error("update failed: {0}")]
    Update(#[from] UpdateError),

    #[error("restart failed: {0}")]
    Restart(#[from] RestartError),

    #[error("readiness check failed: {0}")]
    Readiness(#[from] ReadinessTimeoutError),

    #[error("deployment lock: {0}")]
    Lock(#[from] LockError),
}

impl DeployError {
    /// 进程退出码，CI 据此区分失败阶段
    pub fn exit_code(&self) -> i32 {
        match self {
            DeployError::Lock(_) => 1,
            DeployError::Update(_) => 2,
            DeployError::Restart(_) => 3,
            DeployError::Readiness(_) => 4,
        }
    }

    pub fn outcome(&self) -> DeployOutcome {
        match self {
            DeployError::Readiness(_) => DeployOutcome::Timeout,
            _ => DeployOutcome::Error,
        }
    }
}

/// 获取部署锁的方式
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockMode {
    /// 等待其他部署结束
    Wait,
    /// 已被占用时立即失败
    FailFast,
}

/// 一次部署的结果
#[derive(Debug)]
pub struct DeploymentReport {
    pub attempt: DeploymentAttempt,
    pub result: Result<ProbeSummary, DeployError>,
}

impl DeploymentReport {
    pub fn exit_code(&self) -> i32 {
        match &self.result {
            Ok(_) => 0,
            Err(e) => e.exit_code(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// 部署编排器
pub struct Orchestrator {
    updater: Arc<dyn SourceUpdater>,
    /// 只下达重启指令，不管理单元内部
    supervisor: Arc<ServiceSupervisor>,
    probe: Arc<dyn PortProbe>,
    policy: ReadinessPolicy,
    lock_file: PathBuf,
}

impl Orchestrator {
    pub fn new(
        updater: Arc<dyn SourceUpdater>,
        supervisor: Arc<ServiceSupervisor>,
        probe: Arc<dyn PortProbe>,
        policy: ReadinessPolicy,
        lock_file: PathBuf,
    ) -> Self {
        Self {
            updater,
            supervisor,
            probe,
            policy,
            lock_file,
        }
    }

    pub fn supervisor(&self) -> &Arc<ServiceSupervisor> {
        &self.supervisor
    }

    /// 执行一次部署（生成新的 attempt id）
    pub async fn run(&self, trigger: Trigger, lock_mode: LockMode) -> DeploymentReport {
        let attempt = DeploymentAttempt::new(uuid::Uuid::new_v4().to_string(), &trigger);
        self.run_attempt(attempt, lock_mode, |_| {}).await
    }

    /// 执行给定的部署尝试
    ///
    /// `on_change` 在每次阶段变化和探测后收到最新快照
    pub async fn run_attempt<F>(
        &self,
        attempt: DeploymentAttempt,
        lock_mode: LockMode,
        on_change: F,
    ) -> DeploymentReport
    where
        F: FnMut(&DeploymentAttempt),
    {
        let span = tracing::info_span!("deploy", attempt_id = %attempt.id);
        self.run_in_span(attempt, lock_mode, on_change)
            .instrument(span)
            .await
    }

    async fn run_in_span<F>(
        &self,
        mut attempt: DeploymentAttempt,
        lock_mode: LockMode,
        mut on_change: F,
    ) -> DeploymentReport
    where
        F: FnMut(&DeploymentAttempt),
    {
        tracing::info!(
            revision = attempt.target(),
            port = self.policy.port,
            "=== Deployment started ==="
        );

        let result = match self.acquire_lock(lock_mode).await {
            Ok(_lock) => self.execute(&mut attempt, &mut on_change).await,
            Err(e) => Err(DeployError::Lock(e)),
        };

        match &result {
            Ok(summary) => {
                let message = format!(
                    "Deployment succeeded: port {} is listening (probe {}/{})",
                    summary.port, summary.probes_issued, self.policy.probe_budget
                );
                attempt.complete(DeployOutcome::Success, message);
            }
            Err(e) => {
                attempt.complete(e.outcome(), format!("Deployment failed: {}", e));
            }
        }
        on_change(&attempt);

        log_summary(&attempt);
        DeploymentReport { attempt, result }
    }

    /// 只重启应用栈（不更新、不探测），同样持有部署锁
    pub async fn restart_only(&self, lock_mode: LockMode) -> Result<UnitState, DeployError> {
        let _lock = self.acquire_lock(lock_mode).await?;
        tracing::info!(unit = %self.supervisor.unit().name, "Restarting stack");
        Ok(self.supervisor.restart().await?)
    }

    async fn acquire_lock(&self, mode: LockMode) -> Result<DeployLock, LockError> {
        match mode {
            LockMode::FailFast => DeployLock::try_acquire(&self.lock_file),
            LockMode::Wait => match DeployLock::try_acquire(&self.lock_file) {
                Err(LockError::Busy(path)) => {
                    tracing::info!(
                        lock = %path.display(),
                        "Another deployment is running, waiting"
                    );
                    DeployLock::acquire(&self.lock_file).await
                }
                other => other,
            },
        }
    }

    /// update → restart → probe，每个阶段的结果交给下一阶段
    async fn execute<F>(
        &self,
        attempt: &mut DeploymentAttempt,
        on_change: &mut F,
    ) -> Result<ProbeSummary, DeployError>
    where
        F: FnMut(&DeploymentAttempt),
    {
        // Updating
        attempt.enter(DeployPhase::Updating);
        start_stage(attempt, STAGE_UPDATE);
        on_change(attempt);
        tracing::info!(stage = STAGE_UPDATE, "[1/3] Updating source");

        let commit = match self.updater.update(attempt.revision.as_deref()).await {
            Ok(commit) => commit,
            Err(e) => {
                finish_stage(attempt, STAGE_UPDATE, false, Some(e.to_string()));
                tracing::error!(stage = STAGE_UPDATE, error = %e, "Update failed");
                return Err(e.into());
            }
        };
        finish_stage(attempt, STAGE_UPDATE, true, Some(commit.clone()));
        attempt.deployed_commit = Some(commit);

        // Restarting
        attempt.enter(DeployPhase::Restarting);
        start_stage(attempt, STAGE_RESTART);
        on_change(attempt);
        tracing::info!(
            stage = STAGE_RESTART,
            unit = %self.supervisor.unit().name,
            "[2/3] Restarting stack"
        );

        match self.supervisor.restart().await {
            Ok(state) => finish_stage(attempt, STAGE_RESTART, true, Some(state.to_string())),
            Err(e) => {
                finish_stage(attempt, STAGE_RESTART, false, Some(e.to_string()));
                tracing::error!(stage = STAGE_RESTART, error = %e, "Restart failed");
                return Err(e.into());
            }
        }

        // Probing
        attempt.enter(DeployPhase::Probing);
        start_stage(attempt, STAGE_READINESS);
        on_change(attempt);
        tracing::info!(
            stage = STAGE_READINESS,
            settle = ?self.policy.settle_delay,
            port = self.policy.port,
            budget = self.policy.probe_budget,
            interval = ?self.policy.probe_interval,
            timeout = ?self.policy.total_timeout(),
            "[3/3] Waiting for the stack to settle before probing"
        );
        tokio::time::sleep(self.policy.settle_delay).await;

        let result = probe_until_listening(
            self.probe.as_ref(),
            self.policy.plan(),
            self.policy.port,
            |probe| {
                attempt.probes_issued = probe.attempt;
                on_change(attempt);
            },
        )
        .await;

        match result {
            Ok(summary) => {
                finish_stage(
                    attempt,
                    STAGE_READINESS,
                    true,
                    Some(format!("listening after {} probe(s)", summary.probes_issued)),
                );
                Ok(summary)
            }
            Err(e) => {
                finish_stage(attempt, STAGE_READINESS, false, Some(e.to_string()));
                tracing::error!(stage = STAGE_READINESS, error = %e, "Readiness check failed");
                Err(e.into())
            }
        }
    }
}

fn start_stage(attempt: &mut DeploymentAttempt, name: &str) {
    if let Some(stage) = attempt.stage_mut(name) {
        stage.start();
    }
}

fn finish_stage(
    attempt: &mut DeploymentAttempt,
    name: &str,
    success: bool,
    message: Option<String>,
) {
    if let Some(stage) = attempt.stage_mut(name) {
        stage.finish(success, message);
    }
}

fn log_summary(attempt: &DeploymentAttempt) {
    tracing::info!("=== Stage Summary ===");
    for stage in &attempt.stages {
        tracing::info!("{}", stage.summary_line());
    }
    let message = attempt.message.as_deref().unwrap_or_default();
    match attempt.outcome {
        Some(DeployOutcome::Success) => tracing::info!(
            probes = attempt.probes_issued,
            commit = attempt.deployed_commit.as_deref().unwrap_or("-"),
            "{}",
            message
        ),
        _ => tracing::error!(
            outcome = attempt.outcome.map(|o| o.as_str()).unwrap_or("-"),
            probes = attempt.probes_issued,
            "{}",
            message
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::deploy::StageStatus;
    use crate::domain::unit::ServiceUnit;
    use crate::services::testing::{FakeDriver, FakeProbe, FakeUpdater, ProbeBehavior};
    use std::time::Duration;
    use tokio::time::Instant;

    struct Harness {
        updater: Arc<FakeUpdater>,
        driver: Arc<FakeDriver>,
        probe: Arc<FakeProbe>,
        orchestrator: Orchestrator,
        _dir: tempfile::TempDir,
    }

    fn harness(updater: FakeUpdater, driver: FakeDriver, probe: FakeProbe) -> Harness {
        let policy = ReadinessPolicy {
            settle_delay: Duration::from_secs(20),
            probe_interval: Duration::from_secs(5),
            probe_budget: 6,
            port: 80,
            ..ReadinessPolicy::default()
        };
        harness_with_policy(updater, driver, probe, policy)
    }

    fn harness_with_policy(
        updater: FakeUpdater,
        driver: FakeDriver,
        probe: FakeProbe,
        policy: ReadinessPolicy,
    ) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let updater = Arc::new(updater);
        let driver = Arc::new(driver);
        let probe = Arc::new(probe);

        let supervisor = Arc::new(ServiceSupervisor::new(
            ServiceUnit::new("rag-stack", dir.path()),
            driver.clone(),
            Duration::ZERO,
        ));
        let orchestrator = Orchestrator::new(
            updater.clone(),
            supervisor,
            probe.clone(),
            policy,
            dir.path().join(".deploy.lock"),
        );

        Harness {
            updater,
            driver,
            probe,
            orchestrator,
            _dir: dir,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn scenario_a_port_listens_during_second_probe() {
        let h = harness(
            FakeUpdater::ok(),
            FakeDriver::new(),
            FakeProbe::new(ProbeBehavior::AfterElapsed(Duration::from_secs(25))),
        );

        let began = Instant::now();
        let report = h
            .orchestrator
            .run(Trigger::new(Some("abc123".to_string())), LockMode::FailFast)
            .await;

        assert!(report.is_success());
        assert_eq!(report.exit_code(), 0);
        assert_eq!(h.probe.calls(), 2);
        assert_eq!(report.attempt.probes_issued, 2);
        assert_eq!(report.attempt.outcome, Some(DeployOutcome::Success));
        assert_eq!(report.attempt.phase, DeployPhase::Succeeded);
        assert_eq!(report.attempt.deployed_commit.as_deref(), Some("abc123"));
        assert_eq!(began.elapsed(), Duration::from_secs(25));
    }

    #[tokio::test(start_paused = true)]
    async fn scenario_b_port_never_listens() {
        let h = harness(
            FakeUpdater::ok(),
            FakeDriver::new(),
            FakeProbe::new(ProbeBehavior::Never),
        );

        let began = Instant::now();
        let report = h.orchestrator.run(Trigger::default(), LockMode::FailFast).await;

        assert!(matches!(report.result, Err(DeployError::Readiness(_))));
        assert_eq!(report.exit_code(), 4);
        assert_eq!(h.probe.calls(), 6);
        assert_eq!(report.attempt.probes_issued, 6);
        assert_eq!(report.attempt.outcome, Some(DeployOutcome::Timeout));
        assert_eq!(began.elapsed(), Duration::from_secs(50));
        assert!(report
            .attempt
            .message
            .as_deref()
            .unwrap()
            .contains("port 80 is not listening"));
    }

    #[tokio::test(start_paused = true)]
    async fn scenario_c_update_conflict_fails_immediately() {
        let h = harness(
            FakeUpdater::conflicting(),
            FakeDriver::new(),
            FakeProbe::new(ProbeBehavior::FromAttempt(1)),
        );

        let began = Instant::now();
        let report = h.orchestrator.run(Trigger::default(), LockMode::FailFast).await;

        assert!(matches!(report.result, Err(DeployError::Update(_))));
        assert_eq!(report.exit_code(), 2);
        assert_eq!(h.updater.calls(), 1);
        assert!(h.driver.events().is_empty(), "no restart attempted");
        assert_eq!(h.probe.calls(), 0);
        assert_eq!(report.attempt.outcome, Some(DeployOutcome::Error));
        assert_eq!(began.elapsed(), Duration::ZERO);

        let stages = &report.attempt.stages;
        assert_eq!(stages[0].status, StageStatus::Failed);
        assert_eq!(stages[1].status, StageStatus::Skipped);
        assert_eq!(stages[2].status, StageStatus::Skipped);
    }

    #[tokio::test(start_paused = true)]
    async fn scenario_d_restart_failure_skips_settle_and_probes() {
        let h = harness(
            FakeUpdater::ok(),
            FakeDriver::new().failing_start(),
            FakeProbe::new(ProbeBehavior::FromAttempt(1)),
        );

        let began = Instant::now();
        let report = h.orchestrator.run(Trigger::default(), LockMode::FailFast).await;

        assert!(matches!(report.result, Err(DeployError::Restart(_))));
        assert_eq!(report.exit_code(), 3);
        assert_eq!(h.probe.calls(), 0);
        assert_eq!(report.attempt.probes_issued, 0);
        assert_eq!(began.elapsed(), Duration::ZERO, "settle delay skipped");
        assert_eq!(h.orchestrator.supervisor().status().await, UnitState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_deploy_with_nothing_running() {
        let h = harness(
            FakeUpdater::ok(),
            FakeDriver::new().failing_stop(),
            FakeProbe::new(ProbeBehavior::FromAttempt(1)),
        );

        let report = h.orchestrator.run(Trigger::default(), LockMode::FailFast).await;

        assert!(report.is_success());
        assert_eq!(h.driver.events(), vec!["stop", "start"]);
        assert_eq!(h.probe.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_lock_fails_fast_without_side_effects() {
        let h = harness(
            FakeUpdater::ok(),
            FakeDriver::new(),
            FakeProbe::new(ProbeBehavior::FromAttempt(1)),
        );
        let _held = DeployLock::try_acquire(&h.orchestrator.lock_file).unwrap();

        let report = h.orchestrator.run(Trigger::default(), LockMode::FailFast).await;

        assert!(matches!(report.result, Err(DeployError::Lock(LockError::Busy(_)))));
        assert_eq!(report.exit_code(), 1);
        assert_eq!(h.updater.calls(), 0);
        assert!(h.driver.events().is_empty());
    }

    #[tokio::test]
    async fn test_overlapping_waiting_deploys_run_one_after_another() {
        let policy = ReadinessPolicy {
            settle_delay: Duration::ZERO,
            probe_interval: Duration::ZERO,
            probe_budget: 1,
            ..ReadinessPolicy::default()
        };
        let h = harness_with_policy(
            FakeUpdater::ok().with_delay(Duration::from_millis(200)),
            FakeDriver::new(),
            FakeProbe::new(ProbeBehavior::FromAttempt(1)),
            policy,
        );

        let (first, second) = tokio::join!(
            h.orchestrator.run(Trigger::new(Some("aaa111".to_string())), LockMode::Wait),
            h.orchestrator.run(Trigger::new(Some("bbb222".to_string())), LockMode::Wait),
        );

        assert!(first.is_success());
        assert!(second.is_success());
        assert_eq!(h.updater.calls(), 2);
        // 第二次部署在第一次释放锁之后才开始重启
        assert_eq!(h.driver.events(), vec!["stop", "start", "stop", "start"]);
        let first_done = first.attempt.finished_at.unwrap();
        let second_done = second.attempt.finished_at.unwrap();
        assert!(first_done < second_done);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_only_respects_held_lock() {
        let h = harness(
            FakeUpdater::ok(),
            FakeDriver::new(),
            FakeProbe::new(ProbeBehavior::FromAttempt(1)),
        );
        let held = DeployLock::try_acquire(&h.orchestrator.lock_file).unwrap();

        let err = h.orchestrator.restart_only(LockMode::FailFast).await.unwrap_err();
        assert!(matches!(err, DeployError::Lock(LockError::Busy(_))));
        assert_eq!(err.exit_code(), 1);
        assert!(h.driver.events().is_empty());

        drop(held);
        let state = h.orchestrator.restart_only(LockMode::FailFast).await.unwrap();
        assert_eq!(state, UnitState::Running);
        assert_eq!(h.driver.events(), vec!["stop", "start"]);
        assert_eq!(h.updater.calls(), 0);
        assert_eq!(h.probe.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_on_change_observes_phases_in_order() {
        let h = harness(
            FakeUpdater::ok(),
            FakeDriver::new(),
            FakeProbe::new(ProbeBehavior::FromAttempt(3)),
        );
        let attempt = DeploymentAttempt::new("fixed-id".to_string(), &Trigger::default());
        let mut phases = Vec::new();
        let mut probe_counts = Vec::new();

        let report = h
            .orchestrator
            .run_attempt(attempt, LockMode::FailFast, |a| {
                if phases.last() != Some(&a.phase) {
                    phases.push(a.phase);
                }
                probe_counts.push(a.probes_issued);
            })
            .await;

        assert_eq!(report.attempt.id, "fixed-id");
        assert_eq!(
            phases,
            vec![
                DeployPhase::Updating,
                DeployPhase::Restarting,
                DeployPhase::Probing,
                DeployPhase::Succeeded
            ]
        );
        assert_eq!(probe_counts.iter().max(), Some(&3));
    }
}
