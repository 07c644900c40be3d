//! 应用状态

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::env::EnvConfig;
use crate::domain::deploy::{DeploymentAttempt, Trigger};
use crate::services::{
    build_orchestrator, build_supervisor, LockMode, Orchestrator, ServiceSupervisor,
};

use super::attempt_store::AttemptStore;

/// 全局 shutdown token，用于优雅关闭所有后台任务
static GLOBAL_SHUTDOWN: std::sync::OnceLock<CancellationToken> = std::sync::OnceLock::new();

/// 获取全局 shutdown token
pub fn get_shutdown_token() -> CancellationToken {
    GLOBAL_SHUTDOWN.get_or_init(CancellationToken::new).clone()
}

/// 触发全局 shutdown
pub fn trigger_shutdown() {
    if let Some(token) = GLOBAL_SHUTDOWN.get() {
        token.cancel();
    }
}

/// 应用状态
pub struct AppState {
    /// API 密钥（用于验证请求）
    pub api_key: String,
    /// 环境配置
    pub config: EnvConfig,
    /// 服务启动时间
    pub started_at: DateTime<Utc>,
    /// 部署记录
    pub attempts: Arc<AttemptStore>,
    pub supervisor: Arc<ServiceSupervisor>,
    pub orchestrator: Arc<Orchestrator>,
    /// 取消后不再接受新的部署
    pub shutdown: CancellationToken,
}

impl AppState {
    /// 按配置创建应用状态
    pub fn new(config: EnvConfig) -> Result<Self, reqwest::Error> {
        let supervisor = Arc::new(build_supervisor(&config));
        let orchestrator = build_orchestrator(&config, supervisor.clone())?;

        tracing::info!(
            api_key_len = config.api_key.len(),
            port = config.port,
            work_dir = %config.work_dir.display(),
            unit = %config.supervisor.unit_name,
            supervisor = supervisor.driver().name(),
            probe_port = config.readiness.port,
            "Loaded configuration"
        );

        Ok(Self::with_parts(config, supervisor, Arc::new(orchestrator)))
    }

    /// 使用已构建的组件创建
    pub fn with_parts(
        config: EnvConfig,
        supervisor: Arc<ServiceSupervisor>,
        orchestrator: Arc<Orchestrator>,
    ) -> Self {
        Self {
            api_key: config.api_key.clone(),
            config,
            started_at: Utc::now(),
            attempts: Arc::new(AttemptStore::new()),
            supervisor,
            orchestrator,
            shutdown: get_shutdown_token(),
        }
    }

    /// 是否有部署在运行
    pub async fn has_running_deploy(&self) -> bool {
        !self.attempts.running().await.is_empty()
    }

    /// 登记部署并在后台执行
    ///
    /// 重叠的部署在部署锁上排队；`exclusive` 为 true 且已有部署在运行时
    /// 不登记并返回 None。返回登记时的快照
    pub async fn spawn_deploy(
        &self,
        trigger: Trigger,
        exclusive: bool,
    ) -> Option<DeploymentAttempt> {
        let attempt = DeploymentAttempt::new(uuid::Uuid::new_v4().to_string(), &trigger);
        if exclusive {
            if !self.attempts.create_exclusive(attempt.clone()).await {
                return None;
            }
        } else {
            self.attempts.create(attempt.clone()).await;
        }

        // 快照经 channel 写回存储，run_attempt 的回调保持同步
        let (tx, mut rx) = mpsc::unbounded_channel::<DeploymentAttempt>();
        let attempts = self.attempts.clone();
        tokio::spawn(async move {
            while let Some(snapshot) = rx.recv().await {
                attempts.update(snapshot).await;
            }
        });

        let orchestrator = self.orchestrator.clone();
        let queued = attempt.clone();
        tokio::spawn(async move {
            let report = orchestrator
                .run_attempt(queued, LockMode::Wait, move |snapshot| {
                    let _ = tx.send(snapshot.clone());
                })
                .await;
            tracing::info!(
                attempt_id = %report.attempt.id,
                exit_code = report.exit_code(),
                "Background deployment finished"
            );
        });

        Some(attempt)
    }
}
