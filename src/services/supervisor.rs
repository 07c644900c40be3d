//! 服务单元 supervisor
//!
//! 把应用栈的停止/启动作为一个整体操作：
//! 1. 停止现有实例（失败只记录，不向上抛出）
//! 2. 等待固定的 settle 间隔
//! 3. 启动，并等待进程报告就绪
//!
//! 启动失败直接返回给调用方，这里不做重试；
//! on-failure 重启策略由宿主（systemd 单元）声明式执行。

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;

use crate::config::env::constants::UNIT_POLL_INTERVAL_SECS;
use crate::domain::unit::{ServiceUnit, UnitCommands, UnitState};
use crate::infra::CommandError;

/// 驱动层错误
#[derive(Debug, Error)]
pub enum DriverError {
    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("{0}")]
    Failed(String),
}

/// 重启错误类型
#[derive(Debug, Error)]
pub enum RestartError {
    #[error("failed to start unit '{unit}': {source}")]
    StartFailed {
        unit: String,
        #[source]
        source: DriverError,
    },

    #[error("unit '{unit}' did not report up within {timeout:?}")]
    NotUp { unit: String, timeout: Duration },
}

/// 应用栈的实际操作方式（docker compose / systemd）
#[async_trait]
pub trait UnitDriver: Send + Sync {
    /// 驱动名称，用于日志
    fn name(&self) -> &'static str;

    async fn stop(&self, unit: &ServiceUnit) -> Result<(), DriverError>;

    async fn start(&self, unit: &ServiceUnit) -> Result<(), DriverError>;

    /// 受管进程是否全部在运行
    async fn is_up(&self, unit: &ServiceUnit) -> Result<bool, DriverError>;

    /// 渲染 systemd 单元文件所需的命令
    async fn unit_commands(&self, unit: &ServiceUnit) -> UnitCommands;
}

/// 服务单元 supervisor
pub struct ServiceSupervisor {
    unit: ServiceUnit,
    driver: Arc<dyn UnitDriver>,
    state: RwLock<UnitState>,
    /// 同一进程内的重启串行执行
    restart_lock: Mutex<()>,
    stop_settle: Duration,
    poll_interval: Duration,
}

impl ServiceSupervisor {
    pub fn new(unit: ServiceUnit, driver: Arc<dyn UnitDriver>, stop_settle: Duration) -> Self {
        Self {
            unit,
            driver,
            state: RwLock::new(UnitState::Stopped),
            restart_lock: Mutex::new(()),
            stop_settle,
            poll_interval: Duration::from_secs(UNIT_POLL_INTERVAL_SECS),
        }
    }

    pub fn unit(&self) -> &ServiceUnit {
        &self.unit
    }

    pub fn driver(&self) -> &Arc<dyn UnitDriver> {
        &self.driver
    }

    /// 当前生命周期状态，无副作用
    pub async fn status(&self) -> UnitState {
        *self.state.read().await
    }

    /// 查询驱动并刷新缓存状态
    ///
    /// 重启进行中时直接返回缓存状态
    pub async fn observe(&self) -> Result<UnitState, DriverError> {
        let Ok(_guard) = self.restart_lock.try_lock() else {
            return Ok(self.status().await);
        };

        let up = self.driver.is_up(&self.unit).await?;
        let mut state = self.state.write().await;
        *state = match (*state, up) {
            (_, true) => UnitState::Running,
            (UnitState::Failed, false) => UnitState::Failed,
            (_, false) => UnitState::Stopped,
        };
        Ok(*state)
    }

    /// 重启服务单元（幂等）
    pub async fn restart(&self) -> Result<UnitState, RestartError> {
        let _guard = self.restart_lock.lock().await;
        let unit = &self.unit.name;

        tracing::info!(unit = %unit, driver = self.driver.name(), "Stopping existing instance");
        match self.driver.stop(&self.unit).await {
            Ok(()) => tracing::info!(unit = %unit, "Existing instance stopped"),
            Err(e) => {
                // 首次部署时没有运行中的实例，停止失败是预期情况
                tracing::warn!(unit = %unit, error = %e, "Stop failed, continuing with start");
            }
        }
        self.set_state(UnitState::Stopped).await;

        if !self.stop_settle.is_zero() {
            tracing::debug!(unit = %unit, settle = ?self.stop_settle, "Waiting before start");
            tokio::time::sleep(self.stop_settle).await;
        }

        self.set_state(UnitState::Starting).await;
        tracing::info!(unit = %unit, "Starting unit");

        if let Err(source) = self.driver.start(&self.unit).await {
            self.set_state(UnitState::Failed).await;
            tracing::error!(unit = %unit, error = %source, "Unit failed to start");
            return Err(RestartError::StartFailed {
                unit: unit.clone(),
                source,
            });
        }

        if let Err(e) = self.wait_until_up().await {
            self.set_state(UnitState::Failed).await;
            tracing::error!(unit = %unit, error = %e, "Unit did not come up");
            return Err(e);
        }

        self.set_state(UnitState::Running).await;
        tracing::info!(unit = %unit, "Unit running");
        Ok(UnitState::Running)
    }

    /// 在 start_timeout 内轮询直到受管进程全部运行
    async fn wait_until_up(&self) -> Result<(), RestartError> {
        let timeout = self.unit.start_timeout;
        let deadline = Instant::now() + timeout;

        loop {
            match self.driver.is_up(&self.unit).await {
                Ok(true) => return Ok(()),
                Ok(false) => {}
                Err(e) => {
                    tracing::debug!(
                        unit = %self.unit.name,
                        error = %e,
                        "Status query failed while waiting"
                    );
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(RestartError::NotUp {
                    unit: self.unit.name.clone(),
                    timeout,
                });
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    async fn set_state(&self, next: UnitState) {
        let mut state = self.state.write().await;
        if *state != next {
            tracing::debug!(
                unit = %self.unit.name,
                from = %*state,
                to = %next,
                "Unit state change"
            );
            *state = next;
        }
    }
}
