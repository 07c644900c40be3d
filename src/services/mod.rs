//! 服务层模块
//!
//! 包含核心业务逻辑：源码更新、服务单元 supervisor、就绪探测和部署编排

pub mod compose;
pub mod orchestrator;
pub mod readiness;
pub mod supervisor;
pub mod systemd;
pub mod updater;

#[cfg(test)]
pub(crate) mod testing;

use std::sync::Arc;

use crate::config::{EnvConfig, SupervisorKind};

pub use orchestrator::{DeployError, DeploymentReport, LockMode, Orchestrator};
pub use readiness::{PortProbe, ReadinessTimeoutError};
pub use supervisor::{RestartError, ServiceSupervisor, UnitDriver};
pub use updater::{GitUpdater, SourceUpdater, UpdateError};

/// 按配置选择单元驱动
pub fn build_driver(config: &EnvConfig) -> Arc<dyn UnitDriver> {
    let compose = compose::ComposeDriver::new(
        config.supervisor.compose_file.clone(),
        config.supervisor.compose_build,
    );
    match config.supervisor.kind {
        SupervisorKind::Compose => Arc::new(compose),
        SupervisorKind::Systemd => Arc::new(systemd::SystemdDriver::new(
            config.supervisor.systemd_sudo,
            Box::new(compose),
        )),
    }
}

/// 按配置构建 supervisor
pub fn build_supervisor(config: &EnvConfig) -> ServiceSupervisor {
    ServiceSupervisor::new(
        config.service_unit(),
        build_driver(config),
        config.supervisor.stop_settle,
    )
}

/// 按配置组装完整的部署编排器
pub fn build_orchestrator(
    config: &EnvConfig,
    supervisor: Arc<ServiceSupervisor>,
) -> Result<Orchestrator, reqwest::Error> {
    let updater = GitUpdater::new(config.work_dir.clone(), &config.git);
    let probe: Arc<dyn PortProbe> = Arc::from(readiness::probe_for(&config.readiness)?);

    tracing::debug!(
        supervisor = supervisor.driver().name(),
        probe = if config.readiness.http_path.is_some() { "http" } else { "tcp" },
        lock = %config.lock_file.display(),
        "Orchestrator assembled"
    );

    Ok(Orchestrator::new(
        Arc::new(updater),
        supervisor,
        probe,
        config.readiness.clone(),
        config.lock_file.clone(),
    ))
}
