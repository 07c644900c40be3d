//! API 模块
//!
//! HTTP handlers 和路由组装

pub mod deploy;
pub mod health;

use axum::Router;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::state::AppState;

/// 构建完整的 API 路由
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        // Health & Status
        .merge(health::router())
        // Deploy
        .merge(deploy::router())
        // Middleware
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;
    use std::time::Duration;

    use crate::config::EnvConfig;
    use crate::domain::probe::ReadinessPolicy;
    use crate::services::testing::{FakeDriver, FakeProbe, FakeUpdater, ProbeBehavior};
    use crate::services::{Orchestrator, ServiceSupervisor};
    use crate::state::AppState;

    pub const API_KEY: &str = "test-key";

    /// 用内存替身组装的应用状态，部署立即成功
    pub fn app_state(dir: &tempfile::TempDir) -> Arc<AppState> {
        let mut config = EnvConfig::from_env().with_work_dir(dir.path().to_path_buf());
        config.api_key = API_KEY.to_string();
        config.lock_file = dir.path().join(".deploy.lock");
        config.readiness = ReadinessPolicy {
            settle_delay: Duration::ZERO,
            probe_interval: Duration::ZERO,
            ..ReadinessPolicy::default()
        };

        let supervisor = Arc::new(ServiceSupervisor::new(
            config.service_unit(),
            Arc::new(FakeDriver::new()),
            Duration::ZERO,
        ));
        let orchestrator = Arc::new(Orchestrator::new(
            Arc::new(FakeUpdater::ok()),
            supervisor.clone(),
            Arc::new(FakeProbe::new(ProbeBehavior::FromAttempt(1))),
            config.readiness.clone(),
            config.lock_file.clone(),
        ));

        Arc::new(AppState::with_parts(config, supervisor, orchestrator))
    }
}
