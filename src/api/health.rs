//! 健康检查和服务单元状态 API
//!
//! 包含 /health, /unit 端点

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;
use std::sync::Arc;

use crate::config::env::constants::{SERVICE_NAME, VERSION};
use crate::domain::unit::UnitState;
use crate::error::ApiResult;
use crate::middleware::RequireApiKey;
use crate::state::AppState;

/// 健康检查响应
#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    version: &'static str,
    timestamp: String,
    started_at: String,
    unit: String,
    /// supervisor 缓存的状态，不触发查询
    unit_state: UnitState,
    deploy_running: bool,
}

/// 服务单元状态响应
#[derive(Debug, Serialize)]
struct UnitResponse {
    unit: String,
    driver: &'static str,
    state: UnitState,
}

/// 创建健康检查路由
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(health_check))
        .route("/unit", get(unit_status))
}

/// 健康检查
///
/// GET /health
/// 无需认证
async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: SERVICE_NAME,
        version: VERSION,
        timestamp: chrono::Utc::now().to_rfc3339(),
        started_at: state.started_at.to_rfc3339(),
        unit: state.supervisor.unit().name.clone(),
        unit_state: state.supervisor.status().await,
        deploy_running: state.has_running_deploy().await,
    })
}

/// 查询驱动并返回服务单元状态
///
/// GET /unit
/// 需要 API Key 认证
async fn unit_status(
    _auth: RequireApiKey,
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<UnitResponse>> {
    let observed = state.supervisor.observe().await?;
    Ok(Json(UnitResponse {
        unit: state.supervisor.unit().name.clone(),
        driver: state.supervisor.driver().name(),
        state: observed,
    }))
}
