//! 部署管理 API
//!
//! 包含 /deploy, /deployments/* 端点

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::domain::deploy::{DeploymentAttempt, Trigger};
use crate::error::{ApiError, ApiResult};
use crate::middleware::RequireApiKey;
use crate::state::AppState;

/// 触发部署请求
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeployRequest {
    /// 目标版本，缺省为配置分支的最新提交
    #[serde(default)]
    pub revision: Option<String>,
    /// 已有部署运行时直接返回 409，而不是排队
    #[serde(default)]
    pub no_wait: bool,
}

/// 触发部署响应
#[derive(Debug, Serialize)]
pub struct DeployResponse {
    pub attempt_id: String,
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
    pub status_url: String,
}

/// 最近部署查询参数
#[derive(Debug, Deserialize)]
pub struct RecentQuery {
    /// 返回数量限制，默认 20
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    20
}

/// 最近部署响应
#[derive(Debug, Serialize)]
pub struct RecentResponse {
    pub deployments: Vec<DeploymentAttempt>,
    pub total: usize,
}

/// 创建部署管理路由
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/deploy", post(trigger_deploy))
        .route("/deployments/recent", get(recent_deployments))
        .route("/deployments/:id", get(get_deployment))
}

/// 触发部署
///
/// POST /deploy
/// 需要 API Key；部署在后台执行，立即返回 202
async fn trigger_deploy(
    _auth: RequireApiKey,
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<DeployResponse>)> {
    let request = parse_request(&body)?;

    if state.shutdown.is_cancelled() {
        return Err(ApiError::service_unavailable("Agent is shutting down"));
    }

    let trigger = Trigger::new(request.revision);
    trigger.validate().map_err(ApiError::bad_request)?;
    let target = trigger.describe().to_string();

    let attempt = state
        .spawn_deploy(trigger, request.no_wait)
        .await
        .ok_or_else(|| ApiError::conflict("A deployment is already running"))?;
    tracing::info!(attempt_id = %attempt.id, revision = %target, "Deployment accepted");

    Ok((
        StatusCode::ACCEPTED,
        Json(DeployResponse {
            status_url: format!("/deployments/{}", attempt.id),
            attempt_id: attempt.id,
            status: "accepted",
            revision: attempt.revision,
        }),
    ))
}

/// 空请求体表示默认请求；其余内容必须是合法的 DeployRequest
fn parse_request(body: &[u8]) -> ApiResult<DeployRequest> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(DeployRequest::default());
    }
    serde_json::from_slice(body)
        .map_err(|e| ApiError::bad_request(format!("Invalid deploy request: {}", e)))
}

/// 最近的部署（新的在前）
///
/// GET /deployments/recent?limit=N
async fn recent_deployments(
    _auth: RequireApiKey,
    State(state): State<Arc<AppState>>,
    Query(query): Query<RecentQuery>,
) -> Json<RecentResponse> {
    let deployments = state.attempts.recent(query.limit).await;
    Json(RecentResponse {
        total: deployments.len(),
        deployments,
    })
}

/// 查询单个部署
///
/// GET /deployments/:id
async fn get_deployment(
    _auth: RequireApiKey,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<DeploymentAttempt>> {
    state
        .attempts
        .get(&id)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("Deployment '{}'", id)))
}
