//! 源码更新
//!
//! 把工作目录快进到目标版本：fetch → merge --ff-only → rev-parse。
//! 非快进（本地有冲突修改、分叉）或远端不可达都直接失败，不重试。

use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::config::env::GitConfig;
use crate::infra::command::{failure_detail, CommandRunner};
use crate::infra::CommandError;

/// 源码更新错误
#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("git fetch {remote} {branch} failed: {detail}")]
    FetchFailed {
        remote: String,
        branch: String,
        detail: String,
    },

    #[error("cannot fast-forward to {target}: {detail}")]
    NotFastForward { target: String, detail: String },

    #[error("could not resolve deployed commit: {0}")]
    Resolve(String),

    #[error("git command failed: {0}")]
    Command(#[from] CommandError),
}

/// 源码更新器
#[async_trait]
pub trait SourceUpdater: Send + Sync {
    /// 更新到指定版本（`None` 为分支最新），返回更新后的提交
    async fn update(&self, revision: Option<&str>) -> Result<String, UpdateError>;
}

/// 基于 git CLI 的更新器
pub struct GitUpdater {
    work_dir: PathBuf,
    remote: String,
    branch: String,
    timeout: Duration,
}

impl GitUpdater {
    pub fn new(work_dir: PathBuf, config: &GitConfig) -> Self {
        Self {
            work_dir,
            remote: config.remote.clone(),
            branch: config.branch.clone(),
            timeout: config.timeout,
        }
    }

    async fn git(&self, args: &[&str]) -> Result<std::process::Output, CommandError> {
        CommandRunner::run_logged("update", "git", args, &self.work_dir, self.timeout).await
    }
}

#[async_trait]
impl SourceUpdater for GitUpdater {
    async fn update(&self, revision: Option<&str>) -> Result<String, UpdateError> {
        tracing::info!(
            work_dir = %self.work_dir.display(),
            remote = %self.remote,
            branch = %self.branch,
            revision = revision.unwrap_or("-"),
            "Updating source checkout"
        );

        let fetch = self.git(&["fetch", &self.remote, &self.branch]).await?;
        if !fetch.status.success() {
            return Err(UpdateError::FetchFailed {
                remote: self.remote.clone(),
                branch: self.branch.clone(),
                detail: failure_detail(&fetch),
            });
        }

        let target = merge_target(revision);
        let merge = self.git(&["merge", "--ff-only", target]).await?;
        if !merge.status.success() {
            return Err(UpdateError::NotFastForward {
                target: target.to_string(),
                detail: failure_detail(&merge),
            });
        }

        let head = self.git(&["rev-parse", "HEAD"]).await?;
        if !head.status.success() {
            return Err(UpdateError::Resolve(failure_detail(&head)));
        }
        let commit = parse_commit(&String::from_utf8_lossy(&head.stdout))
            .ok_or_else(|| UpdateError::Resolve("empty rev-parse output".to_string()))?;

        tracing::info!(commit = %commit, "Source checkout updated");
        Ok(commit)
    }
}

/// 没有指定版本时快进到刚 fetch 的分支头
fn merge_target(revision: Option<&str>) -> &str {
    match revision.map(str::trim) {
        Some(r) if !r.is_empty() => r,
        _ => "FETCH_HEAD",
    }
}

fn parse_commit(stdout: &str) -> Option<String> {
    stdout
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(str::to_string)
}
