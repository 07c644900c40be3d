//! 部署相关领域模型

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 部署触发事件
///
/// 只携带目标版本；`None` 表示部署配置分支的最新提交
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Trigger {
    pub revision: Option<String>,
}

impl Trigger {
    pub fn new(revision: Option<String>) -> Self {
        Self {
            revision: revision
                .map(|r| r.trim().to_string())
                .filter(|r| !r.is_empty()),
        }
    }

    /// 校验版本号：不能以 `-` 开头（会被 git 当作选项），不能含空白或控制字符
    pub fn validate(&self) -> Result<(), String> {
        let Some(revision) = self.revision.as_deref() else {
            return Ok(());
        };
        if revision.starts_with('-') {
            return Err(format!("revision '{}' must not start with '-'", revision));
        }
        if revision.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err("revision must not contain whitespace".to_string());
        }
        Ok(())
    }

    /// 日志中展示用的版本描述
    pub fn describe(&self) -> &str {
        self.revision.as_deref().unwrap_or(BRANCH_TIP)
    }
}

const BRANCH_TIP: &str = "branch tip";

/// 部署流程阶段（状态机）
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeployPhase {
    Updating,
    Restarting,
    Probing,
    Succeeded,
    Failed,
}

impl DeployPhase {
    /// 是否为终态
    pub fn is_terminal(&self) -> bool {
        matches!(self, DeployPhase::Succeeded | DeployPhase::Failed)
    }
}

/// 部署结果
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeployOutcome {
    Success,
    /// 探测次数耗尽，端口仍未监听
    Timeout,
    Error,
}

impl DeployOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeployOutcome::Success => "success",
            DeployOutcome::Timeout => "timeout",
            DeployOutcome::Error => "error",
        }
    }
}

/// 阶段状态
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
}

impl StageStatus {
    pub fn icon(&self) -> &'static str {
        match self {
            StageStatus::Success => "✓",
            StageStatus::Failed => "✗",
            StageStatus::Skipped => "⊘",
            StageStatus::Running => "⟳",
            StageStatus::Pending => "○",
        }
    }
}

/// 部署阶段信息
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeployStage {
    /// 阶段标识 (update / restart / readiness)
    pub name: String,
    /// 显示名称
    pub display_name: String,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// 持续时间（毫秒）
    pub duration_ms: Option<i64>,
    pub status: StageStatus,
    /// 附加信息
    pub message: Option<String>,
}

impl DeployStage {
    /// 创建新的待执行阶段
    pub fn new(name: &str, display_name: &str) -> Self {
        Self {
            name: name.to_string(),
            display_name: display_name.to_string(),
            started_at: None,
            finished_at: None,
            duration_ms: None,
            status: StageStatus::Pending,
            message: None,
        }
    }

    pub fn start(&mut self) {
        self.started_at = Some(Utc::now());
        self.status = StageStatus::Running;
    }

    pub fn finish(&mut self, success: bool, message: Option<String>) {
        let now = Utc::now();
        self.finished_at = Some(now);
        self.status = if success {
            StageStatus::Success
        } else {
            StageStatus::Failed
        };
        self.message = message;
        if let Some(started) = self.started_at {
            self.duration_ms = Some((now - started).num_milliseconds());
        }
    }

    pub fn skip(&mut self, reason: Option<String>) {
        self.status = StageStatus::Skipped;
        self.message = reason;
    }

    /// 单行摘要，如 `✓ Restart (1520ms)`
    pub fn summary_line(&self) -> String {
        let duration = self
            .duration_ms
            .map(|d| format!("{}ms", d))
            .unwrap_or_else(|| "-".to_string());
        format!("{} {} ({})", self.status.icon(), self.display_name, duration)
    }
}

pub const STAGE_UPDATE: &str = "update";
pub const STAGE_RESTART: &str = "restart";
pub const STAGE_READINESS: &str = "readiness";

/// 一次部署尝试
///
/// 由触发事件创建，探测过程中更新，成功或探测耗尽后进入终态
#[derive(Clone, Debug, Serialize)]
pub struct DeploymentAttempt {
    pub id: String,
    /// 触发版本（原始输入）
    pub revision: Option<String>,
    /// 更新后工作目录的实际提交
    pub deployed_commit: Option<String>,
    pub phase: DeployPhase,
    pub outcome: Option<DeployOutcome>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// 已发出的就绪探测次数
    pub probes_issued: u32,
    pub message: Option<String>,
    pub stages: Vec<DeployStage>,
}

impl DeploymentAttempt {
    pub fn new(id: String, trigger: &Trigger) -> Self {
        Self {
            id,
            revision: trigger.revision.clone(),
            deployed_commit: None,
            phase: DeployPhase::Updating,
            outcome: None,
            started_at: Utc::now(),
            finished_at: None,
            probes_issued: 0,
            message: None,
            stages: vec![
                DeployStage::new(STAGE_UPDATE, "Update Source"),
                DeployStage::new(STAGE_RESTART, "Restart Stack"),
                DeployStage::new(STAGE_READINESS, "Readiness Check"),
            ],
        }
    }

    pub fn stage_mut(&mut self, name: &str) -> Option<&mut DeployStage> {
        self.stages.iter_mut().find(|s| s.name == name)
    }

    /// 目标版本描述，未指定时为分支最新提交
    pub fn target(&self) -> &str {
        self.revision.as_deref().unwrap_or(BRANCH_TIP)
    }

    pub fn enter(&mut self, phase: DeployPhase) {
        self.phase = phase;
    }

    /// 进入终态；之后不再修改
    pub fn complete(&mut self, outcome: DeployOutcome, message: impl Into<String>) {
        self.phase = if outcome == DeployOutcome::Success {
            DeployPhase::Succeeded
        } else {
            DeployPhase::Failed
        };
        self.outcome = Some(outcome);
        self.finished_at = Some(Utc::now());
        self.message = Some(message.into());

        // 未执行的阶段标记为跳过
        for stage in &mut self.stages {
            if stage.status == StageStatus::Pending {
                stage.skip(Some("not reached".to_string()));
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.phase.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trigger_blank_revision_means_branch_tip() {
        let trigger = Trigger::new(Some("  ".to_string()));
        assert!(trigger.revision.is_none());
        assert_eq!(trigger.describe(), "branch tip");

        let trigger = Trigger::new(Some("a1b2c3".to_string()));
        assert_eq!(trigger.describe(), "a1b2c3");
        assert_eq!(DeploymentAttempt::new("a".to_string(), &trigger).target(), "a1b2c3");
    }

    #[test]
    fn test_trigger_validate() {
        assert!(Trigger::new(None).validate().is_ok());
        assert!(Trigger::new(Some("release/1.2".to_string())).validate().is_ok());
        assert!(Trigger::new(Some("--upload-pack=x".to_string())).validate().is_err());
        assert!(Trigger::new(Some("abc def".to_string())).validate().is_err());
    }

    #[test]
    fn test_deploy_phase_is_terminal() {
        assert!(!DeployPhase::Updating.is_terminal());
        assert!(!DeployPhase::Restarting.is_terminal());
        assert!(!DeployPhase::Probing.is_terminal());
        assert!(DeployPhase::Succeeded.is_terminal());
        assert!(DeployPhase::Failed.is_terminal());
    }

    #[test]
    fn test_deploy_stage_lifecycle() {
        let mut stage = DeployStage::new("test", "Test Stage");
        assert_eq!(stage.status, StageStatus::Pending);

        stage.start();
        assert_eq!(stage.status, StageStatus::Running);
        assert!(stage.started_at.is_some());

        stage.finish(true, Some("Done".to_string()));
        assert_eq!(stage.status, StageStatus::Success);
        assert!(stage.finished_at.is_some());
        assert!(stage.duration_ms.is_some());
        assert!(stage.summary_line().starts_with("✓ Test Stage"));
    }

    #[test]
    fn test_attempt_complete_skips_unreached_stages() {
        let mut attempt = DeploymentAttempt::new("t1".to_string(), &Trigger::default());
        attempt.stage_mut(STAGE_UPDATE).unwrap().start();
        attempt
            .stage_mut(STAGE_UPDATE)
            .unwrap()
            .finish(false, Some("conflict".to_string()));

        attempt.complete(DeployOutcome::Error, "update failed");

        assert_eq!(attempt.phase, DeployPhase::Failed);
        assert_eq!(attempt.outcome, Some(DeployOutcome::Error));
        assert!(attempt.finished_at.is_some());
        let status = |name: &str| {
            attempt.stages.iter().find(|s| s.name == name).unwrap().status.clone()
        };
        assert_eq!(status(STAGE_UPDATE), StageStatus::Failed);
        assert_eq!(status(STAGE_RESTART), StageStatus::Skipped);
        assert_eq!(status(STAGE_READINESS), StageStatus::Skipped);
    }

    #[test]
    fn test_attempt_serializes_snake_case() {
        let mut attempt = DeploymentAttempt::new("t2".to_string(), &Trigger::default());
        attempt.complete(DeployOutcome::Timeout, "port 80 not listening");
        let json = serde_json::to_value(&attempt).unwrap();
        assert_eq!(json["phase"], "failed");
        assert_eq!(json["outcome"], "timeout");
        assert_eq!(json["stages"][0]["status"], "skipped");
    }
}
