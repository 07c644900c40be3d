//! 服务单元领域模型
//!
//! 把多容器应用栈当作一个可重启的整体

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// 服务单元生命周期状态
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum UnitState {
    #[default]
    Stopped,
    Starting,
    Running,
    Failed,
}

impl UnitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnitState::Stopped => "stopped",
            UnitState::Starting => "starting",
            UnitState::Running => "running",
            UnitState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for UnitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 重启策略
///
/// 仅作为声明式配置交给宿主（systemd）执行，supervisor 本身不重试
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RestartPolicy {
    /// 失败时以固定间隔重启
    OnFailure { backoff: Duration },
    Never,
}

impl RestartPolicy {
    /// systemd `Restart=` 的取值
    pub fn systemd_value(&self) -> &'static str {
        match self {
            RestartPolicy::OnFailure { .. } => "on-failure",
            RestartPolicy::Never => "no",
        }
    }
}

/// 受管理的应用栈
#[derive(Clone, Debug)]
pub struct ServiceUnit {
    /// 单元名称（compose project 名 / systemd unit 名）
    pub name: String,
    /// 部署产物所在目录
    pub work_dir: PathBuf,
    pub restart_policy: RestartPolicy,
    pub start_timeout: Duration,
    pub stop_timeout: Duration,
}

impl ServiceUnit {
    pub fn new(name: impl Into<String>, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            work_dir: work_dir.into(),
            restart_policy: RestartPolicy::OnFailure {
                backoff: Duration::from_secs(10),
            },
            start_timeout: Duration::from_secs(300),
            stop_timeout: Duration::from_secs(60),
        }
    }

    /// systemd 中使用的单元文件名
    pub fn systemd_unit_name(&self) -> String {
        if self.name.ends_with(".service") {
            self.name.clone()
        } else {
            format!("{}.service", self.name)
        }
    }
}

/// 单元文件中的执行命令
#[derive(Clone, Debug)]
pub struct UnitCommands {
    /// 启动前执行，失败被忽略（首次部署时没有运行中的实例）
    pub pre_start: String,
    pub start: String,
    pub stop: String,
}

/// 渲染 systemd 单元文件
///
/// 应用栈以 oneshot + RemainAfterExit 的方式运行，
/// `ExecStartPre=-` 保证先停后启且容忍停止失败
pub fn render_systemd_unit(unit: &ServiceUnit, commands: &UnitCommands) -> String {
    let mut out = String::new();
    out.push_str("[Unit]\n");
    out.push_str(&format!("Description={} application stack\n", unit.name));
    out.push_str("Requires=docker.service\n");
    out.push_str("After=docker.service network-online.target\n");
    out.push('\n');

    out.push_str("[Service]\n");
    out.push_str("Type=oneshot\n");
    out.push_str("RemainAfterExit=yes\n");
    out.push_str(&format!("WorkingDirectory={}\n", unit.work_dir.display()));
    out.push_str(&format!("ExecStartPre=-{}\n", commands.pre_start));
    out.push_str(&format!("ExecStart={}\n", commands.start));
    out.push_str(&format!("ExecStop={}\n", commands.stop));
    out.push_str(&format!("Restart={}\n", unit.restart_policy.systemd_value()));
    if let RestartPolicy::OnFailure { backoff } = unit.restart_policy {
        out.push_str(&format!("RestartSec={}\n", backoff.as_secs()));
    }
    out.push_str(&format!("TimeoutStartSec={}\n", unit.start_timeout.as_secs()));
    out.push_str(&format!("TimeoutStopSec={}\n", unit.stop_timeout.as_secs()));
    out.push('\n');

    out.push_str("[Install]\n");
    out.push_str("WantedBy=multi-user.target\n");
    out
}
