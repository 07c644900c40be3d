//! 环境变量配置加载

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

use crate::domain::probe::ReadinessPolicy;
use crate::domain::unit::{RestartPolicy, ServiceUnit};

/// 配置错误
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("probe budget must be at least 1")]
    ZeroProbeBudget,

    #[error("probe port must not be 0")]
    ZeroProbePort,

    #[error("unknown supervisor kind '{0}' (expected compose or systemd)")]
    UnknownSupervisor(String),

    #[error("unknown restart policy '{0}' (expected on-failure or no)")]
    UnknownRestartPolicy(String),

    #[error("{0} must not be empty")]
    Empty(&'static str),

    #[error("DEPLOY_AGENT_API_KEY must be set to a non-default value to serve webhooks")]
    MissingApiKey,
}

/// 历史默认值，视为未配置
const PLACEHOLDER_API_KEY: &str = "change-me-in-production";

/// 应用栈的管理方式
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum SupervisorKind {
    /// 直接调用 docker compose
    #[default]
    Compose,
    /// 通过 systemctl 管理已安装的单元
    Systemd,
}

impl FromStr for SupervisorKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "compose" | "docker_compose" | "docker-compose" => Ok(SupervisorKind::Compose),
            "systemd" | "systemctl" => Ok(SupervisorKind::Systemd),
            other => Err(ConfigError::UnknownSupervisor(other.to_string())),
        }
    }
}

/// Git 更新配置
#[derive(Clone, Debug)]
pub struct GitConfig {
    pub remote: String,
    pub branch: String,
    pub timeout: Duration,
}

/// Supervisor 配置
#[derive(Clone, Debug)]
pub struct SupervisorConfig {
    pub kind: SupervisorKind,
    pub unit_name: String,
    /// 相对于工作目录或绝对路径
    pub compose_file: String,
    /// `up` 时是否附带 `--build`
    pub compose_build: bool,
    /// systemctl 前加 sudo
    pub systemd_sudo: bool,
    /// 停止与启动之间的等待
    pub stop_settle: Duration,
    pub start_timeout: Duration,
    pub stop_timeout: Duration,
    pub restart_policy: RestartPolicy,
}

/// 环境配置
#[derive(Clone, Debug)]
pub struct EnvConfig {
    /// 部署工作目录（git checkout + compose 文件）
    pub work_dir: PathBuf,
    pub git: GitConfig,
    pub supervisor: SupervisorConfig,
    pub readiness: ReadinessPolicy,
    /// 部署锁文件，默认在临时目录下按单元名区分，不放进 git 工作目录
    pub lock_file: PathBuf,
    /// Webhook API 密钥
    pub api_key: String,
    /// Webhook 服务监听端口
    pub port: u16,
}

impl EnvConfig {
    /// 从环境变量加载配置
    pub fn from_env() -> Self {
        let work_dir = env::var("DEPLOY_WORK_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

        let git = GitConfig {
            remote: env_or("DEPLOY_GIT_REMOTE", "origin"),
            branch: env_or("DEPLOY_GIT_BRANCH", "main"),
            timeout: Duration::from_secs(parse_env("DEPLOY_GIT_TIMEOUT_SECS", 300)),
        };

        let kind = match env::var("DEPLOY_SUPERVISOR") {
            Ok(v) => v.parse().unwrap_or_else(|e| {
                warn!(error = %e, "Falling back to compose supervisor");
                SupervisorKind::Compose
            }),
            Err(_) => SupervisorKind::Compose,
        };

        let supervisor = SupervisorConfig {
            kind,
            unit_name: env_or("DEPLOY_UNIT_NAME", "rag-stack"),
            compose_file: env_or("DEPLOY_COMPOSE_FILE", "docker-compose.yml"),
            compose_build: parse_bool("DEPLOY_COMPOSE_BUILD", true),
            systemd_sudo: parse_bool("DEPLOY_SYSTEMD_SUDO", false),
            stop_settle: Duration::from_secs(parse_env("DEPLOY_STOP_SETTLE_SECS", 2)),
            start_timeout: Duration::from_secs(parse_env("DEPLOY_START_TIMEOUT_SECS", 300)),
            stop_timeout: Duration::from_secs(parse_env("DEPLOY_STOP_TIMEOUT_SECS", 60)),
            restart_policy: restart_policy_from_env(),
        };

        let defaults = ReadinessPolicy::default();
        let readiness = ReadinessPolicy {
            settle_delay: Duration::from_secs(parse_env(
                "DEPLOY_SETTLE_DELAY_SECS",
                defaults.settle_delay.as_secs(),
            )),
            probe_interval: Duration::from_secs(parse_env(
                "DEPLOY_PROBE_INTERVAL_SECS",
                defaults.probe_interval.as_secs(),
            )),
            probe_budget: parse_env("DEPLOY_PROBE_BUDGET", defaults.probe_budget),
            port: parse_env("DEPLOY_PROBE_PORT", defaults.port),
            host: env_or("DEPLOY_PROBE_HOST", &defaults.host),
            http_path: env::var("DEPLOY_PROBE_HTTP_PATH")
                .ok()
                .filter(|s| !s.is_empty()),
            connect_timeout: Duration::from_secs(parse_env(
                "DEPLOY_PROBE_CONNECT_TIMEOUT_SECS",
                defaults.connect_timeout.as_secs(),
            )),
        };

        let lock_file = env::var("DEPLOY_LOCK_FILE")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| default_lock_file(&supervisor.unit_name));

        // 未设置时为空，serve 启动前由 validate_server 拒绝
        let api_key = env::var("DEPLOY_AGENT_API_KEY").unwrap_or_default();

        let port = parse_env("PORT", 9876);

        Self {
            work_dir,
            git,
            supervisor,
            readiness,
            lock_file,
            api_key,
            port,
        }
    }

    /// 覆盖工作目录
    pub fn with_work_dir(mut self, work_dir: PathBuf) -> Self {
        self.work_dir = work_dir;
        self
    }

    /// 校验配置
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.readiness.probe_budget == 0 {
            return Err(ConfigError::ZeroProbeBudget);
        }
        if self.readiness.port == 0 {
            return Err(ConfigError::ZeroProbePort);
        }
        if self.git.remote.trim().is_empty() {
            return Err(ConfigError::Empty("DEPLOY_GIT_REMOTE"));
        }
        if self.git.branch.trim().is_empty() {
            return Err(ConfigError::Empty("DEPLOY_GIT_BRANCH"));
        }
        if self.supervisor.unit_name.trim().is_empty() {
            return Err(ConfigError::Empty("DEPLOY_UNIT_NAME"));
        }
        Ok(())
    }

    /// webhook 服务额外要求显式配置的 API 密钥
    pub fn validate_server(&self) -> Result<(), ConfigError> {
        self.validate()?;
        let key = self.api_key.trim();
        if key.is_empty() || key == PLACEHOLDER_API_KEY {
            return Err(ConfigError::MissingApiKey);
        }
        Ok(())
    }

    /// 构建服务单元描述
    pub fn service_unit(&self) -> ServiceUnit {
        let mut unit = ServiceUnit::new(self.supervisor.unit_name.clone(), self.work_dir.clone());
        unit.restart_policy = self.supervisor.restart_policy.clone();
        unit.start_timeout = self.supervisor.start_timeout;
        unit.stop_timeout = self.supervisor.stop_timeout;
        unit
    }
}

/// 同一单元的所有部署方（CLI、webhook、其他用户）共用一个锁文件
fn default_lock_file(unit_name: &str) -> PathBuf {
    env::temp_dir().join(format!("{}-{}.lock", constants::SERVICE_NAME, unit_name))
}

fn restart_policy_from_env() -> RestartPolicy {
    let backoff = Duration::from_secs(parse_env("DEPLOY_RESTART_BACKOFF_SECS", 10));
    let raw = env_or("DEPLOY_RESTART_POLICY", "on-failure");
    parse_restart_policy(&raw, backoff).unwrap_or_else(|e| {
        warn!(error = %e, "Falling back to on-failure restart policy");
        RestartPolicy::OnFailure { backoff }
    })
}

fn parse_restart_policy(raw: &str, backoff: Duration) -> Result<RestartPolicy, ConfigError> {
    match raw.trim().to_lowercase().as_str() {
        "on-failure" | "on_failure" => Ok(RestartPolicy::OnFailure { backoff }),
        "no" | "never" => Ok(RestartPolicy::Never),
        other => Err(ConfigError::UnknownRestartPolicy(other.to_string())),
    }
}

/// 读取字符串环境变量，缺省时使用默认值
fn env_or(key: &str, default: &str) -> String {
    env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

/// 读取并解析环境变量，无法解析时告警并使用默认值
fn parse_env<T: FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!(key, value = %raw, "Invalid value in environment, using default");
            default
        }),
        Err(_) => default,
    }
}

fn parse_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .ok()
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(default)
}

/// 常量
pub mod constants {
    /// 等待服务进程就绪时的轮询间隔（秒）
    pub const UNIT_POLL_INTERVAL_SECS: u64 = 1;

    /// 部署历史最大保存数量
    pub const MAX_ATTEMPT_HISTORY: usize = 100;

    /// 服务名称
    pub const SERVICE_NAME: &str = "stack-deploy-agent";

    /// 版本号
    pub const VERSION: &str = env!("CARGO_PKG_VERSION");
}
