//! 领域模型模块
//!
//! 纯数据结构，不依赖 axum/tokio

pub mod deploy;
pub mod probe;
pub mod unit;

pub use deploy::{
    DeployOutcome, DeployPhase, DeployStage, DeploymentAttempt, StageStatus, Trigger,
};
pub use probe::{ProbeAttempt, ProbePlan, ProbeSummary, ReadinessPolicy, ReadinessProbe};
pub use unit::{render_systemd_unit, RestartPolicy, ServiceUnit, UnitCommands, UnitState};
