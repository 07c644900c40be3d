//! 就绪探测领域模型

use serde::Serialize;
use std::time::Duration;

/// 就绪检查参数
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReadinessPolicy {
    /// 重启后、首次探测前的等待
    pub settle_delay: Duration,
    /// 每次失败探测后的等待
    pub probe_interval: Duration,
    /// 最大探测次数
    pub probe_budget: u32,
    /// 目标端口（公共入口）
    pub port: u16,
    pub host: String,
    /// 设置后使用 HTTP GET 探测，否则 TCP 连接探测
    pub http_path: Option<String>,
    /// 单次连接超时
    pub connect_timeout: Duration,
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_secs(20),
            probe_interval: Duration::from_secs(5),
            probe_budget: 6,
            port: 80,
            host: "127.0.0.1".to_string(),
            http_path: None,
            connect_timeout: Duration::from_secs(3),
        }
    }
}

impl ReadinessPolicy {
    pub fn plan(&self) -> ProbePlan {
        ProbePlan::new(self.probe_budget, self.probe_interval)
    }

    /// 就绪检查的最长耗时：settle + budget × interval
    pub fn total_timeout(&self) -> Duration {
        self.settle_delay + self.probe_interval * self.probe_budget
    }
}

/// 固定间隔、有上限的探测计划
///
/// 每次调用 [`ProbePlan::attempts`] 都得到一个全新的有限序列
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProbePlan {
    pub budget: u32,
    pub interval: Duration,
}

impl ProbePlan {
    pub fn new(budget: u32, interval: Duration) -> Self {
        Self { budget, interval }
    }

    pub fn attempts(&self) -> ProbeAttempts {
        ProbeAttempts {
            next: 1,
            budget: self.budget,
        }
    }
}

/// 计划中的一次探测（序号从 1 开始）
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProbeAttempt {
    pub index: u32,
    pub budget: u32,
}

impl ProbeAttempt {
    pub fn is_last(&self) -> bool {
        self.index >= self.budget
    }
}

pub struct ProbeAttempts {
    next: u32,
    budget: u32,
}

impl Iterator for ProbeAttempts {
    type Item = ProbeAttempt;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next > self.budget {
            return None;
        }
        let attempt = ProbeAttempt {
            index: self.next,
            budget: self.budget,
        };
        self.next += 1;
        Some(attempt)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = (self.budget + 1).saturating_sub(self.next) as usize;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for ProbeAttempts {}

/// 单次探测结果，不持久化
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct ReadinessProbe {
    pub port: u16,
    pub attempt: u32,
    pub listening: bool,
}

/// 探测成功后的汇总
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct ProbeSummary {
    pub port: u16,
    /// 成功时的探测序号，即已发出的探测次数
    pub probes_issued: u32,
}
