//! 就绪探测
//!
//! 固定间隔、有上限的端口探测循环：首次探测成功立即结束，
//! 次数耗尽仍未监听则返回 [`ReadinessTimeoutError`]。

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::Instant;

use crate::domain::probe::{ProbePlan, ProbeSummary, ReadinessPolicy, ReadinessProbe};

/// 探测次数耗尽
#[derive(Debug, Error, PartialEq, Eq)]
#[error("port {port} is not listening after {probes_issued} probes (waited {waited:?})")]
pub struct ReadinessTimeoutError {
    pub port: u16,
    pub probes_issued: u32,
    pub waited: Duration,
}

/// 端口可达性检查
#[async_trait]
pub trait PortProbe: Send + Sync {
    /// 端口是否在监听
    async fn probe(&self, port: u16) -> bool;
}

/// TCP 连接探测
pub struct TcpProbe {
    host: String,
    connect_timeout: Duration,
}

impl TcpProbe {
    pub fn new(host: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            host: host.into(),
            connect_timeout,
        }
    }
}

#[async_trait]
impl PortProbe for TcpProbe {
    async fn probe(&self, port: u16) -> bool {
        let connect = TcpStream::connect((self.host.as_str(), port));
        match tokio::time::timeout(self.connect_timeout, connect).await {
            Ok(Ok(_stream)) => true,
            Ok(Err(e)) => {
                tracing::debug!(host = %self.host, port, error = %e, "Connect failed");
                false
            }
            Err(_) => {
                tracing::debug!(host = %self.host, port, "Connect timed out");
                false
            }
        }
    }
}

/// HTTP GET 探测，2xx/3xx 视为就绪
pub struct HttpProbe {
    host: String,
    path: String,
    client: reqwest::Client,
}

impl HttpProbe {
    pub fn new(
        host: impl Into<String>,
        path: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        let path = path.into();
        let path = if path.starts_with('/') {
            path
        } else {
            format!("/{}", path)
        };
        // IPv6 字面量在 URL 中必须加方括号
        let host = host.into();
        let host = if host.parse::<std::net::Ipv6Addr>().is_ok() {
            format!("[{}]", host)
        } else {
            host
        };
        Ok(Self { host, path, client })
    }

    fn url(&self, port: u16) -> String {
        format!("http://{}:{}{}", self.host, port, self.path)
    }
}

#[async_trait]
impl PortProbe for HttpProbe {
    async fn probe(&self, port: u16) -> bool {
        let url = self.url(port);
        match self.client.get(&url).send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() || status.is_redirection() {
                    true
                } else {
                    tracing::debug!(url = %url, status = %status, "Health endpoint not ready");
                    false
                }
            }
            Err(e) => {
                tracing::debug!(url = %url, error = %e, "Health request failed");
                false
            }
        }
    }
}

/// 按配置构建探测器
pub fn probe_for(policy: &ReadinessPolicy) -> Result<Box<dyn PortProbe>, reqwest::Error> {
    match &policy.http_path {
        Some(path) => Ok(Box::new(HttpProbe::new(
            policy.host.clone(),
            path.clone(),
            policy.connect_timeout,
        )?)),
        None => Ok(Box::new(TcpProbe::new(
            policy.host.clone(),
            policy.connect_timeout,
        ))),
    }
}

/// 按计划探测直到端口监听或次数耗尽
///
/// 每次失败探测后等待 `plan.interval`（最后一次也等待），
/// 因此耗尽时总耗时为 `budget × interval`。`on_probe` 在每次探测后调用。
pub async fn probe_until_listening<F>(
    probe: &dyn PortProbe,
    plan: ProbePlan,
    port: u16,
    mut on_probe: F,
) -> Result<ProbeSummary, ReadinessTimeoutError>
where
    F: FnMut(&ReadinessProbe),
{
    let began = Instant::now();
    let mut issued = 0;

    for attempt in plan.attempts() {
        let listening = probe.probe(port).await;
        issued = attempt.index;

        let record = ReadinessProbe {
            port,
            attempt: attempt.index,
            listening,
        };
        on_probe(&record);

        if listening {
            tracing::info!(
                port,
                attempt = attempt.index,
                budget = plan.budget,
                "Port is listening"
            );
            return Ok(ProbeSummary {
                port,
                probes_issued: issued,
            });
        }

        if attempt.is_last() {
            tracing::warn!(port, attempt = attempt.index, "Probe budget exhausted");
        } else {
            tracing::warn!(
                port,
                attempt = attempt.index,
                budget = plan.budget,
                retry_in = ?plan.interval,
                "Port not listening yet"
            );
        }
        tokio::time::sleep(plan.interval).await;
    }

    Err(ReadinessTimeoutError {
        port,
        probes_issued: issued,
        waited: began.elapsed(),
    })
}
