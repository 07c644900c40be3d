//! systemd 单元驱动
//!
//! 应用栈已作为 systemd 单元安装（见 `unit` 子命令渲染的单元文件）时，
//! 通过 systemctl 停止/启动，`is-active` 判断是否运行

use async_trait::async_trait;
use std::time::Duration;

use crate::domain::unit::{ServiceUnit, UnitCommands};
use crate::infra::command::{failure_detail, CommandRunner};

use super::supervisor::{DriverError, UnitDriver};

const SYSTEMCTL: &str = "/usr/bin/systemctl";
const STATUS_TIMEOUT: Duration = Duration::from_secs(15);

/// systemd 驱动
pub struct SystemdDriver {
    /// systemctl 前加 sudo（非 root 部署用户）
    sudo: bool,
    /// 渲染单元文件时使用的底层命令来源
    inner: Box<dyn UnitDriver>,
}

impl SystemdDriver {
    pub fn new(sudo: bool, inner: Box<dyn UnitDriver>) -> Self {
        Self { sudo, inner }
    }

    fn command<'a>(&self, args: &[&'a str]) -> (&'static str, Vec<&'a str>) {
        if self.sudo {
            let mut full = vec![SYSTEMCTL];
            full.extend_from_slice(args);
            ("sudo", full)
        } else {
            (SYSTEMCTL, args.to_vec())
        }
    }

    async fn systemctl(
        &self,
        verb: &str,
        unit: &ServiceUnit,
        timeout: Duration,
    ) -> Result<(), DriverError> {
        let unit_name = unit.systemd_unit_name();
        let (program, args) = self.command(&[verb, unit_name.as_str()]);

        let output =
            CommandRunner::run_logged("restart", program, &args, &unit.work_dir, timeout).await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(DriverError::Failed(format!(
                "systemctl {} {} failed ({})",
                verb,
                unit_name,
                failure_detail(&output)
            )))
        }
    }
}

#[async_trait]
impl UnitDriver for SystemdDriver {
    fn name(&self) -> &'static str {
        "systemd"
    }

    async fn stop(&self, unit: &ServiceUnit) -> Result<(), DriverError> {
        self.systemctl("stop", unit, unit.stop_timeout + STATUS_TIMEOUT).await
    }

    async fn start(&self, unit: &ServiceUnit) -> Result<(), DriverError> {
        self.systemctl("start", unit, unit.start_timeout + STATUS_TIMEOUT).await
    }

    async fn is_up(&self, unit: &ServiceUnit) -> Result<bool, DriverError> {
        let unit_name = unit.systemd_unit_name();
        let (program, args) = self.command(&["is-active", "--quiet", unit_name.as_str()]);

        // is-active 以退出码表示状态，非零即未运行
        let output =
            CommandRunner::run_simple(program, &args, &unit.work_dir, STATUS_TIMEOUT).await?;
        Ok(output.status.success())
    }

    async fn unit_commands(&self, unit: &ServiceUnit) -> UnitCommands {
        self.inner.unit_commands(unit).await
    }
}
