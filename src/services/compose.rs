//! Docker Compose unit driver
//!
//! Treats the whole compose project as one unit: `down` to stop, `up -d` to
//! start, and "up" means every service defined in the compose file is running.

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::OnceCell;

use crate::domain::unit::{ServiceUnit, UnitCommands};
use crate::infra::command::{failure_detail, CommandRunner};

use super::supervisor::{DriverError, UnitDriver};

/// Extra time granted to compose on top of the unit's own timeouts
const COMMAND_GRACE: Duration = Duration::from_secs(30);
const STATUS_TIMEOUT: Duration = Duration::from_secs(30);

/// Docker Compose driver configuration
pub struct ComposeDriver {
    compose_file: String,
    build: bool,
    command: OnceCell<(&'static str, Vec<&'static str>)>,
}

impl ComposeDriver {
    pub fn new(compose_file: impl Into<String>, build: bool) -> Self {
        Self {
            compose_file: compose_file.into(),
            build,
            command: OnceCell::new(),
        }
    }

    /// Full compose file path (relative paths resolve against the unit's work dir)
    pub fn compose_path(&self, work_dir: &Path) -> PathBuf {
        let file = Path::new(&self.compose_file);
        if file.is_absolute() {
            file.to_path_buf()
        } else {
            work_dir.join(file)
        }
    }

    async fn compose_command(&self) -> &(&'static str, Vec<&'static str>) {
        self.command.get_or_init(detect_compose_command).await
    }

    /// `<compose> -f <file> -p <project> <args...>`
    async fn command_line(
        &self,
        unit: &ServiceUnit,
        args: &[&str],
    ) -> (&'static str, Vec<String>) {
        let (program, prefix) = self.compose_command().await;
        let mut full: Vec<String> = prefix.iter().map(|s| s.to_string()).collect();
        full.push("-f".to_string());
        full.push(self.compose_path(&unit.work_dir).to_string_lossy().into_owned());
        full.push("-p".to_string());
        full.push(unit.name.clone());
        full.extend(args.iter().map(|s| s.to_string()));
        (*program, full)
    }

    async fn run(
        &self,
        stage: &'static str,
        unit: &ServiceUnit,
        args: &[&str],
        timeout: Duration,
    ) -> Result<std::process::Output, DriverError> {
        let (program, full) = self.command_line(unit, args).await;
        let full: Vec<&str> = full.iter().map(String::as_str).collect();
        let output =
            CommandRunner::run_logged(stage, program, &full, &unit.work_dir, timeout).await?;
        Ok(output)
    }

    /// Run a compose command whose stdout is a list of service names
    async fn services(
        &self,
        unit: &ServiceUnit,
        args: &[&str],
    ) -> Result<BTreeSet<String>, DriverError> {
        let (program, full) = self.command_line(unit, args).await;
        let full: Vec<&str> = full.iter().map(String::as_str).collect();
        let output =
            CommandRunner::run_simple(program, &full, &unit.work_dir, STATUS_TIMEOUT).await?;
        if !output.status.success() {
            return Err(DriverError::Failed(failure_detail(&output)));
        }
        Ok(parse_service_list(&String::from_utf8_lossy(&output.stdout)))
    }
}

#[async_trait]
impl UnitDriver for ComposeDriver {
    fn name(&self) -> &'static str {
        "compose"
    }

    async fn stop(&self, unit: &ServiceUnit) -> Result<(), DriverError> {
        let secs = unit.stop_timeout.as_secs().to_string();
        let args = ["down", "--timeout", secs.as_str()];
        let output = self
            .run("restart", unit, &args, unit.stop_timeout + COMMAND_GRACE)
            .await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(DriverError::Failed(format!("compose down failed ({})", failure_detail(&output))))
        }
    }

    async fn start(&self, unit: &ServiceUnit) -> Result<(), DriverError> {
        let mut args = vec!["up", "-d", "--remove-orphans"];
        if self.build {
            args.push("--build");
        }
        let output = self
            .run("restart", unit, &args, unit.start_timeout + COMMAND_GRACE)
            .await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(DriverError::Failed(format!("compose up failed ({})", failure_detail(&output))))
        }
    }

    async fn is_up(&self, unit: &ServiceUnit) -> Result<bool, DriverError> {
        let defined = self.services(unit, &["config", "--services"]).await?;
        let running = self
            .services(unit, &["ps", "--services", "--filter", "status=running"])
            .await?;
        Ok(all_services_running(&defined, &running))
    }

    /// Uses the same compose command the driver runs, resolved by systemd's PATH search
    async fn unit_commands(&self, unit: &ServiceUnit) -> UnitCommands {
        let (program, prefix) = self.compose_command().await;
        let mut base = vec![program.to_string()];
        base.extend(prefix.iter().map(|s| s.to_string()));
        let base = format!(
            "{} -f {} -p {}",
            base.join(" "),
            self.compose_path(&unit.work_dir).display(),
            unit.name
        );
        let build = if self.build { " --build" } else { "" };
        UnitCommands {
            pre_start: format!("{} down --timeout {}", base, unit.stop_timeout.as_secs()),
            start: format!("{} up -d --remove-orphans{}", base, build),
            stop: format!("{} down --timeout {}", base, unit.stop_timeout.as_secs()),
        }
    }
}

/// Detect which docker-compose command to use
///
/// Prefers the standalone `docker-compose` binary, falls back to `docker compose`
async fn detect_compose_command() -> (&'static str, Vec<&'static str>) {
    let check = Command::new("which")
        .arg("docker-compose")
        .output()
        .await;

    if check.map(|o| o.status.success()).unwrap_or(false) {
        ("docker-compose", vec![])
    } else {
        ("docker", vec!["compose"])
    }
}

fn parse_service_list(stdout: &str) -> BTreeSet<String> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

/// An empty project counts as down
fn all_services_running(defined: &BTreeSet<String>, running: &BTreeSet<String>) -> bool {
    !defined.is_empty() && defined.is_subset(running)
}
