//! 命令执行器
//!
//! 提供统一的外部命令执行接口，支持：
//! - 超时控制（超时后进程被终止）
//! - stdout/stderr 逐行写入 tracing 日志

use std::path::Path;
use std::process::{Output, Stdio};
use std::time::Duration;
use tokio::process::Command;
use tracing::{info, warn};

/// 命令执行器
pub struct CommandRunner;

/// 命令执行错误
#[derive(Debug)]
pub enum CommandError {
    /// 命令启动失败
    SpawnFailed(std::io::Error),
    /// 命令超时
    Timeout(Duration),
}

impl std::fmt::Display for CommandError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandError::SpawnFailed(e) => write!(f, "Failed to spawn command: {}", e),
            CommandError::Timeout(t) => write!(f, "Command timed out after {:?}", t),
        }
    }
}

impl std::error::Error for CommandError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CommandError::SpawnFailed(e) => Some(e),
            CommandError::Timeout(_) => None,
        }
    }
}

impl CommandRunner {
    /// 执行简单命令（无流式输出）
    ///
    /// 超时后子进程随 future 一起被丢弃并终止
    pub async fn run_simple(
        program: &str,
        args: &[&str],
        work_dir: &Path,
        timeout: Duration,
    ) -> Result<Output, CommandError> {
        let child = Command::new(program)
            .args(args)
            .current_dir(work_dir)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        tokio::select! {
            result = child => {
                result.map_err(CommandError::SpawnFailed)
            }
            _ = tokio::time::sleep(timeout) => {
                Err(CommandError::Timeout(timeout))
            }
        }
    }

    /// 执行命令并把输出写入日志
    ///
    /// `stage` 作为日志字段，便于在 CI 日志中区分阶段
    pub async fn run_logged(
        stage: &'static str,
        program: &str,
        args: &[&str],
        work_dir: &Path,
        timeout: Duration,
    ) -> Result<Output, CommandError> {
        info!(stage, ">>> {} {}", program, args.join(" "));
        let output = Self::run_simple(program, args, work_dir, timeout).await?;
        log_output(stage, &output);
        Ok(output)
    }
}

/// 把命令输出逐行写入日志
pub fn log_output(stage: &'static str, output: &Output) {
    for line in String::from_utf8_lossy(&output.stdout).lines() {
        if !line.trim().is_empty() {
            info!(stage, stream = "stdout", "{}", line);
        }
    }
    // compose 的进度信息通常写在 stderr，成功时按 info 记录
    for line in String::from_utf8_lossy(&output.stderr).lines() {
        if line.trim().is_empty() {
            continue;
        }
        if output.status.success() {
            info!(stage, stream = "stderr", "{}", line);
        } else {
            warn!(stage, stream = "stderr", "{}", line);
        }
    }
}

/// 提取失败命令的诊断信息（stderr 最后一行非空内容）
pub fn failure_detail(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let last = stderr
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .map(|l| l.trim().to_string());
    match (last, output.status.code()) {
        (Some(line), Some(code)) => format!("exit code {}: {}", code, line),
        (Some(line), None) => line,
        (None, Some(code)) => format!("exit code {}", code),
        (None, None) => "terminated by signal".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[tokio::test]
    async fn test_run_simple_success() {
        let result = CommandRunner::run_simple(
            "echo",
            &["hello"],
            &PathBuf::from("/tmp"),
            Duration::from_secs(5),
        )
        .await;

        assert!(result.is_ok());
        let output = result.unwrap();
        assert!(output.status.success());
        assert!(String::from_utf8_lossy(&output.stdout).contains("hello"));
    }

    #[tokio::test]
    async fn test_run_simple_not_found() {
        let result = CommandRunner::run_simple(
            "nonexistent_command_12345",
            &[],
            &PathBuf::from("/tmp"),
            Duration::from_secs(5),
        )
        .await;

        assert!(matches!(result, Err(CommandError::SpawnFailed(_))));
    }

    #[tokio::test]
    async fn test_run_simple_timeout() {
        let result = CommandRunner::run_simple(
            "sleep",
            &["5"],
            &PathBuf::from("/tmp"),
            Duration::from_millis(100),
        )
        .await;

        assert!(matches!(result, Err(CommandError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_failure_detail_uses_last_stderr_line() {
        let output = CommandRunner::run_simple(
            "sh",
            &["-c", "echo first >&2; echo 'fatal: Not possible to fast-forward' >&2; exit 128"],
            &PathBuf::from("/tmp"),
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        assert_eq!(
            failure_detail(&output),
            "exit code 128: fatal: Not possible to fast-forward"
        );
    }
}
