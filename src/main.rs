//! Stack Deploy Agent
//!
//! Usage:
//! - Deploy latest branch tip: `stack-deploy-agent deploy`
//! - Deploy a revision, fail if another run holds the lock:
//!   `stack-deploy-agent deploy --revision v1.4 --no-wait`
//! - Restart only (takes the deployment lock): `stack-deploy-agent restart`
//! - Render the systemd unit: `stack-deploy-agent unit > /etc/systemd/system/rag-stack.service`
//! - Webhook server: `stack-deploy-agent serve --port 9876`

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use stack_deploy_agent::config::EnvConfig;
use stack_deploy_agent::domain::deploy::Trigger;
use stack_deploy_agent::domain::unit::render_systemd_unit;
use stack_deploy_agent::services::readiness::{probe_for, probe_until_listening};
use stack_deploy_agent::services::{build_orchestrator, build_supervisor, LockMode};
use stack_deploy_agent::state::AppState;

/// Stack Deploy Agent - update, restart and verify a single-host application stack
#[derive(Parser, Debug)]
#[command(name = "stack-deploy-agent")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Working directory of the deployed checkout (overrides DEPLOY_WORK_DIR)
    #[arg(long, global = true)]
    work_dir: Option<PathBuf>,

    /// Load environment variables from this file instead of ./.env
    #[arg(long, global = true)]
    env_file: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Update the checkout, restart the stack and wait for the public port
    Deploy {
        /// Revision to fast-forward to (defaults to the configured branch tip)
        #[arg(long)]
        revision: Option<String>,

        /// Fail immediately if another deployment holds the lock
        #[arg(long)]
        no_wait: bool,
    },

    /// Restart the stack without updating or probing
    Restart {
        /// Fail immediately if a deployment holds the lock
        #[arg(long)]
        no_wait: bool,
    },

    /// Query and print the unit state
    Status,

    /// Run the readiness probe loop only
    Probe {
        /// Port to probe (defaults to DEPLOY_PROBE_PORT)
        #[arg(long)]
        port: Option<u16>,
    },

    /// Print the systemd unit file for the stack
    Unit,

    /// Run the webhook trigger server
    Serve {
        /// Listen port (defaults to PORT)
        #[arg(long)]
        port: Option<u16>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            std::process::exit(1);
        }
    }
}

async fn run(cli: Cli) -> Result<i32> {
    load_env_file(cli.env_file.as_deref())?;
    stack_deploy_agent::init_tracing(cli.json_logs);

    let mut config = EnvConfig::from_env();
    if let Some(work_dir) = cli.work_dir {
        config = config.with_work_dir(work_dir);
    }

    match cli.command {
        Commands::Deploy { revision, no_wait } => {
            config.validate().context("invalid configuration")?;
            let trigger = Trigger::new(revision);
            if let Err(reason) = trigger.validate() {
                anyhow::bail!(reason);
            }

            let supervisor = Arc::new(build_supervisor(&config));
            let orchestrator = build_orchestrator(&config, supervisor)
                .context("failed to build readiness probe")?;
            let lock_mode = if no_wait { LockMode::FailFast } else { LockMode::Wait };

            let report = orchestrator.run(trigger, lock_mode).await;
            let message = report.attempt.message.clone().unwrap_or_default();
            if report.is_success() {
                println!("{}", message);
            } else {
                eprintln!("{}", message);
            }
            Ok(report.exit_code())
        }

        Commands::Restart { no_wait } => {
            let supervisor = Arc::new(build_supervisor(&config));
            let orchestrator = build_orchestrator(&config, supervisor.clone())
                .context("failed to build readiness probe")?;
            let lock_mode = if no_wait { LockMode::FailFast } else { LockMode::Wait };

            match orchestrator.restart_only(lock_mode).await {
                Ok(state) => {
                    println!("{}: {}", supervisor.unit().name, state);
                    Ok(0)
                }
                Err(e) => {
                    eprintln!("Restart failed: {}", e);
                    Ok(e.exit_code())
                }
            }
        }

        Commands::Status => {
            let supervisor = build_supervisor(&config);
            let state = supervisor
                .observe()
                .await
                .with_context(|| format!("failed to query unit '{}'", supervisor.unit().name))?;
            println!("{}: {}", supervisor.unit().name, state);
            Ok(0)
        }

        Commands::Probe { port } => {
            let mut policy = config.readiness.clone();
            if let Some(port) = port {
                policy.port = port;
            }
            config.readiness = policy.clone();
            config.validate().context("invalid configuration")?;

            let probe = probe_for(&policy).context("failed to build readiness probe")?;
            match probe_until_listening(probe.as_ref(), policy.plan(), policy.port, |_| {}).await {
                Ok(summary) => {
                    println!(
                        "Port {} is listening (probe {}/{})",
                        summary.port, summary.probes_issued, policy.probe_budget
                    );
                    Ok(0)
                }
                Err(e) => {
                    eprintln!("Readiness check failed: {}", e);
                    Ok(4)
                }
            }
        }

        Commands::Unit => {
            let supervisor = build_supervisor(&config);
            let unit = supervisor.unit();
            let commands = supervisor.driver().unit_commands(unit).await;
            print!("{}", render_systemd_unit(unit, &commands));
            Ok(0)
        }

        Commands::Serve { port } => {
            config.validate_server().context("invalid configuration")?;
            let port = port.unwrap_or(config.port);
            let state = AppState::new(config).context("failed to initialize agent")?;
            stack_deploy_agent::run_server(Arc::new(state), port)
                .await
                .context("webhook server failed")?;
            Ok(0)
        }
    }
}

/// 显式指定的文件必须存在；默认的 ./.env 可以缺失
fn load_env_file(path: Option<&std::path::Path>) -> Result<()> {
    match path {
        Some(path) => {
            dotenvy::from_path(path)
                .with_context(|| format!("failed to load env file {}", path.display()))?;
        }
        None => {
            dotenvy::dotenv().ok();
        }
    }
    Ok(())
}
