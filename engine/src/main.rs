use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

use zora_core::{EngineConfig, Orchestrator};
use zora_observability::{canonical_logs_dir, init_engine_logging};
use zora_providers::Provider;
use zora_server::{serve, AppState};
use zora_types::TaskSpec;

const LOG_RETENTION_DAYS: u64 = 14;

#[derive(Parser, Debug)]
#[command(name = "zora-engine")]
#[command(about = "Headless Zora agent engine")]
struct Cli {
    /// State directory; defaults to $ZORA_STATE_DIR, then ~/.zora.
    #[arg(long, env = "ZORA_STATE_DIR", global = true)]
    state_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the engine with the dashboard API and background sweeps.
    Serve {
        #[arg(long, alias = "host", default_value = "127.0.0.1")]
        hostname: String,
        #[arg(long, default_value_t = 3600)]
        port: u16,
    },
    /// Submit one task, wait for it, print the result.
    Run { prompt: String },
    /// Show provider and queue status, then exit.
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let state_dir = resolve_state_dir(cli.state_dir);
    let _log_guard = init_engine_logging(&canonical_logs_dir(&state_dir), LOG_RETENTION_DAYS)?;

    let config = EngineConfig::load(&state_dir.join("config.toml"))
        .context("config.toml is invalid; refusing to boot")?;

    match cli.command {
        Command::Serve { hostname, port } => {
            let addr: SocketAddr = format!("{hostname}:{port}")
                .parse()
                .context("invalid hostname or port")?;
            let orchestrator = Orchestrator::boot(state_dir.clone(), config).await?;
            orchestrator.start_scheduler().await;
            log_startup_paths(&state_dir, &addr);

            let state = AppState::new(orchestrator.clone());
            let shutdown_target = orchestrator.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    shutdown_target.shutdown().await;
                    std::process::exit(0);
                }
            });
            serve(addr, state).await?;
        }
        Command::Run { prompt } => {
            let orchestrator = Orchestrator::boot(state_dir, config).await?;
            let job_id = orchestrator.submit_task(TaskSpec::new(prompt)).await?;
            orchestrator.wait_for(&job_id).await;
            let events = orchestrator.sessions().read(&job_id).await?;
            for event in &events {
                if let zora_types::EventKind::Done { text, .. } = &event.kind {
                    println!("{text}");
                }
            }
            orchestrator.shutdown().await;
        }
        Command::Status => {
            let orchestrator = Orchestrator::boot(state_dir, config).await?;
            for provider in orchestrator.providers() {
                let auth = provider.check_auth().await;
                let quota = provider.get_quota_status().await;
                println!(
                    "{:<20} rank={} tier={:?} auth={} exhausted={} health={:.2}",
                    provider.spec().name,
                    provider.spec().rank,
                    provider.spec().cost_tier,
                    if auth.valid { "ok" } else { "invalid" },
                    quota.is_exhausted,
                    quota.health_score,
                );
            }
            let retries = orchestrator.retry_queue().entries().await;
            println!("{} retry entries pending", retries.len());
            orchestrator.shutdown().await;
        }
    }
    Ok(())
}

fn resolve_state_dir(flag: Option<PathBuf>) -> PathBuf {
    if let Some(dir) = flag {
        return dir;
    }
    dirs_home()
        .map(|home| home.join(".zora"))
        .unwrap_or_else(|| PathBuf::from(".zora"))
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

fn log_startup_paths(state_dir: &PathBuf, addr: &SocketAddr) {
    let exe = std::env::current_exe().unwrap_or_else(|_| PathBuf::from("<unknown>"));
    info!("starting zora-engine on http://{addr}");
    info!(
        "startup paths: exe={} state_dir={} config={}",
        exe.display(),
        state_dir.display(),
        state_dir.join("config.toml").display()
    );
}
