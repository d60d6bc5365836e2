//! `cronkit` — standalone host for tasks declared in `cronkit.toml`.
//!
//! - `run` (default): start the scheduler and log every fire until Ctrl-C.
//! - `check`: validate the config and print upcoming fire times.

use chrono::Utc;
use clap::{Parser, Subcommand};
use cronkit_core::CronkitConfig;
use cronkit_scheduler::service::build_task;
use cronkit_scheduler::{handler_fn, CronService, Handler};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "cronkit")]
#[command(about = "Embedded periodic task scheduler")]
#[command(version)]
struct Cli {
    /// Config file (default: ~/.cronkit/cronkit.toml)
    #[arg(short, long, env = "CRONKIT_CONFIG")]
    config: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the scheduler until interrupted (default)
    Run,
    /// Validate the config and show the next fire times of every task
    Check {
        /// Fire times to show per task
        #[arg(short = 'n', long, default_value_t = 3)]
        count: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cronkit=info,cronkit_scheduler=info".into()),
        )
        .init();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let config = CronkitConfig::load(cli.config.as_deref()).unwrap_or_else(|e| {
                warn!("Config load failed ({}), using defaults", e);
                CronkitConfig::default()
            });
            run(config).await
        }
        Commands::Check { count } => {
            // No fallback here: reporting the error is the point.
            let config = CronkitConfig::load(cli.config.as_deref())?;
            check(&config, count)
        }
    }
}

async fn run(config: CronkitConfig) -> anyhow::Result<()> {
    let names: Vec<String> = config.tasks.keys().cloned().collect();
    let service = CronService::new(config)?;
    for name in &names {
        service.register(name, log_fire())?;
    }
    if names.is_empty() {
        warn!("no tasks configured; the scheduler will idle");
    }

    service.start()?;
    info!(tasks = names.len(), "cronkit running, press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    service.close().await?;
    service.scheduler().wait_idle().await;
    info!("all executions finished");
    Ok(())
}

/// Handler bound to every configured task: records the fire.
fn log_fire() -> Handler {
    handler_fn(|ctx| async move {
        let lag_ms = ctx
            .scheduled_at()
            .map(|at| (Utc::now() - at).num_milliseconds())
            .unwrap_or(0);
        info!(task = %ctx.task_name(), lag_ms, "fired");
        Ok(())
    })
}

fn check(config: &CronkitConfig, count: usize) -> anyhow::Result<()> {
    if config.tasks.is_empty() {
        println!("no tasks configured");
        return Ok(());
    }
    let now = Utc::now();
    for (name, spec) in &config.tasks {
        let state = if spec.enabled { "enabled" } else { "disabled" };
        println!("{name} ({state})");

        // Preview as enabled so disabled tasks still show their schedule.
        let preview = build_task(
            name,
            &cronkit_core::TaskSpec {
                enabled: true,
                ..spec.clone()
            },
            log_fire(),
        )?;
        let mut t = now;
        let mut shown = 0;
        while shown < count {
            let Some(next) = preview.make_next_trigger_time(t) else {
                break;
            };
            println!("  {}", next.to_rfc3339());
            t = next;
            shown += 1;
        }
        if shown == 0 {
            println!("  (no upcoming fires)");
        }
    }
    Ok(())
}
