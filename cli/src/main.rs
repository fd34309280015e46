//! Kindling CLI binary
//!
//! Starts, stops and inspects the services declared in a TOML file.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use cli::{
    clear_session, load_config, render_check, render_start, render_status, render_status_json,
    render_stop, restore_session, save_session, session_file, system_supervisor,
    unreachable_services, DEFAULT_CONFIG,
};
use kindling_core::config::ServicesFile;
use kindling_core::{forward_events, Supervisor, TracingSink};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "kindling")]
#[command(about = "Start a local service stack in dependency order")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Services file
    #[arg(long, global = true, env = "KINDLING_CONFIG", default_value = DEFAULT_CONFIG)]
    config: PathBuf,

    /// Log level used when RUST_LOG is unset
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Start every service and exit, leaving detached services running
    Start,
    /// Start every service, wait for Ctrl-C, then stop them
    Run,
    /// Stop services left running by an earlier start
    Stop,
    /// Show reconciled service states
    Status {
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Validate the services file and print the start order
    Check,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = kindling_core::utils::init_tracing(&cli.log_level) {
        eprintln!("warning: {e}");
    }

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Command failed: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    let supervisor = Arc::new(system_supervisor(config.clone())?);
    let forwarder = forward_events(supervisor.subscribe(), Arc::new(TracingSink::new()));

    let session = session_file(&cli.config);
    let result = execute(cli.command, &config, &supervisor, &session).await;

    drop(supervisor);
    let _ = forwarder.await;
    result
}

async fn execute(
    command: Commands,
    config: &ServicesFile,
    supervisor: &Arc<Supervisor>,
    session: &Path,
) -> anyhow::Result<()> {
    match command {
        Commands::Start => {
            refuse_recorded_session(supervisor, session).await?;
            let report = supervisor.start().await?;
            save_session(supervisor, session)
                .await
                .with_context(|| format!("recording session in {}", session.display()))?;
            print!("{}", render_start(&report));
            Ok(())
        }
        Commands::Run => {
            refuse_recorded_session(supervisor, session).await?;
            let starting = {
                let supervisor = Arc::clone(supervisor);
                tokio::spawn(async move { supervisor.start().await })
            };
            tokio::pin!(starting);

            let interrupted = tokio::select! {
                joined = &mut starting => {
                    let report = joined.context("start task panicked")??;
                    if let Err(e) = save_session(supervisor, session).await {
                        warn!("Could not record session in {}: {}", session.display(), e);
                    }
                    print!("{}", render_start(&report));
                    info!("Press Ctrl-C to stop");
                    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
                    false
                }
                signal = tokio::signal::ctrl_c() => {
                    signal.context("waiting for Ctrl-C")?;
                    true
                }
            };

            let report = supervisor.stop().await;
            if interrupted {
                // Stop cancelled the start; collect its partial report
                if let Ok(Ok(partial)) = starting.await {
                    print!("{}", render_start(&partial));
                }
            }
            if report.failures.is_empty() {
                clear_session(session)?;
            }
            print!("{}", render_stop(&report));
            Ok(())
        }
        Commands::Stop => {
            let restored = restore_session(supervisor, session)
                .await
                .with_context(|| format!("reading {}", session.display()))?;
            let unreachable = unreachable_services(config, restored.as_ref());
            if restored.is_none() && !unreachable.is_empty() {
                warn!(
                    "No session recorded in {}; only match patterns can be swept, not: {}",
                    session.display(),
                    unreachable.join(", ")
                );
            }

            let report = supervisor.stop().await;
            print!("{}", render_stop(&report));
            if !report.failures.is_empty() {
                bail!("{} service(s) could not be stopped", report.failures.len())
            }
            clear_session(session)?;
            if restored.is_some() && !unreachable.is_empty() {
                bail!(
                    "no PID or matchPattern to stop: {}",
                    unreachable.join(", ")
                )
            }
            Ok(())
        }
        Commands::Status { json } => {
            restore_session(supervisor, session)
                .await
                .with_context(|| format!("reading {}", session.display()))?;
            let report = supervisor.status().await?;
            if json {
                println!("{}", render_status_json(&report)?);
            } else {
                print!("{}", render_status(&report));
            }
            Ok(())
        }
        Commands::Check => {
            print!("{}", render_check(config, supervisor)?);
            Ok(())
        }
    }
}

/// Fail when an earlier `start` left a session that was never stopped
async fn refuse_recorded_session(supervisor: &Supervisor, session: &Path) -> anyhow::Result<()> {
    let restored = restore_session(supervisor, session)
        .await
        .with_context(|| format!("reading {}", session.display()))?;
    if restored.is_some() {
        bail!(
            "a session recorded in {} is still active; run `kindling stop` first",
            session.display()
        );
    }
    Ok(())
}
