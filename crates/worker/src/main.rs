mod cli;
mod shutdown;

use clap::Parser;

use tcworker_engine::{start_engine, EngineConfig, EngineEvent};

use crate::cli::Cli;
use crate::shutdown::{spawn_ctrl_c_handler, ShutdownController, ShutdownEvent};

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();

    let cli = Cli::parse_from(cli::filter_known_args(std::env::args()));

    let mut config = EngineConfig::new(
        cli.dispatch_url.clone(),
        cli.db_path.clone(),
        std::env::current_dir()?,
    );
    config.ca_cert_path = cli.ca_cert.clone();
    config.api_key = cli.api_key.filter(|key| !key.is_empty());
    config.hostname_override = cli.hostname.clone();

    let engine = start_engine(config);
    let mut events = engine.subscribe();

    let shutdown = std::sync::Arc::new(ShutdownController::new());
    let (shutdown_tx, mut shutdown_rx) = tokio::sync::mpsc::unbounded_channel::<ShutdownEvent>();
    spawn_ctrl_c_handler(shutdown.clone(), shutdown_tx);

    tracing::info!(dispatch_url = %cli.dispatch_url, "tcworker starting");

    let mut immediate_exit = false;

    loop {
        tokio::select! {
            ev_opt = shutdown_rx.recv() => {
                match ev_opt {
                    Some(ShutdownEvent::Graceful) => {
                        tracing::info!("stop requested; finishing current job before exiting (ctrl-c again to exit immediately)");
                        engine.request_stop();
                    }
                    Some(ShutdownEvent::Immediate) => {
                        tracing::warn!("stop requested again; exiting immediately");
                        immediate_exit = true;
                        break;
                    }
                    None => {}
                }
            }
            evt = events.recv() => {
                let evt = match evt {
                    Ok(v) => v,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                };

                match evt {
                    EngineEvent::Started => tracing::info!("engine running"),
                    EngineEvent::StopRequested => {}
                    EngineEvent::JobStarted { job_id } => {
                        tracing::info!(job_id, "job accepted");
                    }
                    EngineEvent::JobFinished { job_id, completed, detail } => {
                        tracing::info!(job_id, completed, detail, "job terminal");
                    }
                    EngineEvent::Warning { message } => tracing::warn!("{message}"),
                    EngineEvent::Error { message } => tracing::error!("{message}"),
                    EngineEvent::Stopped => break,
                }
            }
        }
    }

    if immediate_exit {
        std::process::exit(130);
    }

    engine.wait().await?;
    Ok(())
}
