//! Run command - executes one chain and streams its lifecycle events

use clap::Args;
use tokio::signal;
use tokio::sync::watch;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tracing::{info, warn};

use super::{load_config, DefinitionsArgs};
use crate::domain::chain::{ChainError, ChainStatus};
use crate::infrastructure::chain::{CancelRequest, StartExecution};
use crate::infrastructure::observability::{init_metrics, shutdown_tracing};

#[derive(Args, Clone, Debug)]
pub struct RunArgs {
    /// Name of the chain to run
    pub chain: String,

    #[arg(long, default_value = "default")]
    pub namespace: String,

    #[arg(long, default_value = "default")]
    pub tenant: String,

    /// Trigger payload as JSON
    #[arg(long, default_value = "{}")]
    pub payload: String,

    #[command(flatten)]
    pub definitions: DefinitionsArgs,
}

pub async fn run(args: RunArgs) -> anyhow::Result<()> {
    let config = load_config(&args.definitions);
    init_metrics(&config.observability.metrics);

    let payload: serde_json::Value = serde_json::from_str(&args.payload)
        .map_err(|e| anyhow::anyhow!("Invalid --payload JSON: {}", e))?;

    let engine = crate::create_engine(&config).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let supervisor = engine.start_supervisor(shutdown_rx);

    // Subscribe before starting so no event is missed
    let mut events = BroadcastStream::new(engine.service.subscribe());

    let chain_id = engine
        .service
        .create_execution(StartExecution::new(
            &args.chain,
            &args.namespace,
            &args.tenant,
            payload,
        ))
        .await?;
    info!(chain_id = %chain_id, chain = %args.chain, "Execution started");

    let interrupt = shutdown_signal();
    tokio::pin!(interrupt);
    let mut interrupted = false;

    loop {
        tokio::select! {
            event = events.next() => {
                let Some(event) = event else { break };
                let event = match event {
                    Ok(event) => event,
                    Err(e) => {
                        warn!(error = %e, "Event stream lagged");
                        continue;
                    }
                };

                println!("{}", serde_json::to_string(&event)?);
                if event.chain_id == chain_id && event.is_terminal() {
                    break;
                }
            }
            _ = &mut interrupt, if !interrupted => {
                interrupted = true;
                let request = CancelRequest::new(chain_id.clone())
                    .with_reason("interrupted")
                    .with_cancelled_by("cli");
                match engine.service.cancel_execution(request).await {
                    Ok(_) | Err(ChainError::Conflict(_)) => {}
                    Err(e) => warn!(error = %e, "Failed to cancel execution"),
                }
            }
        }
    }

    let execution = engine.service.get_execution(&chain_id).await?;
    println!("{}", serde_json::to_string_pretty(&execution)?);

    shutdown_tx.send(true).ok();
    supervisor.await.ok();
    shutdown_tracing();

    if execution.status() != ChainStatus::Completed {
        anyhow::bail!(
            "Execution {} ended {}{}",
            chain_id,
            execution.status(),
            execution
                .error()
                .map(|e| format!(": {}", e))
                .unwrap_or_default()
        );
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, cancelling execution");
        }
        _ = terminate => {
            info!("Received SIGTERM, cancelling execution");
        }
    }
}
