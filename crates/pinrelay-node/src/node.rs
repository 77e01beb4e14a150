//! Node runtime: wires the scheduler and the reconnecting client together.
//!
//! Shutdown order: the client unregisters first, then the scheduler is
//! cancelled and joined, then every configured pin is driven low. A
//! reconnect that gives up cancels `cancel_token` so the rest of the
//! process stops too.

use std::sync::Arc;

use chrono::Local;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use pinrelay_core::Actuator;

use crate::client::ReconnectingClient;
use crate::config::NodeConfig;
use crate::dispatch::{report_channel, LocalDispatch};
use crate::error::{NodeError, Result};
use crate::scheduler::spawn_scheduler;

/// Runs one node until `cancel_token` fires or the dispatcher is lost for good.
pub async fn run_node(
    config: NodeConfig,
    actuator: Arc<dyn Actuator>,
    cancel_token: CancellationToken,
) -> Result<()> {
    let (reports_tx, reports_rx) = report_channel();
    let dispatch = LocalDispatch::new(actuator, reports_tx);

    let scheduler_token = cancel_token.child_token();
    let (scheduler, scheduler_task) = spawn_scheduler(
        config.initial_schedule(Local::now()),
        dispatch.clone(),
        scheduler_token.clone(),
    );

    let started = ReconnectingClient::start(
        config.server.clone(),
        config.pins.clone(),
        config.client.clone(),
        dispatch.clone(),
        scheduler,
        reports_rx,
        cancel_token.clone(),
    )
    .await;

    let result = match started {
        Ok(client) => {
            info!(server = %config.server, "Node running");
            client.run().await
        }
        Err(e) => {
            error!(error = %e, "Node failed to start");
            Err(e)
        }
    };

    if let Err(NodeError::ReconnectExhausted { attempts }) = &result {
        error!(attempts, "Dispatcher unreachable, stopping the process");
        cancel_token.cancel();
    }

    scheduler_token.cancel();
    if let Err(e) = scheduler_task.await {
        warn!(error = %e, "Scheduler task failed");
    }

    dispatch.clear(&config.pins);
    info!("All pins cleared");

    result
}
