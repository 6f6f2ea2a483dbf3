use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::debug;

use tcworker_core::{capability, CapabilitySnapshot, EngineIdentity};

use crate::dispatcher::{DispatcherClient, HeartbeatReport};
use crate::ledger::DurableJobSet;

/// Fires every `interval`, assembling and sending a heartbeat (C5). Missed
/// deadlines are skipped, never queued; the task never blocks the caller.
pub fn spawn(
    identity: Arc<EngineIdentity>,
    capabilities: Arc<CapabilitySnapshot>,
    dispatcher: Arc<dyn DispatcherClient>,
    mirror: Arc<RwLock<std::collections::BTreeSet<String>>>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            let ledger_snapshot: Vec<String> = mirror.read().await.iter().cloned().collect();
            let cpu_temperature = capability::cpu_temperature().await;
            let report = HeartbeatReport::build(
                &identity,
                &capabilities,
                cpu_temperature,
                &ledger_snapshot,
            );
            debug!(engine_id = %identity.engine_id, jobs = ledger_snapshot.len(), "sending heartbeat");
            dispatcher.heartbeat(&report).await;
        }
    })
}

/// Sends one final heartbeat synchronously, used during DRAINING.
pub async fn send_once(
    identity: &EngineIdentity,
    capabilities: &CapabilitySnapshot,
    dispatcher: &dyn DispatcherClient,
    ledger: &DurableJobSet,
) {
    let ledger_snapshot = ledger.list().await.unwrap_or_default();
    let cpu_temperature = capability::cpu_temperature().await;
    let report = HeartbeatReport::build(identity, capabilities, cpu_temperature, &ledger_snapshot);
    dispatcher.heartbeat(&report).await;
}
