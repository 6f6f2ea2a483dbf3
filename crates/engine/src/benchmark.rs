use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tracing::debug;

use crate::dispatcher::DispatcherClient;

/// Fires every `interval`, running a bounded synthetic workload and
/// reporting its duration (C6). Runs as its own task so it never starves
/// the poll loop or the heartbeat ticker.
pub fn spawn(
    engine_id: String,
    dispatcher: Arc<dyn DispatcherClient>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            let duration_seconds = run_benchmark().await;
            debug!(engine_id = %engine_id, duration_seconds, "benchmark complete");
            dispatcher
                .benchmark_result(&engine_id, duration_seconds)
                .await;
        }
    })
}

/// Bounded synthetic workload. Upstream, this was a trivial 5-second sleep;
/// kept as-is rather than invented into a real transcode benchmark.
async fn run_benchmark() -> f64 {
    let started = Instant::now();
    tokio::time::sleep(Duration::from_secs(5)).await;
    started.elapsed().as_secs_f64()
}
