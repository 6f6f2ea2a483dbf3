//! Public API for the in-process transcoding worker engine.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::executor::Outcome;

/// Configuration for the in-process engine (C7's owned state at INIT).
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Dispatcher base URL.
    pub dispatch_base_url: Url,
    /// Shared secret sent as `X-API-Key`, if non-empty.
    pub api_key: Option<String>,
    /// CA bundle used to verify the dispatcher's TLS certificate.
    pub ca_cert_path: Option<PathBuf>,
    /// Overrides the reported hostname; defaults to the system hostname.
    pub hostname_override: Option<String>,
    /// Overrides the generated `engine_id`.
    pub engine_id_override: Option<String>,
    /// Advertised local storage capacity in GB.
    pub storage_capacity_gb: f64,
    /// Whether this worker supports streaming transcodes.
    pub streaming_support: bool,
    /// Path to the ledger's SQLite database file.
    pub db_path: PathBuf,
    /// Directory for temporary input/output files.
    pub work_dir: PathBuf,
    /// Cadence of the idle poll loop.
    pub poll_interval: Duration,
    /// Cadence of the heartbeat ticker.
    pub heartbeat_interval: Duration,
    /// Cadence of the benchmark ticker.
    pub benchmark_interval: Duration,
    /// Timeout for control-plane (dispatcher) calls.
    pub control_timeout: Duration,
    /// Timeout for the transcoder subprocess.
    pub transcode_timeout: Duration,
    /// Maximum time to wait for the in-flight job during shutdown.
    pub drain_timeout: Duration,
}

impl EngineConfig {
    pub const DEFAULT_STORAGE_CAPACITY_GB: f64 = 100.0;
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
    pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
    pub const DEFAULT_BENCHMARK_INTERVAL: Duration = Duration::from_secs(5 * 60);
    pub const DEFAULT_CONTROL_TIMEOUT: Duration = Duration::from_secs(10);
    pub const DEFAULT_TRANSCODE_TIMEOUT: Duration = Duration::from_secs(2 * 60 * 60);
    pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

    pub fn new(dispatch_base_url: Url, db_path: PathBuf, work_dir: PathBuf) -> Self {
        Self {
            dispatch_base_url,
            api_key: None,
            ca_cert_path: None,
            hostname_override: None,
            engine_id_override: None,
            storage_capacity_gb: Self::DEFAULT_STORAGE_CAPACITY_GB,
            streaming_support: false,
            db_path,
            work_dir,
            poll_interval: Self::DEFAULT_POLL_INTERVAL,
            heartbeat_interval: Self::DEFAULT_HEARTBEAT_INTERVAL,
            benchmark_interval: Self::DEFAULT_BENCHMARK_INTERVAL,
            control_timeout: Self::DEFAULT_CONTROL_TIMEOUT,
            transcode_timeout: Self::DEFAULT_TRANSCODE_TIMEOUT,
            drain_timeout: Self::DEFAULT_DRAIN_TIMEOUT,
        }
    }
}

/// Engine event stream payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum EngineEvent {
    /// Engine finished INIT and entered RUNNING.
    Started,
    /// Graceful shutdown requested; entering DRAINING.
    StopRequested,
    /// A job was accepted and handed to the executor.
    JobStarted { job_id: String },
    /// A job reached a terminal outcome and was removed from the ledger.
    JobFinished {
        job_id: String,
        completed: bool,
        detail: String,
    },
    /// A non-fatal warning (degraded probe, best-effort report failure, ...).
    Warning { message: String },
    /// A non-fatal error.
    Error { message: String },
    /// Engine has fully stopped (STOPPED state reached).
    Stopped,
}

impl EngineEvent {
    pub(crate) fn job_finished(job_id: String, outcome: &Outcome) -> Self {
        match outcome {
            Outcome::Completed { output_url } => EngineEvent::JobFinished {
                job_id,
                completed: true,
                detail: output_url.clone(),
            },
            Outcome::Failed { reason } => EngineEvent::JobFinished {
                job_id,
                completed: false,
                detail: reason.clone(),
            },
        }
    }
}

/// Current engine state snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusSnapshot {
    pub stop_requested: bool,
    pub current_job: Option<String>,
    pub ledger_size: usize,
}

/// Handle to a running in-process engine instance.
pub struct EngineHandle {
    pub(crate) inner: std::sync::Arc<crate::controller::EngineInner>,
    pub(crate) join: tokio::task::JoinHandle<anyhow::Result<()>>,
}

impl EngineHandle {
    /// Subscribe to the engine event stream.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<EngineEvent> {
        self.inner.event_tx.subscribe()
    }

    /// Get the latest engine snapshot.
    pub fn snapshot(&self) -> StatusSnapshot {
        self.inner.snapshot_rx.borrow().clone()
    }

    /// Request a graceful shutdown (finish in-flight work, then stop).
    pub fn request_stop(&self) {
        self.inner.request_stop();
    }

    /// Wait for the engine to stop, returning the engine task's result.
    pub async fn wait(self) -> anyhow::Result<()> {
        match self.join.await {
            Ok(res) => res,
            Err(err) => Err(anyhow::anyhow!("engine task join error: {err}")),
        }
    }
}

/// Starts a new in-process engine instance against a real dispatcher and a
/// real `ffmpeg` subprocess.
pub fn start_engine(config: EngineConfig) -> EngineHandle {
    crate::controller::start_engine(config)
}
