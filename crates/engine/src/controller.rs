use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch, Notify, RwLock};
use tracing::{info, warn};

use tcworker_core::{CapabilitySnapshot, EngineIdentity};

use crate::api::{EngineConfig, EngineEvent, EngineHandle, StatusSnapshot};
use crate::dispatcher::{DispatcherClient, HttpDispatcherClient};
use crate::executor::{Outcome, ProcessTranscoder, TranscodeExecutor};
use crate::ledger::DurableJobSet;
use crate::{benchmark, heartbeat};

pub(crate) struct EngineInner {
    pub(crate) event_tx: broadcast::Sender<EngineEvent>,
    pub(crate) snapshot_rx: watch::Receiver<StatusSnapshot>,
    stop_requested: AtomicBool,
    notify: Notify,
}

impl EngineInner {
    pub(crate) fn request_stop(&self) {
        if !self.stop_requested.swap(true, Ordering::SeqCst) {
            let _ = self.event_tx.send(EngineEvent::StopRequested);
            self.notify.notify_waiters();
        }
    }

    fn should_stop(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }
}

pub(crate) fn start_engine(cfg: EngineConfig) -> EngineHandle {
    let (event_tx, _) = broadcast::channel::<EngineEvent>(1024);
    let (snapshot_tx, snapshot_rx) = watch::channel(StatusSnapshot {
        stop_requested: false,
        current_job: None,
        ledger_size: 0,
    });

    let inner = Arc::new(EngineInner {
        event_tx,
        snapshot_rx,
        stop_requested: AtomicBool::new(false),
        notify: Notify::new(),
    });

    let join = tokio::spawn(run_engine(inner.clone(), snapshot_tx, cfg, None, None));
    EngineHandle { inner, join }
}

/// Starts the engine against injected dispatcher/transcoder fakes, for tests.
#[cfg(test)]
pub(crate) fn start_engine_with(
    cfg: EngineConfig,
    dispatcher: Arc<dyn DispatcherClient>,
    transcoder: Box<dyn crate::executor::Transcoder>,
) -> EngineHandle {
    let (event_tx, _) = broadcast::channel::<EngineEvent>(1024);
    let (snapshot_tx, snapshot_rx) = watch::channel(StatusSnapshot {
        stop_requested: false,
        current_job: None,
        ledger_size: 0,
    });

    let inner = Arc::new(EngineInner {
        event_tx,
        snapshot_rx,
        stop_requested: AtomicBool::new(false),
        notify: Notify::new(),
    });

    let join = tokio::spawn(run_engine(
        inner.clone(),
        snapshot_tx,
        cfg,
        Some(dispatcher),
        Some(transcoder),
    ));
    EngineHandle { inner, join }
}

fn push_snapshot(
    snapshot_tx: &watch::Sender<StatusSnapshot>,
    inner: &EngineInner,
    current_job: Option<String>,
    ledger_size: usize,
) {
    let _ = snapshot_tx.send(StatusSnapshot {
        stop_requested: inner.should_stop(),
        current_job,
        ledger_size,
    });
}

async fn run_engine(
    inner: Arc<EngineInner>,
    snapshot_tx: watch::Sender<StatusSnapshot>,
    cfg: EngineConfig,
    dispatcher_override: Option<Arc<dyn DispatcherClient>>,
    transcoder_override: Option<Box<dyn crate::executor::Transcoder>>,
) -> anyhow::Result<()> {
    let identity = Arc::new(EngineIdentity {
        engine_id: cfg
            .engine_id_override
            .clone()
            .unwrap_or_else(EngineIdentity::generate_engine_id),
        hostname: EngineIdentity::resolve_hostname(cfg.hostname_override.clone()),
        dispatch_base_url: cfg.dispatch_base_url.clone(),
        api_key: cfg.api_key.clone(),
        ca_cert_path: cfg.ca_cert_path.clone(),
        storage_capacity_gb: cfg.storage_capacity_gb,
        streaming_support: cfg.streaming_support,
    });

    let ledger = match DurableJobSet::open(&cfg.db_path).await {
        Ok(ledger) => ledger,
        Err(err) => {
            let message = format!("failed to open job ledger: {err:#}");
            let _ = inner.event_tx.send(EngineEvent::Error {
                message: message.clone(),
            });
            let _ = inner.event_tx.send(EngineEvent::Stopped);
            return Err(anyhow::anyhow!(message));
        }
    };

    let dispatcher: Arc<dyn DispatcherClient> = match dispatcher_override {
        Some(dispatcher) => dispatcher,
        None => match HttpDispatcherClient::new(
            identity.dispatch_base_url.clone(),
            identity.api_key.clone(),
            identity.ca_cert_path.as_deref(),
            cfg.control_timeout,
        ) {
            Ok(client) => Arc::new(client),
            Err(err) => {
                let message = format!("failed to build dispatcher client: {err:#}");
                let _ = inner.event_tx.send(EngineEvent::Error {
                    message: message.clone(),
                });
                let _ = inner.event_tx.send(EngineEvent::Stopped);
                return Err(anyhow::anyhow!(message));
            }
        },
    };

    let capabilities = Arc::new(CapabilitySnapshot::probe().await);

    let loaded = ledger.list().await.unwrap_or_default();
    let mirror = Arc::new(RwLock::new(loaded.into_iter().collect::<BTreeSet<String>>()));

    replay_on_startup(&ledger, &mirror, dispatcher.as_ref(), &inner, &snapshot_tx).await;

    let _ = inner.event_tx.send(EngineEvent::Started);
    push_snapshot(&snapshot_tx, &inner, None, mirror.read().await.len());

    let heartbeat_handle = heartbeat::spawn(
        identity.clone(),
        capabilities.clone(),
        dispatcher.clone(),
        mirror.clone(),
        cfg.heartbeat_interval,
    );
    let benchmark_handle = benchmark::spawn(
        identity.engine_id.clone(),
        dispatcher.clone(),
        cfg.benchmark_interval,
    );

    let transfer_http = reqwest::Client::builder()
        .timeout(Duration::from_secs(30 * 60))
        .build()
        .unwrap_or_default();
    let transcoder = transcoder_override.unwrap_or_else(|| Box::new(ProcessTranscoder));
    let executor = TranscodeExecutor::new(
        transfer_http,
        transcoder,
        cfg.work_dir.clone(),
        cfg.transcode_timeout,
    );

    let result = poll_loop(
        &inner,
        &snapshot_tx,
        &ledger,
        &mirror,
        dispatcher.as_ref(),
        &executor,
        &identity.engine_id,
        cfg.poll_interval,
        cfg.drain_timeout,
    )
    .await;

    heartbeat_handle.abort();
    benchmark_handle.abort();
    heartbeat::send_once(&identity, &capabilities, dispatcher.as_ref(), &ledger).await;

    let _ = inner.event_tx.send(EngineEvent::Stopped);
    push_snapshot(&snapshot_tx, &inner, None, mirror.read().await.len());

    result
}

async fn replay_on_startup(
    ledger: &DurableJobSet,
    mirror: &Arc<RwLock<BTreeSet<String>>>,
    dispatcher: &dyn DispatcherClient,
    inner: &EngineInner,
    snapshot_tx: &watch::Sender<StatusSnapshot>,
) {
    let stale_job_ids: Vec<String> = mirror.read().await.iter().cloned().collect();
    if stale_job_ids.is_empty() {
        return;
    }

    warn!(
        count = stale_job_ids.len(),
        "replaying stale ledger entries from a previous run"
    );
    for job_id in stale_job_ids {
        dispatcher
            .fail_job(&job_id, "worker restarted mid-job")
            .await;
        if let Err(err) = ledger.remove(&job_id).await {
            warn!(job_id, error = %err, "failed to remove replayed job from ledger");
        }
        mirror.write().await.remove(&job_id);
        let _ = inner.event_tx.send(EngineEvent::JobFinished {
            job_id,
            completed: false,
            detail: "worker restarted mid-job".to_string(),
        });
    }
    push_snapshot(snapshot_tx, inner, None, mirror.read().await.len());
}

#[allow(clippy::too_many_arguments)]
async fn poll_loop(
    inner: &Arc<EngineInner>,
    snapshot_tx: &watch::Sender<StatusSnapshot>,
    ledger: &DurableJobSet,
    mirror: &Arc<RwLock<BTreeSet<String>>>,
    dispatcher: &dyn DispatcherClient,
    executor: &TranscodeExecutor,
    engine_id: &str,
    poll_interval: Duration,
    drain_timeout: Duration,
) -> anyhow::Result<()> {
    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        if inner.should_stop() {
            return Ok(());
        }

        tokio::select! {
            _ = inner.notify.notified() => {
                if inner.should_stop() {
                    return Ok(());
                }
            }
            _ = ticker.tick() => {
                if inner.should_stop() {
                    return Ok(());
                }

                if let Some(job) = dispatcher.assign_job(engine_id).await {
                    ledger.insert(&job.job_id).await?;
                    mirror.write().await.insert(job.job_id.clone());
                    push_snapshot(snapshot_tx, inner, Some(job.job_id.clone()), mirror.read().await.len());
                    let _ = inner.event_tx.send(EngineEvent::JobStarted { job_id: job.job_id.clone() });

                    let outcome = run_with_drain(executor, &job, inner, drain_timeout).await;
                    report_outcome(dispatcher, &job.job_id, &outcome).await;

                    if let Err(err) = ledger.remove(&job.job_id).await {
                        warn!(job_id = %job.job_id, error = %err, "failed to remove completed job from ledger");
                    }
                    mirror.write().await.remove(&job.job_id);

                    let _ = inner.event_tx.send(EngineEvent::job_finished(job.job_id.clone(), &outcome));
                    push_snapshot(snapshot_tx, inner, None, mirror.read().await.len());
                    info!(job_id = %job.job_id, ?outcome, "job terminal");
                }
            }
        }
    }
}

async fn report_outcome(dispatcher: &dyn DispatcherClient, job_id: &str, outcome: &Outcome) {
    match outcome {
        Outcome::Completed { output_url } => dispatcher.complete_job(job_id, output_url).await,
        Outcome::Failed { reason } => dispatcher.fail_job(job_id, reason).await,
    }
}

async fn run_with_drain(
    executor: &TranscodeExecutor,
    job: &crate::dispatcher::JobDescriptor,
    inner: &EngineInner,
    drain_timeout: Duration,
) -> Outcome {
    let exec_fut = executor.execute(job);
    tokio::pin!(exec_fut);

    tokio::select! {
        outcome = &mut exec_fut => outcome,
        _ = inner.notify.notified() => {
            warn!(job_id = %job.job_id, "shutdown requested mid-job; waiting up to drain_timeout");
            match tokio::time::timeout(drain_timeout, &mut exec_fut).await {
                Ok(outcome) => outcome,
                Err(_) => Outcome::Failed {
                    reason: "shutdown drain timeout".to_string(),
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::dispatcher::{DispatcherClient, HeartbeatReport, JobDescriptor};
    use crate::executor::{RunOutcome, Transcoder};

    #[derive(Default)]
    struct Recorder {
        assign_calls: AtomicUsize,
        heartbeat_calls: AtomicUsize,
        fail_calls: StdMutex<Vec<(String, String)>>,
        complete_calls: StdMutex<Vec<(String, String)>>,
    }

    struct FakeDispatcher {
        recorder: Arc<Recorder>,
        job_to_assign: StdMutex<Option<JobDescriptor>>,
    }

    #[async_trait]
    impl DispatcherClient for FakeDispatcher {
        async fn heartbeat(&self, _report: &HeartbeatReport) {
            self.recorder.heartbeat_calls.fetch_add(1, Ordering::SeqCst);
        }

        async fn benchmark_result(&self, _engine_id: &str, _duration_seconds: f64) {}

        async fn assign_job(&self, _engine_id: &str) -> Option<JobDescriptor> {
            self.recorder.assign_calls.fetch_add(1, Ordering::SeqCst);
            self.job_to_assign.lock().unwrap().take()
        }

        async fn complete_job(&self, job_id: &str, output_url: &str) {
            self.recorder
                .complete_calls
                .lock()
                .unwrap()
                .push((job_id.to_string(), output_url.to_string()));
        }

        async fn fail_job(&self, job_id: &str, error_message: &str) {
            self.recorder
                .fail_calls
                .lock()
                .unwrap()
                .push((job_id.to_string(), error_message.to_string()));
        }
    }

    struct NeverRunTranscoder;

    #[async_trait]
    impl Transcoder for NeverRunTranscoder {
        async fn run(&self, _argv: &[String], _timeout: Duration) -> RunOutcome {
            panic!("transcoder should never be invoked in this scenario");
        }
    }

    fn test_config(db_path: std::path::PathBuf, work_dir: std::path::PathBuf) -> EngineConfig {
        let mut cfg = EngineConfig::new(
            url::Url::parse("http://dispatcher.invalid/").unwrap(),
            db_path,
            work_dir,
        );
        cfg.poll_interval = Duration::from_millis(20);
        cfg.heartbeat_interval = Duration::from_millis(30);
        cfg.benchmark_interval = Duration::from_secs(3600);
        cfg.drain_timeout = Duration::from_millis(200);
        cfg
    }

    #[tokio::test]
    async fn idle_polling_assigns_nothing_but_keeps_polling_and_heartbeating() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path().join("jobs.db"), dir.path().to_path_buf());

        let recorder = Arc::new(Recorder::default());
        let dispatcher: Arc<dyn DispatcherClient> = Arc::new(FakeDispatcher {
            recorder: recorder.clone(),
            job_to_assign: StdMutex::new(None),
        });

        let handle = start_engine_with(cfg, dispatcher, Box::new(NeverRunTranscoder));

        tokio::time::sleep(Duration::from_millis(150)).await;
        handle.request_stop();
        handle.wait().await.unwrap();

        assert!(recorder.assign_calls.load(Ordering::SeqCst) >= 3);
        assert!(recorder.heartbeat_calls.load(Ordering::SeqCst) >= 2);
        assert!(recorder.fail_calls.lock().unwrap().is_empty());
        assert!(recorder.complete_calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn restart_with_stale_ledger_entry_fails_it_before_polling_for_new_work() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("jobs.db");

        {
            let ledger = DurableJobSet::open(&db_path).await.unwrap();
            ledger.insert("J9").await.unwrap();
        }

        let cfg = test_config(db_path.clone(), dir.path().to_path_buf());
        let recorder = Arc::new(Recorder::default());
        let dispatcher: Arc<dyn DispatcherClient> = Arc::new(FakeDispatcher {
            recorder: recorder.clone(),
            job_to_assign: StdMutex::new(None),
        });

        let handle = start_engine_with(cfg, dispatcher, Box::new(NeverRunTranscoder));
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.request_stop();
        handle.wait().await.unwrap();

        let fails = recorder.fail_calls.lock().unwrap();
        assert_eq!(
            fails.as_slice(),
            &[("J9".to_string(), "worker restarted mid-job".to_string())]
        );

        let reopened = DurableJobSet::open(&db_path).await.unwrap();
        assert!(reopened.list().await.unwrap().is_empty());
    }
}
