use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use tcworker_core::{CapabilitySnapshot, EngineIdentity};

/// A job handed out by the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobDescriptor {
    pub job_id: String,
    pub source_url: String,
    pub target_codec: String,
}

/// Heartbeat payload. `local_job_queue` is pre-serialized JSON (a string
/// containing a JSON array), matching the dispatcher's existing contract.
#[derive(Debug, Clone, Serialize)]
pub struct HeartbeatReport {
    pub engine_id: String,
    pub status: &'static str,
    pub storage_capacity_gb: f64,
    pub streaming_support: bool,
    pub encoders: String,
    pub decoders: String,
    pub hwaccels: String,
    pub cpu_temperature: f64,
    pub local_job_queue: String,
    pub hostname: String,
}

impl HeartbeatReport {
    pub fn build(
        identity: &EngineIdentity,
        capabilities: &CapabilitySnapshot,
        cpu_temperature: f64,
        ledger_snapshot: &[String],
    ) -> Self {
        Self {
            engine_id: identity.engine_id.clone(),
            status: "idle",
            storage_capacity_gb: identity.storage_capacity_gb,
            streaming_support: identity.streaming_support,
            encoders: capabilities.encoders.clone(),
            decoders: capabilities.decoders.clone(),
            hwaccels: capabilities.hwaccels.clone(),
            cpu_temperature,
            local_job_queue: serde_json::to_string(ledger_snapshot)
                .unwrap_or_else(|_| "[]".to_string()),
            hostname: identity.hostname.clone(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DispatcherError {
    #[error("http transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("invalid dispatcher url: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

/// The dispatcher's HTTP surface, as a capability set so the controller can
/// be exercised against an in-process fake in tests.
#[async_trait]
pub trait DispatcherClient: Send + Sync {
    async fn heartbeat(&self, report: &HeartbeatReport);
    async fn benchmark_result(&self, engine_id: &str, duration_seconds: f64);
    async fn assign_job(&self, engine_id: &str) -> Option<JobDescriptor>;
    async fn complete_job(&self, job_id: &str, output_url: &str);
    async fn fail_job(&self, job_id: &str, error_message: &str);
}

#[derive(Serialize)]
struct AssignJobRequest<'a> {
    engine_id: &'a str,
}

#[derive(Deserialize, Default)]
struct AssignJobResponse {
    job_id: Option<String>,
    source_url: Option<String>,
    target_codec: Option<String>,
}

#[derive(Serialize)]
struct BenchmarkResultRequest<'a> {
    engine_id: &'a str,
    duration_seconds: f64,
}

#[derive(Serialize)]
struct CompleteJobRequest<'a> {
    output_url: &'a str,
}

#[derive(Serialize)]
struct FailJobRequest<'a> {
    error_message: &'a str,
}

/// `reqwest`-backed [`DispatcherClient`] talking to a real dispatcher over HTTP.
pub struct HttpDispatcherClient {
    http: reqwest::Client,
    base_url: url::Url,
    api_key: Option<String>,
}

impl HttpDispatcherClient {
    pub fn new(
        base_url: url::Url,
        api_key: Option<String>,
        ca_cert_path: Option<&std::path::Path>,
        control_timeout: Duration,
    ) -> Result<Self, DispatcherError> {
        let mut builder = reqwest::Client::builder().timeout(control_timeout);

        builder = match ca_cert_path {
            Some(path) => {
                let pem = std::fs::read(path).unwrap_or_default();
                match reqwest::Certificate::from_pem(&pem) {
                    Ok(cert) => builder.add_root_certificate(cert).tls_built_in_root_certs(true),
                    Err(err) => {
                        warn!(error = %err, path = %path.display(), "failed to load CA bundle; disabling TLS verification");
                        builder.danger_accept_invalid_certs(true)
                    }
                }
            }
            None => builder.danger_accept_invalid_certs(true),
        };

        let http = builder.build()?;
        Ok(Self {
            http,
            base_url,
            api_key,
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let url = self
            .base_url
            .join(path)
            .unwrap_or_else(|_| self.base_url.clone());
        let mut req = self
            .http
            .request(method, url)
            .header("Content-Type", "application/json");
        if let Some(key) = &self.api_key {
            if !key.is_empty() {
                req = req.header("X-API-Key", key);
            }
        }
        req
    }
}

#[async_trait]
impl DispatcherClient for HttpDispatcherClient {
    async fn heartbeat(&self, report: &HeartbeatReport) {
        let res = self
            .request(reqwest::Method::POST, "engines/heartbeat")
            .json(report)
            .send()
            .await;
        if let Err(err) = res {
            warn!(error = %err, "heartbeat request failed");
        }
    }

    async fn benchmark_result(&self, engine_id: &str, duration_seconds: f64) {
        let res = self
            .request(reqwest::Method::POST, "engines/benchmark_result")
            .json(&BenchmarkResultRequest {
                engine_id,
                duration_seconds,
            })
            .send()
            .await;
        if let Err(err) = res {
            warn!(error = %err, "benchmark_result request failed");
        }
    }

    async fn assign_job(&self, engine_id: &str) -> Option<JobDescriptor> {
        let res = self
            .request(reqwest::Method::POST, "assign_job/")
            .json(&AssignJobRequest { engine_id })
            .send()
            .await;

        let res = match res {
            Ok(res) => res,
            Err(err) => {
                warn!(error = %err, "assign_job request failed");
                return None;
            }
        };

        let body = match res.text().await {
            Ok(body) => body,
            Err(err) => {
                warn!(error = %err, "assign_job response read failed");
                return None;
            }
        };

        parse_assign_job_body(&body)
    }

    async fn complete_job(&self, job_id: &str, output_url: &str) {
        let path = format!("jobs/{job_id}/complete");
        let res = self
            .request(reqwest::Method::POST, &path)
            .json(&CompleteJobRequest { output_url })
            .send()
            .await;
        if let Err(err) = res {
            warn!(error = %err, job_id, "complete_job request failed");
        }
    }

    async fn fail_job(&self, job_id: &str, error_message: &str) {
        let path = format!("jobs/{job_id}/fail");
        let res = self
            .request(reqwest::Method::POST, &path)
            .json(&FailJobRequest { error_message })
            .send()
            .await;
        if let Err(err) = res {
            warn!(error = %err, job_id, "fail_job request failed");
        }
    }
}

/// Parses an `assign_job` response body. Any body that is empty, unparseable,
/// or missing a non-null string for any of `job_id`/`source_url`/`target_codec`
/// is treated as "no job available".
fn parse_assign_job_body(body: &str) -> Option<JobDescriptor> {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return None;
    }

    let parsed: AssignJobResponse = match serde_json::from_str(trimmed) {
        Ok(parsed) => parsed,
        Err(err) => {
            let truncated: String = trimmed.chars().take(200).collect();
            warn!(body = %truncated, error = %err, "malformed assign_job response; treating as no job");
            return None;
        }
    };

    let job_id = parsed.job_id?;
    let source_url = parsed.source_url?;
    let target_codec = parsed.target_codec?;
    if job_id.is_empty() || source_url.is_empty() || target_codec.is_empty() {
        return None;
    }

    Some(JobDescriptor {
        job_id,
        source_url,
        target_codec,
    })
}
