use std::path::PathBuf;
use std::process::Stdio;
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tracing::{info, warn};

use crate::dispatcher::JobDescriptor;

fn codec_whitelist() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_.:-]+$").expect("valid regex"))
}

/// Outcome of executing one job (C4's contract).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Completed { output_url: String },
    Failed { reason: String },
}

/// Result of one transcoder invocation, distinguishing an ordinary non-zero
/// exit from the process being killed for exceeding its wall-clock budget —
/// the executor reports these as different failure reasons.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Success,
    Failed,
    TimedOut,
}

/// Exit status of an invoked transcoder process, abstracted so the executor
/// can be driven by an in-process fake in tests.
#[async_trait]
pub trait Transcoder: Send + Sync {
    /// Runs `argv[0]` with `argv[1..]`, bounded by `timeout`. A process that
    /// is still running when `timeout` elapses is killed and reported as
    /// [`RunOutcome::TimedOut`], distinct from an ordinary non-zero exit.
    async fn run(&self, argv: &[String], timeout: Duration) -> RunOutcome;
}

/// Spawns `ffmpeg` as a real subprocess, argv vector only (never a shell
/// string), killing the process group on timeout.
pub struct ProcessTranscoder;

#[async_trait]
impl Transcoder for ProcessTranscoder {
    async fn run(&self, argv: &[String], timeout: Duration) -> RunOutcome {
        let Some((program, args)) = argv.split_first() else {
            return RunOutcome::Failed;
        };

        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            unsafe {
                cmd.pre_exec(|| {
                    libc::setpgid(0, 0);
                    Ok(())
                });
            }
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(err) => {
                warn!(error = %err, program, "failed to spawn transcoder");
                return RunOutcome::Failed;
            }
        };

        match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) if status.success() => RunOutcome::Success,
            Ok(Ok(status)) => {
                warn!(%status, "transcoder exited non-zero");
                RunOutcome::Failed
            }
            Ok(Err(err)) => {
                warn!(error = %err, "transcoder wait failed");
                RunOutcome::Failed
            }
            Err(_) => {
                warn!(timeout = ?timeout, "transcoder exceeded wall-clock budget; killing process group");
                kill_process_group(&child);
                let _ = child.kill().await;
                RunOutcome::TimedOut
            }
        }
    }
}

#[cfg(unix)]
fn kill_process_group(child: &tokio::process::Child) {
    if let Some(pid) = child.id() {
        unsafe {
            libc::killpg(pid as libc::pid_t, libc::SIGKILL);
        }
    }
}

#[cfg(not(unix))]
fn kill_process_group(_child: &tokio::process::Child) {}

/// Default prefix for the synthesized upload destination (§9 open question:
/// real deployments need the dispatcher to supply this instead).
pub const DEFAULT_UPLOAD_BASE_URL: &str = "http://example.com/transcoded";

/// Downloads the source video, invokes the transcoder, uploads the result,
/// and cleans up local files on every exit path (C4).
pub struct TranscodeExecutor {
    http: reqwest::Client,
    transcoder: Box<dyn Transcoder>,
    work_dir: PathBuf,
    transcode_timeout: Duration,
    upload_base_url: String,
}

impl TranscodeExecutor {
    pub fn new(
        http: reqwest::Client,
        transcoder: Box<dyn Transcoder>,
        work_dir: PathBuf,
        transcode_timeout: Duration,
    ) -> Self {
        Self::with_upload_base_url(
            http,
            transcoder,
            work_dir,
            transcode_timeout,
            DEFAULT_UPLOAD_BASE_URL.to_string(),
        )
    }

    /// Like [`Self::new`], but overriding the upload destination prefix —
    /// used in tests to point uploads at a local mock server.
    pub fn with_upload_base_url(
        http: reqwest::Client,
        transcoder: Box<dyn Transcoder>,
        work_dir: PathBuf,
        transcode_timeout: Duration,
        upload_base_url: String,
    ) -> Self {
        Self {
            http,
            transcoder,
            work_dir,
            transcode_timeout,
            upload_base_url,
        }
    }

    pub async fn execute(&self, job: &JobDescriptor) -> Outcome {
        if !codec_whitelist().is_match(&job.target_codec) {
            warn!(job_id = %job.job_id, codec = %job.target_codec, "rejected target_codec");
            return Outcome::Failed {
                reason: "invalid target_codec".to_string(),
            };
        }

        let input_path = self.work_dir.join(format!("input_{}.mp4", job.job_id));
        let output_path = self.work_dir.join(format!("output_{}.mp4", job.job_id));

        let outcome = self.execute_inner(job, &input_path, &output_path).await;
        self.cleanup(&input_path, &output_path).await;
        outcome
    }

    async fn execute_inner(
        &self,
        job: &JobDescriptor,
        input_path: &PathBuf,
        output_path: &PathBuf,
    ) -> Outcome {
        if let Err(err) = self.download(&job.source_url, input_path).await {
            warn!(job_id = %job.job_id, error = %err, "download failed");
            return Outcome::Failed {
                reason: "Failed to download source video.".to_string(),
            };
        }

        let argv = vec![
            "ffmpeg".to_string(),
            "-i".to_string(),
            input_path.display().to_string(),
            "-c:v".to_string(),
            job.target_codec.clone(),
            output_path.display().to_string(),
        ];

        match self.transcoder.run(&argv, self.transcode_timeout).await {
            RunOutcome::Success => {}
            RunOutcome::Failed => {
                return Outcome::Failed {
                    reason: "FFmpeg transcoding failed.".to_string(),
                };
            }
            RunOutcome::TimedOut => {
                return Outcome::Failed {
                    reason: "transcoder timeout".to_string(),
                };
            }
        }

        match self.upload(output_path, &job.job_id).await {
            Ok(output_url) => {
                info!(job_id = %job.job_id, %output_url, "job completed");
                Outcome::Completed { output_url }
            }
            Err(err) => {
                warn!(job_id = %job.job_id, error = %err, "upload failed");
                Outcome::Failed {
                    reason: "Failed to upload transcoded video.".to_string(),
                }
            }
        }
    }

    async fn download(&self, source_url: &str, dest: &PathBuf) -> anyhow::Result<()> {
        let res = self.http.get(source_url).send().await?.error_for_status()?;
        let bytes = res.bytes().await?;
        tokio::fs::write(dest, &bytes).await?;
        Ok(())
    }

    /// Uploads the transcoded file. The destination URL is synthesized
    /// locally rather than supplied by the dispatcher (flagged as an open
    /// question, not a real upload target, in DESIGN.md).
    async fn upload(&self, output_path: &PathBuf, job_id: &str) -> anyhow::Result<String> {
        let bytes = tokio::fs::read(output_path).await?;
        let output_url = format!("{}/output_{job_id}.mp4", self.upload_base_url);
        self.http
            .post(&output_url)
            .body(bytes)
            .send()
            .await?
            .error_for_status()?;
        Ok(output_url)
    }

    async fn cleanup(&self, input_path: &PathBuf, output_path: &PathBuf) {
        for path in [input_path, output_path] {
            if let Err(err) = tokio::fs::remove_file(path).await {
                if err.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %err, "failed to clean up temp file");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct FakeTranscoder {
        succeed: bool,
        invocations: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Transcoder for FakeTranscoder {
        async fn run(&self, _argv: &[String], _timeout: Duration) -> RunOutcome {
            self.invocations.fetch_add(1, Ordering::SeqCst);
            if self.succeed {
                RunOutcome::Success
            } else {
                RunOutcome::Failed
            }
        }
    }

    fn job(codec: &str) -> JobDescriptor {
        JobDescriptor {
            job_id: "J1".to_string(),
            source_url: "http://example.invalid/a.mp4".to_string(),
            target_codec: codec.to_string(),
        }
    }

    #[tokio::test]
    async fn rejects_shell_metacharacters_without_invoking_transcoder() {
        let invocations = Arc::new(AtomicUsize::new(0));
        let executor = TranscodeExecutor::new(
            reqwest::Client::new(),
            Box::new(FakeTranscoder {
                succeed: true,
                invocations: invocations.clone(),
            }),
            std::env::temp_dir(),
            Duration::from_secs(1),
        );

        let outcome = executor.execute(&job("h264; rm -rf /")).await;
        assert_eq!(
            outcome,
            Outcome::Failed {
                reason: "invalid target_codec".to_string()
            }
        );
        assert_eq!(invocations.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn whitelist_accepts_ordinary_codec_names() {
        assert!(codec_whitelist().is_match("h264"));
        assert!(codec_whitelist().is_match("libx264-10bit"));
        assert!(!codec_whitelist().is_match("h264; rm -rf /"));
        assert!(!codec_whitelist().is_match("h264 && echo hi"));
    }

    fn fake_executor(
        succeed: bool,
        upload_base_url: String,
    ) -> (TranscodeExecutor, Arc<AtomicUsize>) {
        let invocations = Arc::new(AtomicUsize::new(0));
        let executor = TranscodeExecutor::with_upload_base_url(
            reqwest::Client::new(),
            Box::new(FakeTranscoder {
                succeed,
                invocations: invocations.clone(),
            }),
            std::env::temp_dir(),
            Duration::from_secs(5),
            upload_base_url,
        );
        (executor, invocations)
    }

    #[tokio::test]
    async fn happy_path_downloads_transcodes_and_uploads() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/a.mp4"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"source bytes".to_vec()))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/transcoded/output_J1.mp4"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let (executor, invocations) =
            fake_executor(true, format!("{}/transcoded", server.uri()));
        let outcome = executor
            .execute(&JobDescriptor {
                job_id: "J1".to_string(),
                source_url: format!("{}/a.mp4", server.uri()),
                target_codec: "h264".to_string(),
            })
            .await;

        assert_eq!(
            outcome,
            Outcome::Completed {
                output_url: format!("{}/transcoded/output_J1.mp4", server.uri()),
            }
        );
        assert_eq!(invocations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn download_failure_yields_fixed_reason_without_invoking_transcoder() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/a.mp4"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let (executor, invocations) = fake_executor(true, format!("{}/transcoded", server.uri()));
        let outcome = executor
            .execute(&JobDescriptor {
                job_id: "J1".to_string(),
                source_url: format!("{}/a.mp4", server.uri()),
                target_codec: "h264".to_string(),
            })
            .await;

        assert_eq!(
            outcome,
            Outcome::Failed {
                reason: "Failed to download source video.".to_string()
            }
        );
        assert_eq!(invocations.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn transcoder_failure_yields_fixed_reason_and_cleans_up() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/a.mp4"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"source bytes".to_vec()))
            .mount(&server)
            .await;

        let (executor, invocations) = fake_executor(false, format!("{}/transcoded", server.uri()));
        let input_path = std::env::temp_dir().join("input_J1.mp4");
        let output_path = std::env::temp_dir().join("output_J1.mp4");

        let outcome = executor
            .execute(&JobDescriptor {
                job_id: "J1".to_string(),
                source_url: format!("{}/a.mp4", server.uri()),
                target_codec: "h264".to_string(),
            })
            .await;

        assert_eq!(
            outcome,
            Outcome::Failed {
                reason: "FFmpeg transcoding failed.".to_string()
            }
        );
        assert_eq!(invocations.load(Ordering::SeqCst), 1);
        assert!(!input_path.exists());
        assert!(!output_path.exists());
    }
}
