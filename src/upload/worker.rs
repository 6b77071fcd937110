//! HTTP upload worker.
//!
//! Sends one job's fields (form body or query string) with connect and
//! request timeouts, and extracts `device_flash_time` from a 2xx reply.
//! Cancellation drops the in-flight request, closing its connection.

use crate::config::{EndpointConfig, FieldEncoding, UploadConfig};
use crate::error::{Result, StatsError};
use crate::payload::{JobKind, KEY_DEVICE_FLASH_TIME, ReportJob};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Longest error body kept for logging.
const MAX_LOGGED_BODY: usize = 512;

/// Successful (2xx) collector reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerReply {
    /// HTTP status code.
    pub status: u16,
    /// Flash time from the body, when present and parsable.
    pub flash_time: Option<i64>,
    /// The body was present but could not be decoded. Still a successful sync.
    pub malformed: bool,
}

/// Why an upload did not produce a [`ServerReply`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UploadError {
    /// Cancellation was requested before the call completed.
    #[error("upload cancelled")]
    Cancelled,

    /// Connection failure, timeout, or broken transfer.
    #[error("network failure: {0}")]
    Network(String),

    /// The collector answered with a non-2xx status.
    #[error("collector returned HTTP {status}")]
    Status {
        /// HTTP status code.
        status: u16,
    },

    /// The job payload failed validation; nothing was sent.
    #[error("invalid job: {0}")]
    InvalidJob(String),
}

impl UploadError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Executes report/update jobs against the configured collector.
#[derive(Debug, Clone)]
pub struct UploadWorker {
    client: reqwest::Client,
    report_url: String,
    update_url: String,
    encoding: FieldEncoding,
}

impl UploadWorker {
    /// Build a worker with its own HTTP client.
    ///
    /// # Errors
    ///
    /// Returns [`StatsError::Http`] if the client cannot be constructed.
    pub fn new(endpoints: &EndpointConfig, upload: &UploadConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(upload.connect_timeout_secs))
            .timeout(Duration::from_secs(upload.request_timeout_secs))
            .user_agent(concat!("device-stats/", env!("CARGO_PKG_VERSION")))
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .map_err(|e| StatsError::Http(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            report_url: endpoints.report_url.clone(),
            update_url: endpoints.update_url.clone(),
            encoding: upload.encoding,
        })
    }

    /// Endpoint a job of `kind` is posted to.
    pub fn endpoint(&self, kind: JobKind) -> &str {
        match kind {
            JobKind::Report => &self.report_url,
            JobKind::Update => &self.update_url,
        }
    }

    /// Run one job. Returns [`UploadError::Cancelled`] as soon as `cancel`
    /// fires, abandoning the request.
    pub async fn run(
        &self,
        job: &ReportJob,
        cancel: &CancellationToken,
    ) -> std::result::Result<ServerReply, UploadError> {
        if cancel.is_cancelled() {
            return Err(UploadError::Cancelled);
        }
        job.validate()
            .map_err(|e| UploadError::InvalidJob(e.to_string()))?;

        let url = self.endpoint(job.kind);
        debug!(
            job_id = job.job_id,
            kind = %job.kind,
            fields = ?job.payload,
            "posting stats job to {url}"
        );

        let request = self
            .client
            .post(url)
            .header(reqwest::header::ACCEPT_CHARSET, "utf-8");
        let request = match self.encoding {
            FieldEncoding::Form => request.form(&job.payload),
            FieldEncoding::Query => request.query(&job.payload),
        };

        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => Err(UploadError::Cancelled),
            result = send_and_read(request) => result,
        };

        match &outcome {
            Ok(reply) => info!(
                job_id = job.job_id,
                kind = %job.kind,
                status = reply.status,
                flash_time = ?reply.flash_time,
                "stats upload succeeded"
            ),
            Err(UploadError::Cancelled) => {
                debug!(job_id = job.job_id, "stats upload cancelled");
            }
            Err(e) => warn!(job_id = job.job_id, kind = %job.kind, "stats upload failed: {e}"),
        }
        outcome
    }
}

async fn send_and_read(
    request: reqwest::RequestBuilder,
) -> std::result::Result<ServerReply, UploadError> {
    let response = request.send().await.map_err(network_error)?;
    let status = response.status();

    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        let body: String = body.chars().take(MAX_LOGGED_BODY).collect();
        warn!("collector rejected upload with {status}: {body}");
        return Err(UploadError::Status {
            status: status.as_u16(),
        });
    }

    let body = response.bytes().await.map_err(network_error)?;
    Ok(parse_reply(status.as_u16(), &body))
}

/// Decode a 2xx body. Never fails: undecodable bodies are flagged instead.
pub fn parse_reply(status: u16, body: &[u8]) -> ServerReply {
    if body.iter().all(u8::is_ascii_whitespace) {
        return ServerReply {
            status,
            flash_time: None,
            malformed: false,
        };
    }

    let value: serde_json::Value = match serde_json::from_slice(body) {
        Ok(value) => value,
        Err(e) => {
            warn!("collector reply is not JSON, keeping previous flash time: {e}");
            return ServerReply {
                status,
                flash_time: None,
                malformed: true,
            };
        }
    };

    match value.get(KEY_DEVICE_FLASH_TIME) {
        None | Some(serde_json::Value::Null) => ServerReply {
            status,
            flash_time: None,
            malformed: false,
        },
        Some(raw) => {
            let flash_time = match raw {
                serde_json::Value::String(s) => s.trim().parse::<i64>().ok(),
                serde_json::Value::Number(n) => n.as_i64(),
                _ => None,
            };
            if flash_time.is_none() {
                warn!("collector sent unparsable {KEY_DEVICE_FLASH_TIME}: {raw}");
            }
            ServerReply {
                status,
                flash_time,
                malformed: flash_time.is_none(),
            }
        }
    }
}

fn network_error(e: reqwest::Error) -> UploadError {
    if e.is_timeout() {
        UploadError::Network(format!("timed out: {e}"))
    } else if e.is_connect() {
        UploadError::Network(format!("connection failed: {e}"))
    } else {
        UploadError::Network(e.to_string())
    }
}
