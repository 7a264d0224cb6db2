//! Upload of sealed documents to a device
//!
//! The connect request is posted to the pair URL the device announced and
//! the device answers in the response body. The retry budget is always
//! supplied by the caller through [`RetryPolicy`].

use crate::{ProtocolError, Result};
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use std::fmt::Debug;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

/// Default per-request timeout
pub const DEFAULT_UPLOAD_TIMEOUT: Duration = Duration::from_secs(5);

/// Default total number of upload attempts
pub const DEFAULT_UPLOAD_ATTEMPTS: u32 = 3;

/// Default pause between upload attempts
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Network dispatcher posting a document and returning the reply body
#[async_trait]
pub trait Uploader: Send + Sync + Debug {
    /// POST `body` to `url`
    ///
    /// # Errors
    ///
    /// Returns an error on connection failure, timeout or a non-2xx status.
    async fn post(&self, url: &str, body: Vec<u8>) -> Result<Vec<u8>>;
}

/// Bounded retry budget for an upload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub attempts: u32,
    /// Pause between attempts
    pub delay: Duration,
    /// Upper bound on a single attempt
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_UPLOAD_ATTEMPTS,
            delay: DEFAULT_RETRY_DELAY,
            attempt_timeout: DEFAULT_UPLOAD_TIMEOUT,
        }
    }
}

/// [`Uploader`] over HTTP
#[derive(Debug, Clone)]
pub struct HttpUploader {
    client: Client,
}

impl HttpUploader {
    /// Create an uploader with a per-request timeout
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Uploader for HttpUploader {
    async fn post(&self, url: &str, body: Vec<u8>) -> Result<Vec<u8>> {
        debug!("POST {} ({} bytes)", url, body.len());

        let response = self
            .client
            .post(url)
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .map_err(classify)?
            .error_for_status()?;

        let bytes = response.bytes().await.map_err(classify)?;
        Ok(bytes.to_vec())
    }
}

fn classify(error: reqwest::Error) -> ProtocolError {
    if error.is_timeout() {
        ProtocolError::Timeout(error.to_string())
    } else if error.is_connect() {
        ProtocolError::ConnectionRefused(error.to_string())
    } else {
        ProtocolError::Http(error)
    }
}

/// Post with a bounded number of attempts
///
/// Each attempt is cut off after `policy.attempt_timeout` and counts as a
/// timeout. Only recoverable errors are retried. Once the budget is spent,
/// or on a non-recoverable error, the failure is reported as
/// `TransportFailure`.
pub async fn post_with_retries(
    uploader: &dyn Uploader,
    url: &str,
    body: &[u8],
    policy: RetryPolicy,
) -> Result<Vec<u8>> {
    let attempts = policy.attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        let error = match timeout(policy.attempt_timeout, uploader.post(url, body.to_vec())).await {
            Ok(Ok(reply)) => return Ok(reply),
            Ok(Err(e)) => e,
            Err(_) => ProtocolError::Timeout(format!(
                "no reply within {}ms",
                policy.attempt_timeout.as_millis()
            )),
        };

        if attempt >= attempts || !error.is_recoverable() {
            return Err(ProtocolError::TransportFailure(format!(
                "upload to {} failed after {} attempt(s): {}",
                url, attempt, error
            )));
        }

        warn!(
            "Upload to {} failed (attempt {}/{}): {}",
            url, attempt, attempts, error
        );
        sleep(policy.delay).await;
    }
}
