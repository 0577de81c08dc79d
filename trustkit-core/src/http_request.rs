use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use reqwest::{Method, RequestBuilder, Response};

use crate::error::TrustError;

/// A thin wrapper on an HTTP client used for backend calls. Applies the
/// configured timeout, a user-agent, and retry middleware for transient
/// failures. 4xx responses are never retried; the reprovisioning guard
/// owns that recovery path.
pub(crate) struct Request {
    client: reqwest::Client,
    timeout: Duration,
    max_retries: u32,
}

impl Request {
    pub(crate) fn new(timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            timeout,
            max_retries: 2,
        }
    }

    pub(crate) fn req(&self, method: Method, url: &str) -> RequestBuilder {
        self.client.request(method, url).timeout(self.timeout).header(
            "User-Agent",
            format!("trustkit-core/{}", env!("CARGO_PKG_VERSION")),
        )
    }

    pub(crate) fn post(&self, url: &str) -> RequestBuilder {
        self.req(Method::POST, url)
    }

    /// Sends a request built by `req`/`post`, retrying transient failures
    /// with exponential backoff.
    pub(crate) async fn handle(
        &self,
        request_builder: RequestBuilder,
    ) -> Result<Response, TrustError> {
        let Some(template) = request_builder.try_clone() else {
            // Streaming bodies cannot be retried; send once.
            return execute(request_builder).await.map_err(Into::into);
        };

        let backoff = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(200))
            .with_max_delay(Duration::from_secs(2))
            .with_max_times(self.max_retries as usize);

        (|| async {
            let request_builder = template.try_clone().ok_or_else(|| {
                SendError::permanent("request template is not cloneable".to_string())
            })?;
            execute(request_builder).await
        })
        .retry(backoff)
        .when(SendError::is_retryable)
        .await
        .map_err(Into::into)
    }
}

#[derive(Debug)]
struct SendError {
    error: String,
    retryable: bool,
}

impl SendError {
    fn retryable(error: String) -> Self {
        Self {
            error,
            retryable: true,
        }
    }

    fn permanent(error: String) -> Self {
        Self {
            error,
            retryable: false,
        }
    }

    fn is_retryable(&self) -> bool {
        self.retryable
    }
}

impl From<SendError> for TrustError {
    fn from(value: SendError) -> Self {
        Self::Network(value.error)
    }
}

async fn execute(request_builder: RequestBuilder) -> Result<Response, SendError> {
    match request_builder.send().await {
        Ok(resp) => {
            let status = resp.status().as_u16();
            if status == 429 || (500..600).contains(&status) {
                return Err(SendError::retryable(format!(
                    "transient status code {status}"
                )));
            }
            Ok(resp)
        }
        Err(err) if err.is_timeout() || err.is_connect() => Err(SendError::retryable(
            format!("request timeout/connect error: {err}"),
        )),
        Err(err) => Err(SendError::permanent(format!("request failed: {err}"))),
    }
}
