//! Remote endpoint backend: the entry is POSTed as JSON.

use async_trait::async_trait;
use moood_shared::{Entry, MooodError, Result, WorkerDescriptor};
use reqwest::Client;
use serde_json::Value;
use tracing::debug;
use url::Url;

use super::WorkerBackend;

/// User-Agent sent with every worker request.
const USER_AGENT: &str = concat!("moood/", env!("CARGO_PKG_VERSION"));

/// Header naming the worker, the HTTP analogue of [`super::WORKER_NAME_ENV`].
const WORKER_NAME_HEADER: &str = "x-moood-worker";

/// Calls a worker that is exposed as an HTTP endpoint.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: Client,
    url: Url,
}

impl HttpBackend {
    pub fn new(url: Url) -> Result<Self> {
        // No client-level timeout; the invocation adapter owns the deadline
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| MooodError::config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, url })
    }
}

#[async_trait]
impl WorkerBackend for HttpBackend {
    async fn call(&self, descriptor: &WorkerDescriptor, input: &Entry) -> Result<Value> {
        let worker = descriptor.name.as_str();
        debug!(worker, url = %self.url, "posting to worker endpoint");

        let response = self
            .client
            .post(self.url.clone())
            .header(WORKER_NAME_HEADER, worker)
            .json(input)
            .send()
            .await
            .map_err(|e| MooodError::invocation(worker, format!("{}: {e}", self.url)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(MooodError::invocation(
                worker,
                format!("{}: HTTP {status} {}", self.url, body.trim()),
            ));
        }

        response.json::<Value>().await.map_err(|e| {
            MooodError::invocation(worker, format!("response is not a JSON value: {e}"))
        })
    }

    fn kind(&self) -> &str {
        "http"
    }
}
