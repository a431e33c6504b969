//! HTTP Storage Client
//!
//! Talks to the index engine through the JSON protocol of [`super::protocol`].
//! Transport failures and 5xx answers are retried with jittered exponential
//! backoff and end up as `Unavailable`; 4xx answers are `Rejected` at once.

use super::client::{StorageError, StorageQueryClient};
use super::protocol::*;
use super::types::{Dataset, DatasetId, ObjectId, StorageQuery};

use async_trait::async_trait;
use std::time::Duration;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_ATTEMPTS: usize = 3;

pub struct HttpStorageClient {
    base_url: String,
    http_client: reqwest::Client,
    timeout: Duration,
    attempts: usize,
}

impl HttpStorageClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http_client: reqwest::Client::new(),
            timeout: DEFAULT_TIMEOUT,
            attempts: DEFAULT_ATTEMPTS,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_attempts(mut self, attempts: usize) -> Self {
        self.attempts = attempts.max(1);
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Sends the request built by `build` until it gets a non-5xx answer.
    async fn send_with_retry<F>(&self, build: F) -> Result<reqwest::Response, StorageError>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let mut delay_ms = 150u64;
        let mut last_error = String::from("no attempt made");

        for attempt in 0..self.attempts {
            match build().timeout(self.timeout).send().await {
                Ok(resp) if !resp.status().is_server_error() => return Ok(resp),
                Ok(resp) => {
                    last_error = format!("engine answered {}", resp.status());
                }
                Err(e) => {
                    last_error = e.to_string();
                }
            }

            if attempt + 1 == self.attempts {
                break;
            }

            tracing::debug!(
                "Storage request failed (attempt {}/{}): {}",
                attempt + 1,
                self.attempts,
                last_error
            );

            // Simple jitter to prevent thundering herd
            let jitter = rand::random::<u64>() % 50;
            tokio::time::sleep(Duration::from_millis(delay_ms + jitter)).await;
            delay_ms = (delay_ms * 2).min(1200);
        }

        Err(StorageError::Unavailable(last_error))
    }

    /// Turns a 4xx into `Rejected`, passes anything else through.
    async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, StorageError> {
        let status = resp.status();
        if !status.is_client_error() {
            return Ok(resp);
        }

        let detail = match resp.json::<ErrorResponse>().await {
            Ok(body) => body.error,
            Err(_) => status.to_string(),
        };
        Err(StorageError::Rejected(detail))
    }
}

#[async_trait]
impl StorageQueryClient for HttpStorageClient {
    async fn topology(&self) -> Result<Vec<Dataset>, StorageError> {
        let url = format!("{}{}", self.base_url, ENDPOINT_TOPOLOGY);

        let resp = self
            .send_with_retry(|| self.http_client.get(url.clone()))
            .await?;
        let resp = Self::check_status(resp).await?;

        let topology: TopologyResponse = resp
            .json()
            .await
            .map_err(|e| StorageError::Unavailable(format!("malformed topology: {}", e)))?;

        Ok(topology
            .datasets
            .into_iter()
            .map(|entry| Dataset {
                id: DatasetId(entry.id),
                taints: entry.taints,
                file_count: entry.file_count,
            })
            .collect())
    }

    async fn query(
        &self,
        query: &StorageQuery,
        dataset: &DatasetId,
    ) -> Result<Vec<ObjectId>, StorageError> {
        let url = format!("{}{}", self.base_url, ENDPOINT_QUERY);
        let payload = QueryRequest {
            query: query.index.to_ursadb(),
            taints: query.taints.clone(),
            dataset: dataset.0.clone(),
        };

        let resp = self
            .send_with_retry(|| self.http_client.post(url.clone()).json(&payload))
            .await?;
        let resp = Self::check_status(resp).await?;

        let body: QueryResponse = resp
            .json()
            .await
            .map_err(|e| StorageError::Unavailable(format!("malformed query answer: {}", e)))?;

        Ok(body.files.into_iter().map(ObjectId).collect())
    }
}
