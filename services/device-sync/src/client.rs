//! Ways a device reaches the ingestion gate.

use std::{
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use ingestion::{
    SharedRuntime,
    api::{BatchSubmitRequest, BatchSubmitResponse, ErrorBody},
};
use reqwest::{Client, StatusCode};
use store::EventPage;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("gate unreachable: {0}")]
    Connect(String),
    #[error("device is offline")]
    Offline,
    #[error("gate answered {status}: {message}")]
    Status {
        status: u16,
        message: String,
        retryable: bool,
    },
    #[error("unreadable gate response: {0}")]
    Decode(String),
}

impl TransportError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout | Self::Connect(_) | Self::Offline | Self::Decode(_) => true,
            Self::Status { retryable, .. } => *retryable,
        }
    }

    /// The request never reached a gate that could answer it.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::Timeout | Self::Connect(_) | Self::Offline)
    }
}

#[async_trait]
pub trait GateClient: Send + Sync {
    async fn submit_batch(
        &self,
        batch: &BatchSubmitRequest,
    ) -> Result<BatchSubmitResponse, TransportError>;

    async fn events_after(&self, after_seq: u64, limit: usize)
    -> Result<EventPage, TransportError>;
}

// ---------------------------------------------------------------------------
// HTTP
// ---------------------------------------------------------------------------

pub struct HttpGateClient {
    client: Client,
    base_url: String,
}

impl HttpGateClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, TransportError> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(|err| TransportError::Connect(err.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn decode<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, TransportError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.map_err(map_reqwest_error)?;
            return Err(status_error(status, &body));
        }
        response.json::<T>().await.map_err(map_reqwest_error)
    }
}

#[async_trait]
impl GateClient for HttpGateClient {
    async fn submit_batch(
        &self,
        batch: &BatchSubmitRequest,
    ) -> Result<BatchSubmitResponse, TransportError> {
        let response = self
            .client
            .post(format!("{}/v1/scans/batch", self.base_url))
            .json(batch)
            .send()
            .await
            .map_err(map_reqwest_error)?;
        Self::decode(response).await
    }

    async fn events_after(
        &self,
        after_seq: u64,
        limit: usize,
    ) -> Result<EventPage, TransportError> {
        let response = self
            .client
            .get(format!(
                "{}/v1/events?after_seq={after_seq}&limit={limit}",
                self.base_url
            ))
            .send()
            .await
            .map_err(map_reqwest_error)?;
        Self::decode(response).await
    }
}

fn map_reqwest_error(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else if err.is_decode() {
        TransportError::Decode(err.to_string())
    } else {
        TransportError::Connect(err.to_string())
    }
}

fn status_error(status: StatusCode, body: &str) -> TransportError {
    let parsed = serde_json::from_str::<ErrorBody>(body).ok();
    TransportError::Status {
        status: status.as_u16(),
        message: parsed
            .as_ref()
            .map(|error| error.error.clone())
            .unwrap_or_else(|| body.trim().to_string()),
        retryable: parsed.map_or(status.is_server_error(), |error| error.retryable),
    }
}

// ---------------------------------------------------------------------------
// In-process
// ---------------------------------------------------------------------------

/// Talks to a gate living in the same process; the online flag simulates
/// losing and regaining the network.
pub struct InProcessGateClient {
    runtime: SharedRuntime,
    online: AtomicBool,
}

impl InProcessGateClient {
    pub fn new(runtime: SharedRuntime) -> Self {
        Self {
            runtime,
            online: AtomicBool::new(true),
        }
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    fn ensure_online(&self) -> Result<(), TransportError> {
        if self.is_online() {
            Ok(())
        } else {
            Err(TransportError::Offline)
        }
    }
}

#[async_trait]
impl GateClient for InProcessGateClient {
    async fn submit_batch(
        &self,
        batch: &BatchSubmitRequest,
    ) -> Result<BatchSubmitResponse, TransportError> {
        self.ensure_online()?;
        if batch.events.len() > self.runtime.max_batch_items() {
            return Err(TransportError::Status {
                status: 413,
                message: "batch too large".to_string(),
                retryable: false,
            });
        }
        Ok(self.runtime.submit_batch(batch))
    }

    async fn events_after(
        &self,
        after_seq: u64,
        limit: usize,
    ) -> Result<EventPage, TransportError> {
        self.ensure_online()?;
        self.runtime
            .events_after(after_seq, limit)
            .map_err(|err| TransportError::Status {
                status: 503,
                message: err.to_string(),
                retryable: err.is_retryable(),
            })
    }
}
