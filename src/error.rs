//! Error taxonomy of the request schedulers.
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Pod directory or request store could not be reached while fanning out
    /// a statistic change. Callers must propagate it.
    #[error("dependency failure: {0:#}")]
    Dependency(anyhow::Error),
    #[error("unknown request type {0:?}")]
    UnknownRequestType(String),
    #[error("request to pod {pod_id} failed: {source}")]
    Transport {
        pod_id: i64,
        #[source]
        source: TransportError,
    },
    /// A cycle was aborted before dispatching anything.
    #[error("scheduling cycle failed: {0:#}")]
    Cycle(anyhow::Error),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("remote pod rejected the request with {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("invalid pod address: {0}")]
    InvalidAddress(String),
    #[error("no answer within {0:?}")]
    Timeout(Duration),
    #[error("payload encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}
