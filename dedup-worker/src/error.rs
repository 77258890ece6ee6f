use dedup_common::broker::ConnectionError;
use dedup_common::suspicion::PersistenceError;
use thiserror::Error;

/// Errors raised while asking the search backend for candidates.
#[derive(Error, Debug)]
pub enum RetrievalError {
    #[error("search request failed: {0}")]
    RequestError(#[from] reqwest::Error),
    #[error("search backend answered {status}: {body}")]
    UnsuccessfulResponse {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("search response could not be parsed: {0}")]
    InvalidResponse(String),
}

/// Some duplicate events could not be delivered to the outbound queue.
#[derive(Error, Debug)]
pub enum PublishError {
    #[error("duplicate event could not be serialized: {0}")]
    SerializeError(#[from] serde_json::Error),
    #[error("duplicate event could not be published: {0}")]
    BrokerError(#[from] ConnectionError),
    #[error("{failed} of {attempted} duplicate events were not published")]
    Incomplete { failed: usize, attempted: usize },
}

impl PublishError {
    pub fn is_fatal(&self) -> bool {
        match self {
            PublishError::BrokerError(e) => e.is_fatal(),
            PublishError::SerializeError(_) | PublishError::Incomplete { .. } => false,
        }
    }
}

/// Reasons processing one customer event failed. Any of these leaves the message unacknowledged.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Retrieval(#[from] RetrievalError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error(transparent)]
    Publish(#[from] PublishError),
}

impl PipelineError {
    /// Metric label for the failure.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Retrieval(_) => "retrieval_error",
            PipelineError::Persistence(_) => "persistence_error",
            PipelineError::Publish(_) => "publish_error",
        }
    }

    /// The broker is gone for good, so no later event can be announced either.
    pub fn is_fatal(&self) -> bool {
        match self {
            PipelineError::Publish(e) => e.is_fatal(),
            PipelineError::Retrieval(_) | PipelineError::Persistence(_) => false,
        }
    }
}

/// Errors that stop the consumer loop.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("broker connection failed: {0}")]
    Connection(#[from] ConnectionError),
    #[error("broker channel operation failed: {0}")]
    Broker(#[from] lapin::Error),
    #[error("event processing hit an unrecoverable error: {0}")]
    Handler(#[from] PipelineError),
}

impl WorkerError {
    /// Only an exhausted connection budget ends the process. Anything else is retried by
    /// deriving a fresh channel.
    pub fn is_fatal(&self) -> bool {
        match self {
            WorkerError::Connection(e) => e.is_fatal(),
            WorkerError::Broker(_) => false,
            WorkerError::Handler(e) => e.is_fatal(),
        }
    }
}
