use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by [`super::CriClient`].
///
/// The client never retries and never maps a runtime error to success; the
/// caller decides what a `NotFound` means in its context.
#[derive(Error, Debug)]
pub enum CriError {
    #[error("invalid CRI endpoint {0:?}")]
    InvalidEndpoint(String),

    #[error("failed to connect to CRI endpoint {endpoint}")]
    Connect {
        endpoint: String,
        #[source]
        source: tonic::transport::Error,
    },

    #[error("{op} failed: {source}")]
    Status {
        op: &'static str,
        #[source]
        source: tonic::Status,
    },

    #[error("{op} timed out after {timeout:?}")]
    Timeout { op: &'static str, timeout: Duration },

    #[error("{op} cancelled")]
    Cancelled { op: &'static str },

    #[error("invalid argument for {op}: {reason}")]
    InvalidArgument { op: &'static str, reason: String },

    #[error("{op}: runtime returned an empty {field}")]
    EmptyResponse {
        op: &'static str,
        field: &'static str,
    },

    #[error("{stage} for container #{index} failed")]
    RunContainers {
        index: usize,
        stage: &'static str,
        #[source]
        source: Box<CriError>,
    },
}

impl CriError {
    /// The runtime reported that the pod, container or image does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, CriError::Status { source, .. } if source.code() == tonic::Code::NotFound)
    }

    /// The gRPC status code, when the runtime answered at all.
    pub fn code(&self) -> Option<tonic::Code> {
        match self {
            CriError::Status { source, .. } => Some(source.code()),
            _ => None,
        }
    }

    pub fn status(op: &'static str, source: tonic::Status) -> Self {
        CriError::Status { op, source }
    }

    pub fn not_found(op: &'static str, message: impl Into<String>) -> Self {
        CriError::Status {
            op,
            source: tonic::Status::not_found(message),
        }
    }
}
