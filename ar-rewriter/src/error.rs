//! Error types shared across the service layer.

use thiserror::Error;

/// Error codes the retry wrapper treats as transient.
const TRANSIENT_ERROR_CODES: &[&str] = &[
    "ThrottlingException",
    "ServiceUnavailableException",
    "InternalServerException",
    "RequestTimeout",
    "TooManyRequestsException",
];

#[derive(Debug, Error)]
pub enum ServiceError {
    /// A backend API call failed with a coded error.
    #[error("{code}: {message}")]
    Api { code: String, message: String },

    /// A named operation failed for a non-API reason.
    #[error("{operation} failed: {source}")]
    Operation {
        operation: String,
        #[source]
        source: anyhow::Error,
    },

    /// The model or policy backend returned output we could not interpret.
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    /// The caller asked for something the current thread state does not allow.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Bad or missing configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Lookup by ID found nothing.
    #[error("thread not found: {0}")]
    ThreadNotFound(String),
}

impl ServiceError {
    pub fn api(code: impl Into<String>, message: impl Into<String>) -> Self {
        ServiceError::Api {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn operation(operation: impl Into<String>, source: anyhow::Error) -> Self {
        ServiceError::Operation {
            operation: operation.into(),
            source,
        }
    }

    /// Failure category safe to show to end users. Collaborator error codes
    /// and internal messages stay in the logs.
    pub fn category(&self) -> &'static str {
        match self {
            ServiceError::Api { .. } | ServiceError::Operation { .. } => {
                "a backend service call failed"
            }
            ServiceError::MalformedResponse(_) => "a backend returned an unreadable response",
            ServiceError::InvalidRequest(_) => "the request was invalid",
            ServiceError::Config(_) => "the service is misconfigured",
            ServiceError::ThreadNotFound(_) => "the thread could not be found",
        }
    }

    /// Whether a retry has a realistic chance of succeeding.
    ///
    /// Only coded API errors are ever retried; everything else is a
    /// programming or input problem that retrying cannot fix.
    pub fn is_transient(&self) -> bool {
        match self {
            ServiceError::Api { code, .. } => {
                TRANSIENT_ERROR_CODES.iter().any(|c| code == c)
            }
            _ => false,
        }
    }
}

pub type ServiceResult<T> = Result<T, ServiceError>;
