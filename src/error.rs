use axum::http::StatusCode;
use axum::response::IntoResponse;

/// Structured details returned alongside a `ReplicationLag` error so a
/// client can decide to retry against the primary.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ReplicationLagDetails {
    pub current: u64,
    pub required: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("database `{0}` not found")]
    NotFound(String),
    #[error("node `{0}` not found")]
    NodeNotFound(String),
    #[error("database `{0}` already exists")]
    AlreadyExists(String),
    #[error("mutating statement sent to a replica")]
    WriteOnReplica,
    #[error("replica has not caught up to the required WAL position")]
    ReplicationLag(ReplicationLagDetails),
    #[error("WAL chain verification failed at position {0}")]
    WALChain(u64),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("operation timed out")]
    Timeout,
    #[error(transparent)]
    Storage(#[from] rusqlite::Error),
    #[error("TEE execution is required for this database")]
    TEERequired,
    #[error("attestation failed: {0}")]
    AttestationFailed(String),
    #[error("rate limited")]
    RateLimited,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    // Catch-all for truly unexpected internal failures, used sparingly.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl Error {
    /// The stable string code surfaced to clients, independent of the
    /// human-readable message (§7: "every error returns a stable string
    /// code plus a human-readable message").
    pub fn code(&self) -> &'static str {
        match self {
            Error::NotFound(_) | Error::NodeNotFound(_) => "NOT_FOUND",
            Error::AlreadyExists(_) => "ALREADY_EXISTS",
            Error::WriteOnReplica => "WRITE_ON_REPLICA",
            Error::ReplicationLag(_) => "REPLICATION_LAG",
            Error::WALChain(_) => "WAL_CHAIN",
            Error::Unauthorized(_) => "UNAUTHORIZED",
            Error::InvalidRequest(_) => "INVALID_REQUEST",
            Error::Timeout => "TIMEOUT",
            Error::Storage(_) => "STORAGE",
            Error::TEERequired => "TEE_REQUIRED",
            Error::AttestationFailed(_) => "ATTESTATION_FAILED",
            Error::RateLimited => "RATE_LIMITED",
            Error::Io(_) | Error::Json(_) | Error::Http(_) | Error::Internal(_) => "INTERNAL",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            Error::NotFound(_) | Error::NodeNotFound(_) => StatusCode::NOT_FOUND,
            Error::AlreadyExists(_) => StatusCode::CONFLICT,
            Error::WriteOnReplica => StatusCode::MISDIRECTED_REQUEST,
            Error::ReplicationLag(_) => StatusCode::CONFLICT,
            Error::WALChain(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Error::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Error::Timeout => StatusCode::GATEWAY_TIMEOUT,
            Error::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::TEERequired | Error::AttestationFailed(_) => StatusCode::FORBIDDEN,
            Error::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Error::Io(_) | Error::Json(_) | Error::Http(_) | Error::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> axum::response::Response {
        (&self).into_response()
    }
}

impl IntoResponse for &Error {
    fn into_response(self) -> axum::response::Response {
        tracing::error!(code = self.code(), "request failed: {self}");
        let mut body = serde_json::json!({
            "code": self.code(),
            "error": self.to_string(),
        });
        if let Error::ReplicationLag(details) = self {
            body["current"] = details.current.into();
            body["required"] = details.required.into();
        }
        (self.status(), axum::Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, Error>;
