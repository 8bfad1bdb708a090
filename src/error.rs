use thiserror::Error;

/// Failures raised by a persistence collaborator.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("corrupt row: {0}")]
    CorruptRow(String),
}

/// Typed outcomes of alert operations. All are recoverable.
#[derive(Debug, Error)]
pub enum AlertError {
    #[error("reporter already has an active alert")]
    DuplicateActiveAlert,

    #[error("alert not found")]
    AlertNotFound,

    #[error("alert is no longer open for responses")]
    AlertNotActive,

    #[error("cannot respond to your own alert")]
    SelfResponseNotAllowed,

    #[error("already responded to this alert")]
    DuplicateResponse,

    #[error("alert already resolved")]
    AlreadyResolved,

    #[error("not authorized to resolve this alert")]
    NotAuthorizedToResolve,

    #[error("missing or out-of-range coordinates")]
    InvalidLocation,

    #[error("persistence failure: {0}")]
    Persistence(#[from] StoreError),
}

impl AlertError {
    /// Stable code sent to clients in `server.error` frames.
    pub fn code(&self) -> &'static str {
        match self {
            AlertError::DuplicateActiveAlert => "duplicate_active_alert",
            AlertError::AlertNotFound => "alert_not_found",
            AlertError::AlertNotActive => "alert_not_active",
            AlertError::SelfResponseNotAllowed => "self_response_not_allowed",
            AlertError::DuplicateResponse => "duplicate_response",
            AlertError::AlreadyResolved => "already_resolved",
            AlertError::NotAuthorizedToResolve => "not_authorized_to_resolve",
            AlertError::InvalidLocation => "invalid_location",
            AlertError::Persistence(_) => "internal_error",
        }
    }
}

/// Failures of the external SMS / voice channel. Never surfaced to reporters.
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("gateway rejected request with status {0}")]
    Rejected(u16),

    #[error("gateway timed out after {0}s")]
    Timeout(u64),
}

#[derive(Debug, Error)]
pub enum PresenceError {
    #[error("user id must not be empty")]
    InvalidUserId,
}
