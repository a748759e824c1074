use thiserror::Error;

/// Failure reported by the media engine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("{operation} rejected by engine: {reason}")]
    Rejected {
        operation: &'static str,
        reason: String,
    },

    #[error("Unknown engine handle: {0}")]
    UnknownHandle(String),

    #[error("Engine handle already closed: {0}")]
    Closed(String),

    #[error("Media engine terminated")]
    Fatal,
}

impl EngineError {
    pub fn rejected(operation: &'static str, reason: impl Into<String>) -> Self {
        Self::Rejected {
            operation,
            reason: reason.into(),
        }
    }
}

#[derive(Error, Debug)]
pub enum SfuError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Incompatible capabilities: {0}")]
    IncompatibleCapabilities(String),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Negotiation timed out: {0}")]
    NegotiationTimeout(String),

    #[error("Media engine unavailable")]
    EngineUnavailable,

    #[error("Limit reached: {0}")]
    LimitReached(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl SfuError {
    /// Stable machine-readable code carried in signaling error payloads
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::InvalidState(_) => "invalid_state",
            Self::IncompatibleCapabilities(_) => "incompatible_capabilities",
            Self::Engine(_) => "engine_error",
            Self::NegotiationTimeout(_) => "negotiation_timeout",
            Self::EngineUnavailable => "engine_unavailable",
            Self::LimitReached(_) => "limit_reached",
            Self::InvalidRequest(_) => "invalid_request",
        }
    }
}

impl From<serde_json::Error> for SfuError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidRequest(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SfuError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_error_wraps_with_code() {
        let err: SfuError = EngineError::rejected("connect", "dtls failure").into();
        assert_eq!(err.code(), "engine_error");
        assert_eq!(
            err.to_string(),
            "Engine error: connect rejected by engine: dtls failure"
        );
    }

    #[test]
    fn test_json_errors_are_invalid_requests() {
        let parse = serde_json::from_str::<u32>("nope").unwrap_err();
        assert_eq!(SfuError::from(parse).code(), "invalid_request");
    }
}
