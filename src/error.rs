//! Error taxonomy of the gateway.
//!
//! Every failure crossing a transport boundary maps to one [`ErrorCode`].

use serde::Serialize;
use std::fmt;

pub type Result<T, E = GatewayError> = std::result::Result<T, E>;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GatewayError {
    /// Rejected before any backend call
    #[error("malformed request: {0}")]
    MalformedRequest(String),

    /// Neither a surrogate key nor a natural key to target
    #[error("identity error: {0}")]
    Identity(String),

    #[error("no active record for natural key {natural_key}")]
    NotFound { natural_key: String },

    #[error("cannot map field {field} from value {value}: {reason}")]
    Mapping {
        field: String,
        value: String,
        reason: String,
    },

    /// The store rejected, timed out or failed a call
    #[error("backend error: {0}")]
    Backend(String),
}

impl GatewayError {
    pub fn malformed(message: impl Into<String>) -> Self {
        GatewayError::MalformedRequest(message.into())
    }

    pub fn backend(message: impl Into<String>) -> Self {
        GatewayError::Backend(message.into())
    }

    /// Reclassify a failure found in caller-supplied data.
    ///
    /// A mapping failure on an inbound payload is the caller's own bad value, so it becomes a
    /// malformed request that keeps the field and value in its message. Mapping failures on
    /// rows read back from the store stay internal.
    pub fn inbound(self) -> Self {
        match self {
            GatewayError::Mapping { .. } => GatewayError::MalformedRequest(self.to_string()),
            other => other,
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            GatewayError::MalformedRequest(_) => ErrorCode::MalformedRequest,
            GatewayError::Identity(_) => ErrorCode::Identity,
            GatewayError::NotFound { .. } => ErrorCode::NotFound,
            GatewayError::Mapping { .. } => ErrorCode::Mapping,
            GatewayError::Backend(_) => ErrorCode::Backend,
        }
    }

    /// Errors caused by the caller's own input; their text is safe to return verbatim.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            GatewayError::MalformedRequest(_)
                | GatewayError::Identity(_)
                | GatewayError::NotFound { .. }
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    MalformedRequest,
    Identity,
    NotFound,
    Mapping,
    Backend,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::MalformedRequest => "MALFORMED_REQUEST",
            ErrorCode::Identity => "IDENTITY",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::Mapping => "MAPPING",
            ErrorCode::Backend => "BACKEND",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error as exposed to untrusted callers.
///
/// Internal failures are reduced to their code and an incident id; the full text is logged
/// under the same id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublicError {
    pub code: ErrorCode,
    pub message: String,
}

impl PublicError {
    pub fn from_gateway(err: &GatewayError) -> Self {
        if err.is_caller_error() {
            return Self {
                code: err.code(),
                message: err.to_string(),
            };
        }
        let incident = uuid::Uuid::new_v4();
        tracing::error!(%incident, code = %err.code(), error = %err, "internal gateway failure");
        Self {
            code: err.code(),
            message: format!("internal error, incident {incident}"),
        }
    }
}
