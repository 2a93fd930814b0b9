// Error handling module
// Defines the gateway and refresh error types

use thiserror::Error;

/// Errors surfaced to callers of the gateway and the transport
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Non-success response from the clinic API
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    /// Request never produced a response (connect, timeout, body)
    #[error("HTTP transport error: {0}")]
    Transport(String),

    /// Credential refresh failed; the session is over
    #[error("Session refresh failed: {0}")]
    RefreshFailed(#[from] RefreshError),

    /// Credential store could not be read or written
    #[error("Credential store error: {0}")]
    Credential(String),

    /// Request could not be built
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl GatewayError {
    /// HTTP status carried by the error, if any
    pub fn status(&self) -> Option<u16> {
        match self {
            GatewayError::Api { status, .. } => Some(*status),
            GatewayError::RefreshFailed(RefreshError::Rejected { status, .. }) => Some(*status),
            _ => None,
        }
    }

    /// True for a 401 from the API
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, GatewayError::Api { status: 401, .. })
    }

    /// True when the caller is expected to force a logout
    pub fn is_session_terminated(&self) -> bool {
        matches!(self, GatewayError::RefreshFailed(_))
    }
}

/// Refresh failures
///
/// Cloneable so the same error can be delivered to every queued request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RefreshError {
    /// Refresh endpoint answered with a non-success status
    #[error("refresh rejected: {status} - {message}")]
    Rejected { status: u16, message: String },

    /// Refresh request never produced a response
    #[error("refresh request failed: {0}")]
    Transport(String),

    /// Refresh response could not be used
    #[error("invalid refresh response: {0}")]
    InvalidResponse(String),

    /// Refreshed credential could not be stored
    #[error("failed to store refreshed credential: {0}")]
    Store(String),
}

/// Result type alias for gateway operations
pub type Result<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = GatewayError::Api {
            status: 403,
            message: "Forbidden".to_string(),
        };
        assert_eq!(err.to_string(), "API error: 403 - Forbidden");

        let err = GatewayError::Transport("connection refused".to_string());
        assert_eq!(err.to_string(), "HTTP transport error: connection refused");

        let err = GatewayError::Credential("locked".to_string());
        assert_eq!(err.to_string(), "Credential store error: locked");
    }

    #[test]
    fn test_refresh_error_messages() {
        let err = RefreshError::Rejected {
            status: 401,
            message: "session cookie expired".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "refresh rejected: 401 - session cookie expired"
        );

        let err = GatewayError::from(RefreshError::InvalidResponse("empty token".to_string()));
        assert_eq!(
            err.to_string(),
            "Session refresh failed: invalid refresh response: empty token"
        );
    }

    #[test]
    fn test_internal_error_message() {
        let err = GatewayError::Internal(anyhow::anyhow!("Something went wrong"));
        assert_eq!(err.to_string(), "Internal error: Something went wrong");
    }

    #[test]
    fn test_status_helpers() {
        let unauthorized = GatewayError::Api {
            status: 401,
            message: String::new(),
        };
        assert!(unauthorized.is_unauthorized());
        assert_eq!(unauthorized.status(), Some(401));
        assert!(!unauthorized.is_session_terminated());

        let server = GatewayError::Api {
            status: 500,
            message: String::new(),
        };
        assert!(!server.is_unauthorized());
        assert_eq!(server.status(), Some(500));

        let refresh = GatewayError::RefreshFailed(RefreshError::Rejected {
            status: 403,
            message: String::new(),
        });
        assert!(refresh.is_session_terminated());
        assert!(!refresh.is_unauthorized());
        assert_eq!(refresh.status(), Some(403));

        let transport = GatewayError::Transport("timeout".to_string());
        assert_eq!(transport.status(), None);
    }
}
