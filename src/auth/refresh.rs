// Token refresh logic

use async_trait::async_trait;
use std::sync::Arc;

use super::claims;
use super::types::RefreshResponse;
use crate::error::{GatewayError, RefreshError};
use crate::http_client::{ApiRequest, Transport};

/// Exchanges the long-lived session (cookie) for a new access token
#[async_trait]
pub trait RefreshEndpoint: Send + Sync {
    async fn refresh(&self) -> Result<String, RefreshError>;
}

/// Refresh over HTTP
///
/// No bearer token is sent; the server authenticates the refresh through the
/// session cookie held in the transport's cookie store.
pub struct HttpRefreshEndpoint {
    transport: Arc<dyn Transport>,
    path: String,
}

impl HttpRefreshEndpoint {
    pub fn new(transport: Arc<dyn Transport>, path: impl Into<String>) -> Self {
        Self {
            transport,
            path: path.into(),
        }
    }
}

#[async_trait]
impl RefreshEndpoint for HttpRefreshEndpoint {
    async fn refresh(&self) -> Result<String, RefreshError> {
        tracing::debug!(path = %self.path, "Refreshing access token...");

        let response = self
            .transport
            .dispatch(ApiRequest::post(self.path.as_str()))
            .await
            .map_err(|e| match e {
                GatewayError::Api { status, message } => RefreshError::Rejected { status, message },
                GatewayError::Transport(msg) => RefreshError::Transport(msg),
                other => RefreshError::Transport(other.to_string()),
            })?;

        let data: RefreshResponse = serde_json::from_slice(&response.body)
            .map_err(|e| RefreshError::InvalidResponse(e.to_string()))?;

        if data.access_token.is_empty() {
            return Err(RefreshError::InvalidResponse(
                "response does not contain accessToken".to_string(),
            ));
        }

        match claims::expires_at(&data.access_token) {
            Ok(expires_at) => tracing::info!(
                "Access token refreshed, expires: {}",
                expires_at.to_rfc3339()
            ),
            Err(e) => tracing::warn!("Access token refreshed but expiry is unreadable: {}", e),
        }

        Ok(data.access_token)
    }
}
