// Login, two-factor verification and logout against the clinic API

use std::sync::Arc;

use super::types::{LoginOutcome, LoginRequest, LoginResponse, TwoFactorRequest};
use crate::error::{GatewayError, Result};
use crate::http_client::{ApiRequest, Transport};

/// Auth routes of the backend
#[derive(Debug, Clone)]
pub struct AuthPaths {
    pub login: String,
    pub two_factor: String,
    pub logout: String,
}

impl Default for AuthPaths {
    fn default() -> Self {
        Self {
            login: "/auth/login".to_string(),
            two_factor: "/auth/2fa".to_string(),
            logout: "/auth/logout".to_string(),
        }
    }
}

/// Issues credentials; talks to the unauthenticated transport directly
pub struct AuthClient {
    transport: Arc<dyn Transport>,
    paths: AuthPaths,
}

impl AuthClient {
    pub fn new(transport: Arc<dyn Transport>, paths: AuthPaths) -> Self {
        Self { transport, paths }
    }

    /// First login step
    ///
    /// A 401 here means bad credentials and is returned as is.
    pub async fn login(&self, email: &str, password: &str) -> Result<LoginOutcome> {
        tracing::info!(email = %email, "Logging in...");

        let request = ApiRequest::post(self.paths.login.as_str())
            .json(&LoginRequest { email, password })?;
        let response = self.transport.dispatch(request).await?;
        let data: LoginResponse = response.json()?;

        if let Some(token) = data.access_token.filter(|t| !t.is_empty()) {
            tracing::info!(email = %email, "Login successful");
            return Ok(LoginOutcome::Authenticated(token));
        }

        if data.two_factor_required {
            tracing::info!(email = %email, "Second factor required");
            return Ok(LoginOutcome::TwoFactorRequired);
        }

        Err(GatewayError::Internal(anyhow::anyhow!(
            "Login response contains neither a token nor a two-factor request"
        )))
    }

    /// Second login step
    pub async fn verify_two_factor(&self, email: &str, code: &str) -> Result<String> {
        let request = ApiRequest::post(self.paths.two_factor.as_str())
            .json(&TwoFactorRequest { email, code })?;
        let response = self.transport.dispatch(request).await?;
        let data: LoginResponse = response.json()?;

        let token = data.access_token.filter(|t| !t.is_empty()).ok_or_else(|| {
            GatewayError::Internal(anyhow::anyhow!(
                "Two-factor response does not contain accessToken"
            ))
        })?;

        tracing::info!(email = %email, "Two-factor verification successful");
        Ok(token)
    }

    /// Tell the server to drop the session cookie
    pub async fn logout(&self, token: Option<&str>) -> Result<()> {
        let mut request = ApiRequest::post(self.paths.logout.as_str());
        if let Some(token) = token {
            request = request.with_bearer(token)?;
        }
        self.transport.dispatch(request).await?;
        Ok(())
    }

    pub fn paths(&self) -> &AuthPaths {
        &self.paths
    }
}
