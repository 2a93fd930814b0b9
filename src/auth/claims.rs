// Token claim decoding
// Only reads the payload; signature verification belongs to the server

use anyhow::{Context, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;

use super::types::Role;

/// Claims the client cares about
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Claims {
    /// Expiry as epoch seconds
    pub exp: i64,
    #[serde(default)]
    pub sub: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
}

impl Claims {
    pub fn expires_at(&self) -> Result<DateTime<Utc>> {
        DateTime::from_timestamp(self.exp, 0)
            .with_context(|| format!("Expiry claim out of range: {}", self.exp))
    }
}

/// Decode the payload segment of a JWT
pub fn decode_claims(token: &str) -> Result<Claims> {
    let payload = token
        .split('.')
        .nth(1)
        .filter(|s| !s.is_empty())
        .context("Token is not a JWT (missing payload segment)")?;

    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .context("Token payload is not valid base64url")?;

    serde_json::from_slice(&bytes).context("Token payload is not valid claims JSON")
}

/// Expiry embedded in a token
pub fn expires_at(token: &str) -> Result<DateTime<Utc>> {
    decode_claims(token)?.expires_at()
}

/// Identity of the logged-in user as read from the token
#[derive(Debug, Clone, PartialEq)]
pub struct SessionProfile {
    pub subject: Option<String>,
    pub email: Option<String>,
    pub role: Option<Role>,
    pub expires_at: DateTime<Utc>,
}

impl SessionProfile {
    pub fn from_token(token: &str) -> Result<Self> {
        let claims = decode_claims(token)?;
        let expires_at = claims.expires_at()?;
        Ok(Self {
            subject: claims.sub,
            email: claims.email,
            role: claims.role.as_deref().map(Role::parse),
            expires_at,
        })
    }

    /// Time until expiry; negative once expired
    pub fn time_left(&self, now: DateTime<Utc>) -> Duration {
        self.expires_at - now
    }
}

/// Shorten a token for log output
pub fn token_preview(token: &str) -> &str {
    let end = token
        .char_indices()
        .nth(12)
        .map(|(i, _)| i)
        .unwrap_or(token.len());
    &token[..end]
}
