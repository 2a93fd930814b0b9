// Authentication types

use serde::{Deserialize, Serialize};

/// Refresh endpoint response
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshResponse {
    #[serde(alias = "access_token", alias = "token")]
    pub access_token: String,
}

/// Email/password login request
#[derive(Serialize)]
pub struct LoginRequest<'a> {
    pub email: &'a str,
    pub password: &'a str,
}

/// Login response
///
/// Either carries a token or asks for a second factor.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    #[serde(default, alias = "access_token", alias = "token")]
    pub access_token: Option<String>,
    #[serde(default, alias = "two_factor_required")]
    pub two_factor_required: bool,
}

/// Second-factor verification request
#[derive(Serialize)]
pub struct TwoFactorRequest<'a> {
    pub email: &'a str,
    pub code: &'a str,
}

/// Result of the first login step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginOutcome {
    /// Credential issued
    Authenticated(String),

    /// Server expects a one-time code before issuing a credential
    TwoFactorRequired,
}

/// Dashboard role carried in the token
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    Admin,
    Dietician,
    Client,
    Other(String),
}

impl Role {
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "admin" => Role::Admin,
            "dietician" | "dietitian" => Role::Dietician,
            "client" => Role::Client,
            _ => Role::Other(s.to_string()),
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Admin => write!(f, "admin"),
            Role::Dietician => write!(f, "dietician"),
            Role::Client => write!(f, "client"),
            Role::Other(s) => write!(f, "{}", s),
        }
    }
}
