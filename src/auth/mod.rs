// Authentication module
// Credential storage, token claims, refresh and login

mod claims;
mod login;
mod refresh;
mod store;
mod types;

pub use claims::{decode_claims, expires_at, token_preview, Claims, SessionProfile};
pub use login::{AuthClient, AuthPaths};
pub use refresh::{HttpRefreshEndpoint, RefreshEndpoint};
pub use store::{CredentialStore, MemoryCredentialStore, SqliteCredentialStore};
pub use types::{LoginOutcome, Role};
