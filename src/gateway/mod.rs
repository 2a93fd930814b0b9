// Authenticated request gateway
// Attaches the bearer credential and recovers from expiry with a single-flight refresh

mod state;

use anyhow::anyhow;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;

use crate::auth::{token_preview, CredentialStore, RefreshEndpoint};
use crate::error::{GatewayError, RefreshError, Result};
use crate::http_client::{ApiRequest, ApiResponse, Transport};

pub use state::RefreshOutcome;
use state::{RefreshGuard, RefreshState};

/// How a request that hit a 401 gets its replay token
enum Recovery {
    /// A refresh is in flight; wait for it
    Wait(oneshot::Receiver<RefreshOutcome>),

    /// This request starts the refresh
    Lead,

    /// A refresh already finished after this request went out
    Replay(String),
}

/// Wraps the unauthenticated transport with bearer attachment and refresh-and-replay
///
/// Any number of callers may `send` concurrently. At most one refresh is in
/// flight per gateway; every 401 seen meanwhile waits for that refresh. Each
/// original request is replayed at most once.
pub struct AuthGateway {
    transport: Arc<dyn Transport>,
    refresher: Arc<dyn RefreshEndpoint>,
    store: Arc<dyn CredentialStore>,

    /// Refresh flag and waiter queue
    state: Arc<Mutex<RefreshState>>,

    /// Paths whose 401 means bad credentials rather than an expired token
    exempt_paths: Vec<String>,
}

impl AuthGateway {
    pub fn new(
        transport: Arc<dyn Transport>,
        refresher: Arc<dyn RefreshEndpoint>,
        store: Arc<dyn CredentialStore>,
    ) -> Self {
        Self {
            transport,
            refresher,
            store,
            state: Arc::new(Mutex::new(RefreshState::default())),
            exempt_paths: Vec::new(),
        }
    }

    /// Paths whose 401 is returned to the caller without a refresh (login, 2FA, refresh)
    pub fn with_exempt_paths<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exempt_paths = paths.into_iter().map(Into::into).collect();
        self
    }

    pub fn store(&self) -> &Arc<dyn CredentialStore> {
        &self.store
    }

    pub fn is_refreshing(&self) -> bool {
        state::lock(&self.state).is_refreshing()
    }

    /// Number of requests waiting on the in-flight refresh
    pub fn pending_requests(&self) -> usize {
        state::lock(&self.state).queued()
    }

    /// Send a request with the current credential attached
    pub async fn send(&self, request: ApiRequest) -> Result<ApiResponse> {
        let request_id = uuid::Uuid::new_v4().to_string()[..8].to_string();
        let attached = self.current_token()?;

        match self.dispatch_with(request.clone(), attached.as_deref()).await {
            Err(err)
                if err.is_unauthorized()
                    && !request.is_retry()
                    && !self.is_exempt(&request.path) =>
            {
                tracing::warn!(
                    request_id = %request_id,
                    method = %request.method,
                    path = %request.path,
                    "Received 401, recovering credential"
                );
                self.recover(request, attached, &request_id).await
            }
            other => other,
        }
    }

    async fn recover(
        &self,
        mut request: ApiRequest,
        attached: Option<String>,
        request_id: &str,
    ) -> Result<ApiResponse> {
        // Only drop the token this request was rejected with; a newer one stays
        if let Some(token) = attached.as_deref() {
            if self.store.clear_if(token).map_err(credential_error)? {
                tracing::debug!(
                    request_id = %request_id,
                    token = %token_preview(token),
                    "Cleared rejected credential"
                );
            }
        }

        request.mark_retry();

        let recovery = {
            let mut state = state::lock(&self.state);
            if state.is_refreshing() {
                Recovery::Wait(state.enqueue(request_id, &request.path))
            } else {
                match self.current_token()? {
                    Some(current) if attached.as_deref() != Some(current.as_str()) => {
                        Recovery::Replay(current)
                    }
                    _ => {
                        state.begin();
                        Recovery::Lead
                    }
                }
            }
        };

        let token = match recovery {
            Recovery::Replay(token) => {
                tracing::debug!(
                    request_id = %request_id,
                    "Credential already refreshed, replaying"
                );
                token
            }
            Recovery::Wait(rx) => {
                tracing::debug!(request_id = %request_id, "Refresh in flight, request queued");
                rx.await.map_err(|_| {
                    GatewayError::Internal(anyhow!("Refresh ended without settling queued request"))
                })??
            }
            Recovery::Lead => {
                tracing::debug!(request_id = %request_id, "Starting credential refresh");
                self.run_refresh().await?
            }
        };

        self.dispatch_with(request, Some(&token)).await
    }

    /// Run the refresh on its own task so it completes even if the leader is dropped
    async fn run_refresh(&self) -> Result<String> {
        let refresher = self.refresher.clone();
        let store = self.store.clone();
        let guard = RefreshGuard::new(self.state.clone());

        let task = tokio::spawn(async move {
            let outcome = match refresher.refresh().await {
                Ok(token) => match store.set(&token) {
                    Ok(()) => {
                        tracing::info!(token = %token_preview(&token), "Credential refreshed");
                        Ok(token)
                    }
                    Err(e) => Err(RefreshError::Store(e.to_string())),
                },
                Err(e) => {
                    tracing::warn!(error = %e, "Credential refresh failed");
                    if let Err(clear_err) = store.clear() {
                        tracing::warn!("Failed to clear credential: {}", clear_err);
                    }
                    Err(e)
                }
            };

            guard.settle(&outcome);
            outcome
        });

        match task.await {
            Ok(outcome) => Ok(outcome?),
            Err(e) => Err(GatewayError::Internal(anyhow!("Refresh task failed: {}", e))),
        }
    }

    async fn dispatch_with(&self, request: ApiRequest, token: Option<&str>) -> Result<ApiResponse> {
        let request = match token {
            Some(token) => request.with_bearer(token)?,
            None => request,
        };
        self.transport.dispatch(request).await
    }

    fn current_token(&self) -> Result<Option<String>> {
        self.store.get().map_err(credential_error)
    }

    fn is_exempt(&self, path: &str) -> bool {
        let route = route_of(path);
        self.exempt_paths.iter().any(|p| route_of(p) == route)
    }
}

/// Path component of a request target: no scheme/host, query or fragment
fn route_of(target: &str) -> &str {
    let target = match target.find(['?', '#']) {
        Some(end) => &target[..end],
        None => target,
    };
    let path = match target.split_once("://") {
        Some((_, rest)) => rest.find('/').map_or("/", |start| &rest[start..]),
        None => target,
    };
    match path.trim_end_matches('/') {
        "" => "/",
        trimmed => trimmed,
    }
}

fn credential_error(e: anyhow::Error) -> GatewayError {
    GatewayError::Credential(e.to_string())
}
