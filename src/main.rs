use anyhow::{Context, Result};
use dialoguer::{Confirm, Input, Password};
use std::sync::Arc;
use tokio::sync::Notify;

use clinic_session_gateway::auth::{
    AuthClient, AuthPaths, CredentialStore, HttpRefreshEndpoint, LoginOutcome, RefreshEndpoint,
    SessionProfile, SqliteCredentialStore,
};
use clinic_session_gateway::config::{Command, Config};
use clinic_session_gateway::http_client::{self, ApiRequest, HttpTransport, Transport};
use clinic_session_gateway::{AuthGateway, SessionMonitor, SessionState, SystemClock};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first (for log level)
    let (config, command) = Config::load()?;
    config.validate()?;

    // Initialize logging with a configured level
    let log_level = config.log_level.to_lowercase();
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .init();

    tracing::debug!("API base URL: {}", config.api_base_url);

    let client = http_client::build_client(config.http_connect_timeout, config.http_request_timeout)?;
    let transport: Arc<dyn Transport> =
        Arc::new(HttpTransport::new(client, config.api_base_url.as_str()));

    let store: Arc<dyn CredentialStore> =
        Arc::new(SqliteCredentialStore::open(&config.credential_db_file)?);
    tracing::debug!(
        "Credential store: {}",
        config.credential_db_file.display()
    );

    let refresher: Arc<dyn RefreshEndpoint> = Arc::new(HttpRefreshEndpoint::new(
        transport.clone(),
        config.refresh_path.as_str(),
    ));

    let auth = AuthClient::new(
        transport.clone(),
        AuthPaths {
            login: config.login_path.clone(),
            two_factor: config.two_factor_path.clone(),
            logout: config.logout_path.clone(),
        },
    );

    match command {
        Command::Login { email } => login(&auth, &store, &email).await,
        Command::Logout => logout(&auth, &store).await,
        Command::Status => status(&store),
        Command::Request { method, path, data } => {
            let gateway = AuthGateway::new(transport, refresher, store.clone())
                .with_exempt_paths(config.auth_exempt_paths());
            request(&gateway, &store, &method, &path, data.as_deref()).await
        }
        Command::Watch => watch(&config, store, refresher).await,
    }
}

async fn login(auth: &AuthClient, store: &Arc<dyn CredentialStore>, email: &str) -> Result<()> {
    let password = tokio::task::spawn_blocking(|| {
        Password::new().with_prompt("Password").interact()
    })
    .await
    .context("Password prompt failed")?
    .context("Failed to read password")?;

    let token = match auth.login(email, &password).await? {
        LoginOutcome::Authenticated(token) => token,
        LoginOutcome::TwoFactorRequired => {
            let code: String = tokio::task::spawn_blocking(|| {
                Input::<String>::new()
                    .with_prompt("Two-factor code")
                    .interact_text()
            })
            .await
            .context("Two-factor prompt failed")?
            .context("Failed to read two-factor code")?;

            auth.verify_two_factor(email, code.trim()).await?
        }
    };

    store.set(&token)?;

    match SessionProfile::from_token(&token) {
        Ok(profile) => println!(
            "Logged in as {} ({}), session valid until {}",
            profile.email.as_deref().unwrap_or(email),
            profile
                .role
                .map(|r| r.to_string())
                .unwrap_or_else(|| "no role".to_string()),
            profile.expires_at.to_rfc3339()
        ),
        Err(_) => println!("Logged in as {}", email),
    }

    Ok(())
}

async fn logout(auth: &AuthClient, store: &Arc<dyn CredentialStore>) -> Result<()> {
    let token = store.get()?;
    if let Err(e) = auth.logout(token.as_deref()).await {
        tracing::warn!("Server logout failed: {}", e);
    }
    force_logout(store.as_ref())?;
    println!("Logged out");
    Ok(())
}

fn status(store: &Arc<dyn CredentialStore>) -> Result<()> {
    let Some(token) = store.get()? else {
        println!("Not logged in");
        return Ok(());
    };

    match SessionProfile::from_token(&token) {
        Ok(profile) => {
            let left = profile.time_left(chrono::Utc::now());
            println!(
                "User:    {}",
                profile
                    .email
                    .or(profile.subject)
                    .unwrap_or_else(|| "unknown".to_string())
            );
            if let Some(role) = profile.role {
                println!("Role:    {}", role);
            }
            println!("Expires: {}", profile.expires_at.to_rfc3339());
            if left.num_seconds() > 0 {
                println!("Left:    {}m {}s", left.num_minutes(), left.num_seconds() % 60);
            } else {
                println!("Left:    expired");
            }
        }
        Err(e) => println!("Logged in (token expiry unreadable: {})", e),
    }

    Ok(())
}

async fn request(
    gateway: &AuthGateway,
    store: &Arc<dyn CredentialStore>,
    method: &str,
    path: &str,
    data: Option<&str>,
) -> Result<()> {
    let method = reqwest::Method::from_bytes(method.to_uppercase().as_bytes())
        .with_context(|| format!("Invalid HTTP method: {}", method))?;

    let mut request = ApiRequest::new(method, path);
    if let Some(data) = data {
        let body: serde_json::Value =
            serde_json::from_str(data).context("--data must be valid JSON")?;
        request = request.json(&body)?;
    }

    match gateway.send(request).await {
        Ok(response) => {
            match response.json::<serde_json::Value>() {
                Ok(value) => println!("{}", serde_json::to_string_pretty(&value)?),
                Err(_) => println!("{}", response.text()),
            }
            Ok(())
        }
        Err(e) if e.is_session_terminated() => {
            force_logout(store.as_ref())?;
            anyhow::bail!("Session ended, please log in again ({})", e)
        }
        Err(e) => Err(e.into()),
    }
}

async fn watch(
    config: &Config,
    store: Arc<dyn CredentialStore>,
    refresher: Arc<dyn RefreshEndpoint>,
) -> Result<()> {
    if store.get()?.is_none() {
        println!("Not logged in");
        return Ok(());
    }

    let expired = Arc::new(Notify::new());
    let on_expired = {
        let expired = expired.clone();
        move || expired.notify_one()
    };

    let monitor = Arc::new(SessionMonitor::new(
        store.clone(),
        refresher,
        Arc::new(SystemClock),
        config.session_warning_threshold,
        on_expired,
    )?);
    let mut states = monitor.subscribe();
    let handle = monitor
        .clone()
        .spawn(std::time::Duration::from_secs(config.session_poll_interval));

    tracing::info!("Watching session (Ctrl+C to stop)");

    loop {
        tokio::select! {
            _ = expired.notified() => {
                force_logout(store.as_ref())?;
                println!("Session expired, please log in again");
                break;
            }
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *states.borrow_and_update();
                if state == SessionState::Warning && confirm_extend().await? {
                    match monitor.refresh_session().await {
                        Ok(()) => println!("Session extended"),
                        Err(e) => println!("Could not extend session: {}", e),
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    handle.stop();
    Ok(())
}

async fn confirm_extend() -> Result<bool> {
    tokio::task::spawn_blocking(|| {
        Confirm::new()
            .with_prompt("Your session expires soon. Extend it?")
            .default(true)
            .interact()
    })
    .await
    .context("Confirmation prompt failed")?
    .context("Failed to read confirmation")
}

/// Drop the credential; identity is derived from it, so nothing else is cached
fn force_logout(store: &dyn CredentialStore) -> Result<()> {
    store.clear()?;
    tracing::info!("Local session cleared");
    Ok(())
}
