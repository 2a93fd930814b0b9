use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dialoguer::{Confirm, Input};
use std::io::Write;
use std::path::PathBuf;

/// Largest accepted SESSION_WARNING_THRESHOLD (one week)
const MAX_WARNING_THRESHOLD_SECS: u64 = 7 * 24 * 60 * 60;

/// Clinic session client - authenticated access to the clinic platform API
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Base URL of the clinic REST API
    #[arg(short = 'u', long, env = "API_BASE_URL")]
    pub api_url: Option<String>,

    /// Path to the SQLite credential database
    #[arg(short = 'd', long, env = "CREDENTIAL_DB_FILE")]
    pub db_file: Option<String>,

    /// Warn this many seconds before the session expires
    #[arg(long, env = "SESSION_WARNING_THRESHOLD", default_value = "300")]
    pub warning_threshold: u64,

    /// Seconds between session expiry checks
    #[arg(long, env = "SESSION_POLL_INTERVAL", default_value = "5")]
    pub poll_interval: u64,

    /// HTTP request timeout in seconds
    #[arg(long, env = "HTTP_REQUEST_TIMEOUT", default_value = "60")]
    pub http_timeout: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Log in with email and password (prompts for the password and 2FA code)
    Login {
        #[arg(short, long)]
        email: String,
    },

    /// End the session and forget the stored credential
    Logout,

    /// Show who is logged in and how long the session has left
    Status,

    /// Send an authenticated request and print the response body
    Request {
        /// HTTP method (GET, POST, PUT, PATCH, DELETE)
        method: String,

        /// Path relative to the API base URL
        path: String,

        /// JSON request body
        #[arg(long)]
        data: Option<String>,
    },

    /// Watch the session, offer to extend it before expiry, log out when it expires
    Watch,
}

#[derive(Clone, Debug)]
pub struct Config {
    // API
    pub api_base_url: String,
    pub login_path: String,
    pub two_factor_path: String,
    pub refresh_path: String,
    pub logout_path: String,

    // Credential storage
    pub credential_db_file: PathBuf,

    // Session monitor
    pub session_warning_threshold: u64,
    pub session_poll_interval: u64,

    // HTTP client
    pub http_connect_timeout: u64,
    pub http_request_timeout: u64,

    // Logging
    pub log_level: String,
}

impl Config {
    /// Load configuration from all sources with priority: CLI > ENV > defaults
    pub fn load() -> Result<(Self, Command)> {
        // Load .env file if it exists
        dotenvy::dotenv().ok();

        let mut args = CliArgs::parse();

        if needs_interactive_setup(&args) {
            let interactive = run_interactive_setup()?;
            args.api_url = Some(interactive.api_base_url);
            args.db_file = Some(interactive.credential_db_file);
        }

        let command = args.command.clone();
        Ok((Self::from_args(args)?, command))
    }

    /// Build config from parsed arguments plus ENV-only settings
    pub fn from_args(args: CliArgs) -> Result<Self> {
        let config = Config {
            api_base_url: args
                .api_url
                .context("API_BASE_URL is required (use -u or set API_BASE_URL env var)")?
                .trim_end_matches('/')
                .to_string(),

            login_path: env_or("LOGIN_PATH", "/auth/login"),
            two_factor_path: env_or("TWO_FACTOR_PATH", "/auth/2fa"),
            refresh_path: env_or("REFRESH_PATH", "/auth/refresh"),
            logout_path: env_or("LOGOUT_PATH", "/auth/logout"),

            credential_db_file: args
                .db_file
                .map(|s| expand_tilde(&s))
                .unwrap_or_else(default_credential_db_file),

            session_warning_threshold: args.warning_threshold,
            session_poll_interval: args.poll_interval,

            http_connect_timeout: std::env::var("HTTP_CONNECT_TIMEOUT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(30),

            http_request_timeout: args.http_timeout,

            log_level: args.log_level,
        };

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if !self.api_base_url.starts_with("http://") && !self.api_base_url.starts_with("https://")
        {
            anyhow::bail!(
                "API_BASE_URL must start with http:// or https://: {}",
                self.api_base_url
            );
        }

        if self.session_warning_threshold > MAX_WARNING_THRESHOLD_SECS {
            anyhow::bail!(
                "SESSION_WARNING_THRESHOLD must be at most {} seconds: {}",
                MAX_WARNING_THRESHOLD_SECS,
                self.session_warning_threshold
            );
        }

        if self.session_poll_interval == 0 {
            anyhow::bail!("SESSION_POLL_INTERVAL must be at least 1 second");
        }

        if self.http_request_timeout == 0 || self.http_connect_timeout == 0 {
            anyhow::bail!("HTTP timeouts must be at least 1 second");
        }

        Ok(())
    }

    /// Paths whose 401 means bad credentials, not an expired token
    pub fn auth_exempt_paths(&self) -> Vec<String> {
        vec![
            self.login_path.clone(),
            self.two_factor_path.clone(),
            self.refresh_path.clone(),
        ]
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| default.to_string())
}

/// Expand tilde (~) in file paths to user's home directory
fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Per-user data directory, or the working directory as a last resort
fn default_credential_db_file() -> PathBuf {
    dirs::data_local_dir()
        .map(|dir| dir.join("clinic-session").join("session.sqlite3"))
        .unwrap_or_else(|| PathBuf::from("session.sqlite3"))
}


// === Interactive Setup ===

/// Check if interactive setup is needed (no .env file and no API URL)
pub fn needs_interactive_setup(args: &CliArgs) -> bool {
    let env_file_exists = std::path::Path::new(".env").exists();
    !env_file_exists && args.api_url.is_none()
}

/// Configuration collected from interactive setup
#[derive(Debug, Clone)]
pub struct InteractiveConfig {
    pub api_base_url: String,
    pub credential_db_file: String,
}

/// Run interactive setup to collect required configuration
pub fn run_interactive_setup() -> Result<InteractiveConfig> {
    println!();
    println!("Clinic session client - first time setup");
    println!();
    println!("No configuration found. Let's point the client at your clinic API.");
    println!();

    let api_base_url: String = Input::new()
        .with_prompt("Clinic API base URL (API_BASE_URL)")
        .validate_with(|input: &String| -> std::result::Result<(), &str> {
            if input.starts_with("http://") || input.starts_with("https://") {
                Ok(())
            } else {
                Err("URL must start with http:// or https://")
            }
        })
        .interact_text()
        .context("Failed to read API_BASE_URL")?;

    let default_db = default_credential_db_file().to_string_lossy().to_string();
    let credential_db_file: String = Input::new()
        .with_prompt("Credential database path (CREDENTIAL_DB_FILE)")
        .default(default_db)
        .interact_text()
        .context("Failed to read CREDENTIAL_DB_FILE")?;

    let config = InteractiveConfig {
        api_base_url,
        credential_db_file,
    };

    println!();
    let save_to_env = Confirm::new()
        .with_prompt("Save configuration to .env file?")
        .default(true)
        .interact()
        .context("Failed to read save confirmation")?;

    if save_to_env {
        save_env_file(&config)?;
        println!("Configuration saved to .env file");
    }

    println!();
    Ok(config)
}

/// Save configuration to .env file
fn save_env_file(config: &InteractiveConfig) -> Result<()> {
    let env_content = format!(
        r#"# Clinic session client configuration
# Generated by interactive setup

# Base URL of the clinic REST API (required)
API_BASE_URL={}

# SQLite credential database
CREDENTIAL_DB_FILE={}

# Session monitor
SESSION_WARNING_THRESHOLD=300
SESSION_POLL_INTERVAL=5

# Logging (trace, debug, info, warn, error)
LOG_LEVEL=info
"#,
        config.api_base_url, config.credential_db_file,
    );

    let mut file = std::fs::File::create(".env").context("Failed to create .env file")?;
    file.write_all(env_content.as_bytes())
        .context("Failed to write .env file")?;

    Ok(())
}
