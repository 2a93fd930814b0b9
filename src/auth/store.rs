// Credential storage
// The only place the access token is persisted

use anyhow::{anyhow, Context, Result};
use rusqlite::{Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Key of the access token in the `auth_kv` table
const TOKEN_KEY: &str = "clinic:session:access-token";

/// Holds the single live credential
///
/// Calls are synchronous and run on the caller's async task. Each is a single
/// small read or write; a store shared by many concurrent tasks should move
/// its I/O onto `tokio::task::spawn_blocking`.
pub trait CredentialStore: Send + Sync {
    fn get(&self) -> Result<Option<String>>;

    fn set(&self, token: &str) -> Result<()>;

    fn clear(&self) -> Result<()>;

    /// Clear only if the stored token is `token`; returns whether it was cleared
    fn clear_if(&self, token: &str) -> Result<bool>;
}

/// Process-local store, lost on exit
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    token: Mutex<Option<String>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(token: impl Into<String>) -> Self {
        Self {
            token: Mutex::new(Some(token.into())),
        }
    }

    fn slot(&self) -> Result<std::sync::MutexGuard<'_, Option<String>>> {
        self.token
            .lock()
            .map_err(|_| anyhow!("Credential store lock poisoned"))
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn get(&self) -> Result<Option<String>> {
        Ok(self.slot()?.clone())
    }

    fn set(&self, token: &str) -> Result<()> {
        *self.slot()? = Some(token.to_string());
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        *self.slot()? = None;
        Ok(())
    }

    fn clear_if(&self, token: &str) -> Result<bool> {
        let mut slot = self.slot()?;
        if slot.as_deref() == Some(token) {
            *slot = None;
            return Ok(true);
        }
        Ok(false)
    }
}

/// SQLite-backed store that survives restarts
pub struct SqliteCredentialStore {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl SqliteCredentialStore {
    /// Open (or create) the credential database
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open SQLite database: {}", path.display()))?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS auth_kv (key TEXT PRIMARY KEY, value TEXT NOT NULL)",
            [],
        )
        .context("Failed to create auth_kv table")?;

        tracing::debug!("Credential store opened: {}", path.display());

        Ok(Self {
            conn: Mutex::new(conn),
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("Credential store lock poisoned"))
    }
}

impl CredentialStore for SqliteCredentialStore {
    fn get(&self) -> Result<Option<String>> {
        self.conn()?
            .query_row(
                "SELECT value FROM auth_kv WHERE key = ?",
                [TOKEN_KEY],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to load token from SQLite")
    }

    fn set(&self, token: &str) -> Result<()> {
        self.conn()?
            .execute(
                "INSERT INTO auth_kv (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                [TOKEN_KEY, token],
            )
            .context("Failed to save token to SQLite")?;
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        self.conn()?
            .execute("DELETE FROM auth_kv WHERE key = ?", [TOKEN_KEY])
            .context("Failed to delete token from SQLite")?;
        Ok(())
    }

    fn clear_if(&self, token: &str) -> Result<bool> {
        let deleted = self
            .conn()?
            .execute(
                "DELETE FROM auth_kv WHERE key = ?1 AND value = ?2",
                [TOKEN_KEY, token],
            )
            .context("Failed to delete token from SQLite")?;
        Ok(deleted > 0)
    }
}
