//! Pluggable persistence for upstream credentials
//!
//! Pure storage, no policy: the token manager decides what is usable, the
//! store only round-trips serialized snapshots. All functions are
//! synchronous; async callers wrap them in `spawn_blocking`.

use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::proxy::error::ProxyError;

/// Serialized credential snapshot
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoredCredential {
    pub value: String,
    pub acquired_at: i64,
    pub expires_at: i64,
    #[serde(default)]
    pub use_count: u64,
    #[serde(default)]
    pub error_count: u32,
}

/// Storage backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TokenStorageKind {
    Memory,
    File,
    #[default]
    Sqlite,
}

impl std::str::FromStr for TokenStorageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "file" => Ok(Self::File),
            "sqlite" => Ok(Self::Sqlite),
            other => Err(format!("unknown token storage type: {}", other)),
        }
    }
}

pub trait TokenStore: Send + Sync {
    /// Load every persisted active credential (expired entries included;
    /// the caller filters).
    fn load_all(&self) -> Result<Vec<StoredCredential>, ProxyError>;
    /// Insert or update one credential snapshot.
    fn save(&self, credential: &StoredCredential) -> Result<(), ProxyError>;
    /// Mark one credential invalid so it is never loaded again.
    fn remove(&self, value: &str) -> Result<(), ProxyError>;
    /// Delete entries whose expiry is in the past. Returns removed count.
    fn purge_expired(&self, now: i64) -> Result<usize, ProxyError>;
}

/// 根据配置打开存储后端
pub fn open_store(
    kind: TokenStorageKind,
    db_path: &str,
    storage_dir: &str,
) -> Arc<dyn TokenStore> {
    match kind {
        TokenStorageKind::Memory => Arc::new(MemoryStore),
        TokenStorageKind::File => Arc::new(FileStore::new(storage_dir)),
        TokenStorageKind::Sqlite => Arc::new(SqliteStore::new(db_path)),
    }
}

// ===== memory backend =====

/// No-op persistence; the pool is memory-only.
pub struct MemoryStore;

impl TokenStore for MemoryStore {
    fn load_all(&self) -> Result<Vec<StoredCredential>, ProxyError> {
        Ok(Vec::new())
    }

    fn save(&self, _credential: &StoredCredential) -> Result<(), ProxyError> {
        Ok(())
    }

    fn remove(&self, _value: &str) -> Result<(), ProxyError> {
        Ok(())
    }

    fn purge_expired(&self, _now: i64) -> Result<usize, ProxyError> {
        Ok(0)
    }
}

// ===== file backend =====

/// JSON file storage under a dedicated directory.
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(storage_dir: impl AsRef<Path>) -> Self {
        let dir = storage_dir.as_ref();
        if !dir.exists() {
            if let Err(e) = std::fs::create_dir_all(dir) {
                tracing::warn!("Failed to create token storage dir {:?}: {}", dir, e);
            }
        }
        Self {
            path: dir.join("active_tokens.json"),
        }
    }

    fn read_entries(&self) -> Result<Vec<StoredCredential>, ProxyError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(&self.path)
            .map_err(|e| ProxyError::Storage(format!("read {:?}: {}", self.path, e)))?;
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&content)
            .map_err(|e| ProxyError::Storage(format!("parse {:?}: {}", self.path, e)))
    }

    fn write_entries(&self, entries: &[StoredCredential]) -> Result<(), ProxyError> {
        let content = serde_json::to_string_pretty(entries)
            .map_err(|e| ProxyError::Storage(format!("serialize tokens: {}", e)))?;
        std::fs::write(&self.path, content)
            .map_err(|e| ProxyError::Storage(format!("write {:?}: {}", self.path, e)))
    }
}

impl TokenStore for FileStore {
    fn load_all(&self) -> Result<Vec<StoredCredential>, ProxyError> {
        self.read_entries()
    }

    fn save(&self, credential: &StoredCredential) -> Result<(), ProxyError> {
        let mut entries = self.read_entries()?;
        match entries.iter_mut().find(|e| e.value == credential.value) {
            Some(existing) => *existing = credential.clone(),
            None => entries.push(credential.clone()),
        }
        self.write_entries(&entries)
    }

    fn remove(&self, value: &str) -> Result<(), ProxyError> {
        let mut entries = self.read_entries()?;
        entries.retain(|e| e.value != value);
        self.write_entries(&entries)
    }

    fn purge_expired(&self, now: i64) -> Result<usize, ProxyError> {
        let entries = self.read_entries()?;
        let before = entries.len();
        let kept: Vec<_> = entries.into_iter().filter(|e| e.expires_at > now).collect();
        let removed = before - kept.len();
        if removed > 0 {
            self.write_entries(&kept)?;
        }
        Ok(removed)
    }
}

// ===== sqlite backend =====

/// SQLite storage mirroring the original token table layout.
pub struct SqliteStore {
    db_path: PathBuf,
}

impl SqliteStore {
    pub fn new(db_path: impl AsRef<Path>) -> Self {
        let store = Self {
            db_path: db_path.as_ref().to_path_buf(),
        };
        if let Err(e) = store.init_db() {
            tracing::error!("Failed to initialize token database: {}", e);
        }
        store
    }

    fn open(&self) -> Result<Connection, ProxyError> {
        Connection::open(&self.db_path)
            .map_err(|e| ProxyError::Storage(format!("open {:?}: {}", self.db_path, e)))
    }

    fn init_db(&self) -> Result<(), ProxyError> {
        if let Some(parent) = self.db_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ProxyError::Storage(format!("create {:?}: {}", parent, e)))?;
            }
        }

        let conn = self.open()?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS tokens (
                token TEXT PRIMARY KEY,
                obtained_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL,
                status TEXT NOT NULL DEFAULT 'active',
                use_count INTEGER NOT NULL DEFAULT 0,
                error_count INTEGER NOT NULL DEFAULT 0
            )",
            [],
        )
        .map_err(|e| ProxyError::Storage(e.to_string()))?;
        Ok(())
    }
}

impl TokenStore for SqliteStore {
    fn load_all(&self) -> Result<Vec<StoredCredential>, ProxyError> {
        let conn = self.open()?;
        let mut stmt = conn
            .prepare(
                "SELECT token, obtained_at, expires_at, use_count, error_count
                 FROM tokens WHERE status = 'active'
                 ORDER BY error_count ASC, use_count ASC",
            )
            .map_err(|e| ProxyError::Storage(e.to_string()))?;

        let rows = stmt
            .query_map([], |row| {
                Ok(StoredCredential {
                    value: row.get(0)?,
                    acquired_at: row.get(1)?,
                    expires_at: row.get(2)?,
                    use_count: row.get::<_, i64>(3)? as u64,
                    error_count: row.get::<_, i64>(4)? as u32,
                })
            })
            .map_err(|e| ProxyError::Storage(e.to_string()))?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row.map_err(|e| ProxyError::Storage(e.to_string()))?);
        }
        Ok(entries)
    }

    fn save(&self, credential: &StoredCredential) -> Result<(), ProxyError> {
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO tokens (token, obtained_at, expires_at, status, use_count, error_count)
             VALUES (?1, ?2, ?3, 'active', ?4, ?5)
             ON CONFLICT(token) DO UPDATE SET
                expires_at = excluded.expires_at,
                use_count = excluded.use_count,
                error_count = excluded.error_count",
            params![
                credential.value,
                credential.acquired_at,
                credential.expires_at,
                credential.use_count as i64,
                credential.error_count as i64,
            ],
        )
        .map_err(|e| ProxyError::Storage(e.to_string()))?;
        Ok(())
    }

    fn remove(&self, value: &str) -> Result<(), ProxyError> {
        let conn = self.open()?;
        conn.execute(
            "UPDATE tokens SET status = 'invalid' WHERE token = ?1",
            params![value],
        )
        .map_err(|e| ProxyError::Storage(e.to_string()))?;
        Ok(())
    }

    fn purge_expired(&self, now: i64) -> Result<usize, ProxyError> {
        let conn = self.open()?;
        let removed = conn
            .execute(
                "DELETE FROM tokens WHERE expires_at < ?1 OR status != 'active'",
                params![now],
            )
            .map_err(|e| ProxyError::Storage(e.to_string()))?;
        if removed > 0 {
            tracing::debug!("Purged {} stale tokens from storage", removed);
        }
        Ok(removed)
    }
}
