//! SQLite-backed module-state store.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::Serialize;

use super::locks::KeyLocks;
use super::StoreError;
use crate::record::{ModuleState, StatusRecord};

/// How long a connection waits for the database write lock.
pub const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Idle connections kept for reuse.
pub const MAX_IDLE_CONNECTIONS: usize = 4;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS module_status (
        module_id TEXT PRIMARY KEY NOT NULL,
        state TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );
";

/// One stored module row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PersistedModule {
    /// Module identifier.
    pub module_id: String,
    /// Last applied state.
    pub state: ModuleState,
    /// When the row was last written.
    pub updated_at: DateTime<Utc>,
}

/// What one [`ModuleStateStore::apply`] did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplySummary {
    /// Rows inserted for modules seen for the first time.
    pub created: usize,
    /// Rows whose state changed.
    pub updated: usize,
    /// Rows that already held the applied state.
    pub unchanged: usize,
}

/// Persistent map from module identifier to last applied state.
///
/// Every [`apply`](Self::apply) runs in one transaction. Applies touching a
/// common module are serialized by [`KeyLocks`]; others proceed on their own
/// pooled connection and only meet at SQLite's write lock.
#[derive(Debug)]
pub struct ModuleStateStore {
    path: PathBuf,
    idle: Mutex<Vec<Connection>>,
    locks: KeyLocks,
}

impl ModuleStateStore {
    /// Open or create the store at `path`.
    ///
    /// Creates missing parent directories, enables WAL journaling and
    /// creates the schema.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::CreateDir`] or [`StoreError::Open`] if the
    /// database cannot be created; callers treat this as fatal.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::CreateDir {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let conn = Self::connect(&path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .and_then(|()| conn.execute_batch(SCHEMA))
            .map_err(|source| StoreError::Open {
                path: path.clone(),
                source,
            })?;

        log::info!("Opened module store at {}", path.display());

        Ok(Self {
            path,
            idle: Mutex::new(vec![conn]),
            locks: KeyLocks::default(),
        })
    }

    /// Path of the database file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn connect(path: &Path) -> Result<Connection, StoreError> {
        let conn = Connection::open(path).map_err(|source| StoreError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Ok(conn)
    }

    fn idle_connections(&self) -> MutexGuard<'_, Vec<Connection>> {
        self.idle.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run `f` on a pooled connection, opening a new one if none is idle.
    fn with_connection<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let reused = self.idle_connections().pop();
        let mut conn = match reused {
            Some(conn) => conn,
            None => Self::connect(&self.path)?,
        };

        let result = f(&mut conn);

        let mut idle = self.idle_connections();
        if idle.len() < MAX_IDLE_CONNECTIONS {
            idle.push(conn);
        }
        result
    }

    /// Apply every module entry of `record` in one transaction.
    ///
    /// Missing modules are inserted, existing ones overwritten in place.
    /// When a record lists the same module twice the later entry wins.
    /// Applying a record again leaves the stored states unchanged.
    ///
    /// # Concurrency
    ///
    /// Applies that share a module wait on each other's [`KeyLocks`] stripe
    /// for the whole apply. Applies on disjoint modules never wait on a key
    /// lock and run on separate pooled connections, but SQLite admits one
    /// writer per database: the `BEGIN IMMEDIATE` transaction still takes the
    /// file-level write lock, so their short write transactions commit one
    /// after another, bounded by [`BUSY_TIMEOUT`].
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if any statement or the commit
    /// fails; nothing from the record is then visible.
    pub fn apply(&self, record: &StatusRecord) -> Result<ApplySummary, StoreError> {
        let _guard = self
            .locks
            .lock(record.modules.iter().map(|m| m.module_id.as_str()));

        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let mut summary = ApplySummary::default();

        self.with_connection(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            {
                let mut select =
                    tx.prepare_cached("SELECT state FROM module_status WHERE module_id = ?1")?;
                let mut upsert = tx.prepare_cached(
                    "INSERT INTO module_status (module_id, state, updated_at) VALUES (?1, ?2, ?3)
                     ON CONFLICT(module_id) DO UPDATE SET state = excluded.state, updated_at = excluded.updated_at",
                )?;

                for entry in &record.modules {
                    let previous: Option<String> = select
                        .query_row(params![entry.module_id], |row| row.get(0))
                        .optional()?;
                    upsert.execute(params![entry.module_id, entry.state.as_str(), now])?;

                    match previous {
                        None => {
                            summary.created += 1;
                            log::info!("Module {} created with state {}", entry.module_id, entry.state);
                        }
                        Some(old) if old == entry.state.as_str() => summary.unchanged += 1,
                        Some(old) => {
                            summary.updated += 1;
                            log::info!("Module {} updated: {} -> {}", entry.module_id, old, entry.state);
                        }
                    }
                }
            }
            tx.commit()?;
            Ok(summary)
        })
    }

    /// Insert or overwrite the state of one module.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on failure.
    pub fn upsert(&self, module_id: &str, state: ModuleState) -> Result<(), StoreError> {
        let record = StatusRecord::new(None, vec![crate::record::ModuleEntry::new(module_id, state)]);
        self.apply(&record).map(|_| ())
    }

    /// Stored state of `module_id`, if any.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Corrupt`] if the stored state is not a known
    /// [`ModuleState`].
    pub fn get(&self, module_id: &str) -> Result<Option<ModuleState>, StoreError> {
        let stored: Option<String> = self.with_connection(|conn| {
            conn.query_row(
                "SELECT state FROM module_status WHERE module_id = ?1",
                params![module_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(StoreError::from)
        })?;

        stored
            .map(|value| parse_state(module_id, value))
            .transpose()
    }

    /// All stored modules ordered by identifier.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Corrupt`] if a row cannot be decoded.
    pub fn list(&self) -> Result<Vec<PersistedModule>, StoreError> {
        let rows = self.with_connection(|conn| {
            let mut stmt = conn
                .prepare("SELECT module_id, state, updated_at FROM module_status ORDER BY module_id")?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;

        rows.into_iter()
            .map(|(module_id, state, updated_at)| {
                let state = parse_state(&module_id, state)?;
                let updated_at = DateTime::parse_from_rfc3339(&updated_at)
                    .map_err(|_| StoreError::Corrupt {
                        module_id: module_id.clone(),
                        value: updated_at.clone(),
                    })?
                    .with_timezone(&Utc);
                Ok(PersistedModule {
                    module_id,
                    state,
                    updated_at,
                })
            })
            .collect()
    }

    /// Number of stored modules.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on failure.
    pub fn len(&self) -> Result<usize, StoreError> {
        let count: i64 = self.with_connection(|conn| {
            conn.query_row("SELECT COUNT(*) FROM module_status", [], |row| row.get(0))
                .map_err(StoreError::from)
        })?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    /// Whether no module has been stored yet.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on failure.
    pub fn is_empty(&self) -> Result<bool, StoreError> {
        self.len().map(|n| n == 0)
    }
}

fn parse_state(module_id: &str, value: String) -> Result<ModuleState, StoreError> {
    value.parse().map_err(|_| StoreError::Corrupt {
        module_id: module_id.to_string(),
        value,
    })
}
