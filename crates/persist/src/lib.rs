//! Regatta persistence: the application status subdocument behind a store
//! trait, updated by last-writer-wins partial merges. Keep code tiny and
//! predictable.

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use chrono::Utc;
use metrics::{counter, histogram};
use regatta_core::{Application, ApplicationSource, RevisionHistoryEntry};
use serde_json::Value;
use tracing::info;

/// Persisted application status access, keyed by app name + namespace.
/// Writes are partial merges against the stored document; stronger
/// consistency, if needed, is the storage layer's concern.
pub trait StatusStore: Send + Sync {
    fn patch_status(&self, name: &str, namespace: &str, patch: &Value) -> Result<()>;
    fn get_status(&self, name: &str, namespace: &str) -> Result<Option<Value>>;
}

/// RFC 7386-style merge: objects merge recursively, `null` removes a key,
/// anything else replaces.
pub fn json_merge(base: &mut Value, patch: &Value) {
    match patch {
        Value::Object(patch_map) => {
            if !base.is_object() {
                *base = Value::Object(Default::default());
            }
            if let Value::Object(base_map) = base {
                for (k, pv) in patch_map {
                    if pv.is_null() {
                        base_map.remove(k);
                    } else {
                        json_merge(base_map.entry(k.clone()).or_insert(Value::Null), pv);
                    }
                }
            }
        }
        _ => *base = patch.clone(),
    }
}

// ---------------- SQLite store ----------------

/// SQLite-backed store. Simple, synchronous; status writes are not on a
/// latency-sensitive path.
pub struct SqliteStore {
    db: std::sync::Mutex<rusqlite::Connection>,
}

impl SqliteStore {
    pub fn open_default() -> Result<Self> {
        let path = std::env::var("REGATTA_DB_PATH").unwrap_or_else(|_| default_db_path());
        Self::open(&path)
    }

    pub fn open(path: &str) -> Result<Self> {
        let started = std::time::Instant::now();
        let db = rusqlite::Connection::open(path)
            .with_context(|| format!("opening sqlite db at {}", path))?;
        db.pragma_update(None, "journal_mode", "WAL").ok();
        db.pragma_update(None, "synchronous", "NORMAL").ok();
        db.execute(
            "CREATE TABLE IF NOT EXISTS app_status (
                name      TEXT NOT NULL,
                namespace TEXT NOT NULL,
                status    TEXT NOT NULL,
                PRIMARY KEY (name, namespace)
            )",
            [],
        )
        .context("creating app_status table")?;
        let me = Self { db: std::sync::Mutex::new(db) };
        histogram!("persist_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(me)
    }
}

impl StatusStore for SqliteStore {
    fn patch_status(&self, name: &str, namespace: &str, patch: &Value) -> Result<()> {
        let started = std::time::Instant::now();
        let mut db = self.db.lock().unwrap();
        let tx = db.transaction()?;
        let existing: Option<String> = tx
            .query_row(
                "SELECT status FROM app_status WHERE name = ?1 AND namespace = ?2",
                (name, namespace),
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        let mut doc = match existing {
            Some(s) => serde_json::from_str(&s).context("decoding stored status")?,
            None => Value::Object(Default::default()),
        };
        json_merge(&mut doc, patch);
        tx.execute(
            "INSERT INTO app_status (name, namespace, status) VALUES (?1, ?2, ?3)
             ON CONFLICT(name, namespace) DO UPDATE SET status = excluded.status",
            (name, namespace, serde_json::to_string(&doc)?),
        )?;
        tx.commit()?;
        histogram!("persist_patch_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("persist_patch_total", 1u64);
        Ok(())
    }

    fn get_status(&self, name: &str, namespace: &str) -> Result<Option<Value>> {
        let db = self.db.lock().unwrap();
        let row: Option<String> = db
            .query_row(
                "SELECT status FROM app_status WHERE name = ?1 AND namespace = ?2",
                (name, namespace),
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        row.map(|s| serde_json::from_str(&s).context("decoding stored status"))
            .transpose()
    }
}

fn default_db_path() -> String {
    if let Some(home) = std::env::var_os("HOME") {
        let mut p = std::path::PathBuf::from(home);
        p.push(".regatta");
        let _ = std::fs::create_dir_all(&p);
        p.push("regatta.db");
        return p.to_string_lossy().to_string();
    }
    "regatta.db".to_string()
}

// ---------------- In-memory store ----------------

/// In-memory store for tests and dry runs.
#[derive(Default)]
pub struct MemStore {
    docs: std::sync::Mutex<std::collections::HashMap<(String, String), Value>>,
}

impl StatusStore for MemStore {
    fn patch_status(&self, name: &str, namespace: &str, patch: &Value) -> Result<()> {
        let mut docs = self.docs.lock().unwrap();
        let doc = docs
            .entry((name.to_string(), namespace.to_string()))
            .or_insert(Value::Object(Default::default()));
        json_merge(doc, patch);
        Ok(())
    }

    fn get_status(&self, name: &str, namespace: &str) -> Result<Option<Value>> {
        Ok(self.docs.lock().unwrap().get(&(name.to_string(), namespace.to_string())).cloned())
    }
}

// ---------------- Revision history ----------------

/// Append a revision-history entry (monotonic ID, UTC deploy time), truncate
/// to the configured retention limit (oldest first) and persist the history
/// list as a partial status merge.
pub fn persist_revision_history(
    app: &mut Application,
    revision: &str,
    source: ApplicationSource,
    store: &dyn StatusStore,
) -> Result<()> {
    let next_id = app.status.history.last().map(|h| h.id + 1).unwrap_or(0);
    app.status.history.push(RevisionHistoryEntry {
        id: next_id,
        revision: revision.to_string(),
        deployed_at: Utc::now(),
        source,
    });
    let limit = app.revision_history_limit();
    if app.status.history.len() > limit {
        let drop = app.status.history.len() - limit;
        app.status.history.drain(..drop);
    }
    let patch = serde_json::json!({ "history": app.status.history });
    store.patch_status(&app.name, &app.namespace, &patch)?;
    info!(app = %app.name, id = next_id, revision = %revision, entries = app.status.history.len(), "revision history persisted");
    Ok(())
}
