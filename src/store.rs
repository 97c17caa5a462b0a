//! Transactional document store over the workspace database.
//!
//! Documents are JSON bodies addressed by `(collection, doc_id)` and carry a
//! version counter that increments on every committed write. Transactions
//! read outside the write lock, stage writes in memory, and validate the
//! observed versions at commit; a version mismatch aborts the attempt and the
//! whole closure is re-run with fresh reads.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};

use crate::db;

/// Commit attempts per transaction before giving up on a contended document.
pub const MAX_TX_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone)]
pub struct Snapshot {
    pub doc_id: String,
    pub version: i64,
    pub body: serde_json::Value,
}

impl Snapshot {
    /// Deserialize the body into a typed document model.
    pub fn parse<T: serde::de::DeserializeOwned>(&self, collection: &str) -> Result<T, StoreError> {
        serde_json::from_value(self.body.clone()).map_err(|source| StoreError::BadBody {
            collection: collection.to_string(),
            doc_id: self.doc_id.clone(),
            source,
        })
    }
}

#[derive(Debug, Clone)]
pub enum DocEvent {
    Updated(Snapshot),
    Deleted { doc_id: String },
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("document not found: {collection}/{doc_id}")]
    NotFound { collection: String, doc_id: String },
    #[error("transaction conflict persisted after {MAX_TX_ATTEMPTS} attempts")]
    Conflict,
    #[error("transaction reads must all happen before the first staged write")]
    ReadAfterWrite,
    #[error("document body for {collection}/{doc_id} is not valid JSON: {source}")]
    BadBody {
        collection: String,
        doc_id: String,
        source: serde_json::Error,
    },
    #[error("failed to encode document body: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),
}

type WatcherMap = HashMap<(String, String), Vec<Sender<DocEvent>>>;

struct StoreInner {
    conn: Mutex<Connection>,
    watchers: Mutex<WatcherMap>,
    workspace: PathBuf,
}

/// Handle to the workspace document store. Cheap to clone; all clones share
/// one connection and one watcher registry.
#[derive(Clone)]
pub struct DocStore {
    inner: Arc<StoreInner>,
}

/// Subscription to a single document, fed on every committed change.
pub struct Watch {
    rx: Receiver<DocEvent>,
}

impl Watch {
    /// Drain whatever has arrived since the last call, without blocking.
    pub fn drain(&self) -> Vec<DocEvent> {
        let mut events = Vec::new();
        while let Ok(ev) = self.rx.try_recv() {
            events.push(ev);
        }
        events
    }

    /// Block until the next event, used by tests that need to observe a
    /// commit from another thread.
    pub fn recv(&self) -> Option<DocEvent> {
        self.rx.recv().ok()
    }
}

enum Staged {
    Put {
        collection: String,
        doc_id: String,
        body: serde_json::Value,
    },
    Delete {
        collection: String,
        doc_id: String,
    },
}

/// One attempt of a transaction: a read set with observed versions plus
/// staged writes. All reads must precede the first staged write; absence is
/// observed as version 0 so that concurrent creation is detected too.
pub struct Tx<'a> {
    store: &'a DocStore,
    reads: Vec<(String, String, i64)>,
    writes: Vec<Staged>,
}

impl<'a> Tx<'a> {
    pub fn read(
        &mut self,
        collection: &str,
        doc_id: &str,
    ) -> Result<Option<Snapshot>, StoreError> {
        if !self.writes.is_empty() {
            return Err(StoreError::ReadAfterWrite);
        }
        let snap = self.store.fetch(collection, doc_id)?;
        let observed = snap.as_ref().map(|s| s.version).unwrap_or(0);
        let already = self
            .reads
            .iter()
            .any(|(c, d, _)| c == collection && d == doc_id);
        if !already {
            self.reads
                .push((collection.to_string(), doc_id.to_string(), observed));
        }
        Ok(snap)
    }

    pub fn write(&mut self, collection: &str, doc_id: &str, body: serde_json::Value) {
        self.writes.push(Staged::Put {
            collection: collection.to_string(),
            doc_id: doc_id.to_string(),
            body,
        });
    }

    pub fn delete(&mut self, collection: &str, doc_id: &str) {
        self.writes.push(Staged::Delete {
            collection: collection.to_string(),
            doc_id: doc_id.to_string(),
        });
    }
}

enum CommitOutcome {
    Applied(Vec<((String, String), DocEvent)>),
    Conflict,
}

impl DocStore {
    pub fn open(workspace: &Path) -> anyhow::Result<DocStore> {
        let conn = db::open_db(workspace)?;
        Ok(DocStore {
            inner: Arc::new(StoreInner {
                conn: Mutex::new(conn),
                watchers: Mutex::new(HashMap::new()),
                workspace: workspace.to_path_buf(),
            }),
        })
    }

    pub fn workspace(&self) -> &Path {
        &self.inner.workspace
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.inner
            .conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn fetch(&self, collection: &str, doc_id: &str) -> Result<Option<Snapshot>, StoreError> {
        let conn = self.conn();
        let row: Option<(i64, String)> = conn
            .query_row(
                "SELECT version, body FROM documents WHERE collection = ? AND doc_id = ?",
                (collection, doc_id),
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;
        let Some((version, raw)) = row else {
            return Ok(None);
        };
        let body = serde_json::from_str(&raw).map_err(|source| StoreError::BadBody {
            collection: collection.to_string(),
            doc_id: doc_id.to_string(),
            source,
        })?;
        Ok(Some(Snapshot {
            doc_id: doc_id.to_string(),
            version,
            body,
        }))
    }

    /// Point read outside any transaction.
    pub fn get(&self, collection: &str, doc_id: &str) -> Result<Option<Snapshot>, StoreError> {
        self.fetch(collection, doc_id)
    }

    /// Point read that treats absence as an error.
    pub fn get_required(&self, collection: &str, doc_id: &str) -> Result<Snapshot, StoreError> {
        self.fetch(collection, doc_id)?
            .ok_or_else(|| StoreError::NotFound {
                collection: collection.to_string(),
                doc_id: doc_id.to_string(),
            })
    }

    /// All documents of a collection, ordered by doc_id.
    pub fn list(&self, collection: &str) -> Result<Vec<Snapshot>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT doc_id, version, body FROM documents
             WHERE collection = ? ORDER BY doc_id",
        )?;
        let rows = stmt
            .query_map([collection], |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, i64>(1)?,
                    r.get::<_, String>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        drop(stmt);
        drop(conn);

        let mut snaps = Vec::with_capacity(rows.len());
        for (doc_id, version, raw) in rows {
            let body = serde_json::from_str(&raw).map_err(|source| StoreError::BadBody {
                collection: collection.to_string(),
                doc_id: doc_id.clone(),
                source,
            })?;
            snaps.push(Snapshot {
                doc_id,
                version,
                body,
            });
        }
        Ok(snaps)
    }

    /// Subscribe to one document. The returned watch receives an event for
    /// every committed write or delete, in commit order.
    pub fn subscribe(&self, collection: &str, doc_id: &str) -> Watch {
        let (tx, rx) = channel();
        let mut watchers = self
            .inner
            .watchers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        watchers
            .entry((collection.to_string(), doc_id.to_string()))
            .or_default()
            .push(tx);
        Watch { rx }
    }

    /// Run `f` as a transaction: reads record observed versions, writes are
    /// staged, and commit re-validates every read under the write lock.
    /// Conflicting attempts are retried with fresh reads up to
    /// [`MAX_TX_ATTEMPTS`]; errors returned by `f` abort immediately with
    /// nothing applied.
    pub fn run_transaction<T, E, F>(&self, mut f: F) -> Result<T, E>
    where
        F: FnMut(&mut Tx) -> Result<T, E>,
        E: From<StoreError>,
    {
        let mut attempt = 1;
        loop {
            let mut tx = Tx {
                store: self,
                reads: Vec::new(),
                writes: Vec::new(),
            };
            let out = f(&mut tx)?;
            match self.commit(tx).map_err(StoreError::from)? {
                CommitOutcome::Applied(events) => {
                    self.notify(events);
                    return Ok(out);
                }
                CommitOutcome::Conflict => {
                    if attempt >= MAX_TX_ATTEMPTS {
                        return Err(StoreError::Conflict.into());
                    }
                    log::debug!(
                        "transaction conflict, retrying (attempt {}/{})",
                        attempt + 1,
                        MAX_TX_ATTEMPTS
                    );
                    attempt += 1;
                }
            }
        }
    }

    fn commit(&self, tx: Tx) -> Result<CommitOutcome, rusqlite::Error> {
        let conn = self.conn();
        let sql_tx = conn.unchecked_transaction()?;

        for (collection, doc_id, observed) in &tx.reads {
            let current: Option<i64> = sql_tx
                .query_row(
                    "SELECT version FROM documents WHERE collection = ? AND doc_id = ?",
                    (collection, doc_id),
                    |r| r.get(0),
                )
                .optional()?;
            if current.unwrap_or(0) != *observed {
                // Leave the database untouched; the caller re-runs the closure.
                return Ok(CommitOutcome::Conflict);
            }
        }

        let now = Utc::now().to_rfc3339();
        let mut events: Vec<((String, String), DocEvent)> = Vec::new();
        for staged in &tx.writes {
            match staged {
                Staged::Put {
                    collection,
                    doc_id,
                    body,
                } => {
                    let raw = body.to_string();
                    sql_tx.execute(
                        "INSERT INTO documents(collection, doc_id, version, body, updated_at)
                         VALUES(?, ?, 1, ?, ?)
                         ON CONFLICT(collection, doc_id) DO UPDATE SET
                           version = version + 1,
                           body = excluded.body,
                           updated_at = excluded.updated_at",
                        (collection, doc_id, &raw, &now),
                    )?;
                    let version: i64 = sql_tx.query_row(
                        "SELECT version FROM documents WHERE collection = ? AND doc_id = ?",
                        (collection, doc_id),
                        |r| r.get(0),
                    )?;
                    events.push((
                        (collection.clone(), doc_id.clone()),
                        DocEvent::Updated(Snapshot {
                            doc_id: doc_id.clone(),
                            version,
                            body: body.clone(),
                        }),
                    ));
                }
                Staged::Delete { collection, doc_id } => {
                    let removed = sql_tx.execute(
                        "DELETE FROM documents WHERE collection = ? AND doc_id = ?",
                        (collection, doc_id),
                    )?;
                    if removed > 0 {
                        events.push((
                            (collection.clone(), doc_id.clone()),
                            DocEvent::Deleted {
                                doc_id: doc_id.clone(),
                            },
                        ));
                    }
                }
            }
        }

        sql_tx.commit()?;
        Ok(CommitOutcome::Applied(events))
    }

    fn notify(&self, events: Vec<((String, String), DocEvent)>) {
        if events.is_empty() {
            return;
        }
        let mut watchers = self
            .inner
            .watchers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for (key, event) in events {
            if let Some(senders) = watchers.get_mut(&key) {
                senders.retain(|sender| sender.send(event.clone()).is_ok());
                if senders.is_empty() {
                    watchers.remove(&key);
                }
            }
        }
    }
}
