//! SQLite state store.
//!
//! Single source of truth for every file's lifecycle state and attempt
//! history. WAL mode for concurrent read access. All mutations go through
//! compare-and-transition: callers supply the state they believe the item is
//! in, and the store rejects the write if reality disagrees. That rejection
//! is what guarantees at most one active pipeline run per identity, even
//! when two execution paths race.

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::{ErrorKind, FileId, State, WorkItem};

/// Outcome of ingesting a discovery event.
#[derive(Debug)]
pub enum CreateResult {
    /// New work item recorded in Discovered.
    Created(WorkItem),
    /// An item with this identity already exists; ingestion is a no-op.
    AlreadyExists(WorkItem),
}

/// One audit trail entry. Appended on every successful transition.
#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub trace_id: Uuid,
    pub at: DateTime<Utc>,
    pub from: State,
    pub to: State,
}

/// Storage backend. Owns the SQLite connection; the mutex is the single
/// critical section all check-and-update operations run under.
pub struct StateStore {
    conn: Mutex<Connection>,
}

impl StateStore {
    /// Open or create a database at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init()?;
        Ok(store)
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> Result<()> {
        let conn = self.lock();
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS work_items (
                id              TEXT PRIMARY KEY,
                path            TEXT NOT NULL,
                category        TEXT NOT NULL,
                size            INTEGER NOT NULL,
                state           TEXT NOT NULL DEFAULT 'discovered',
                attempt_count   INTEGER NOT NULL DEFAULT 0,
                last_error_kind TEXT,
                last_error      TEXT,
                post_id         TEXT,
                trace_id        TEXT NOT NULL,
                created_at      TEXT NOT NULL,
                updated_at      TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_items_state ON work_items(state);
            CREATE INDEX IF NOT EXISTS idx_items_category ON work_items(category);

            CREATE TABLE IF NOT EXISTS audit (
                seq         INTEGER PRIMARY KEY AUTOINCREMENT,
                item_id     TEXT NOT NULL REFERENCES work_items(id),
                trace_id    TEXT NOT NULL,
                at          TEXT NOT NULL,
                from_state  TEXT NOT NULL,
                to_state    TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_audit_trace ON audit(trace_id, seq);
            ",
        )?;
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        // A poisoned lock means a panic mid-write; the connection itself is
        // still usable and SQLite transactions keep the data consistent.
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    // -----------------------------------------------------------------------
    // Ingestion
    // -----------------------------------------------------------------------

    /// Record a newly discovered file. Idempotent: a second discovery event
    /// for an identity that already has a record (in any state) is a no-op
    /// and returns the existing item, preserving its trace id.
    pub fn create(
        &self,
        id: &FileId,
        path: &Path,
        category: &str,
        size: u64,
    ) -> Result<CreateResult> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;

        if let Some(existing) = get_item_on(&tx, id)? {
            tx.commit()?;
            return Ok(CreateResult::AlreadyExists(existing));
        }

        let now = Utc::now();
        let trace_id = Uuid::new_v4();
        tx.execute(
            "INSERT INTO work_items
                (id, path, category, size, state, attempt_count, trace_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, ?7, ?7)",
            params![
                id.as_str(),
                path.to_string_lossy(),
                category,
                size as i64,
                State::Discovered.as_str(),
                trace_id.to_string(),
                now.to_rfc3339(),
            ],
        )?;
        let item = get_item_on(&tx, id)?.ok_or_else(|| Error::NotFound(id.to_string()))?;
        tx.commit()?;
        Ok(CreateResult::Created(item))
    }

    // -----------------------------------------------------------------------
    // Transitions
    // -----------------------------------------------------------------------

    /// Atomically move an item from `from` to `to`.
    ///
    /// Rejects with [`Error::InvalidTransition`] if the edge is not in the
    /// state machine, and with [`Error::StaleState`] if the item is no
    /// longer in `from` — the caller raced another path and must re-read
    /// rather than overwrite. Every accepted transition bumps `updated_at`
    /// and appends to the audit trail.
    pub fn transition(&self, id: &FileId, from: State, to: State) -> Result<WorkItem> {
        if !from.can_transition_to(to) {
            return Err(Error::InvalidTransition { from, to });
        }

        let mut conn = self.lock();
        let tx = conn.transaction()?;

        let item = get_item_on(&tx, id)?.ok_or_else(|| Error::NotFound(id.to_string()))?;
        if item.state != from {
            return Err(Error::StaleState {
                expected: from,
                actual: item.state,
            });
        }

        let now = Utc::now();
        tx.execute(
            "UPDATE work_items SET state = ?1, updated_at = ?2 WHERE id = ?3",
            params![to.as_str(), now.to_rfc3339(), id.as_str()],
        )?;
        tx.execute(
            "INSERT INTO audit (item_id, trace_id, at, from_state, to_state)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                id.as_str(),
                item.trace_id.to_string(),
                now.to_rfc3339(),
                from.as_str(),
                to.as_str(),
            ],
        )?;

        let updated = get_item_on(&tx, id)?.ok_or_else(|| Error::NotFound(id.to_string()))?;
        tx.commit()?;
        Ok(updated)
    }

    /// Record a failed attempt: increments the attempt counter and stores
    /// the classified error. Returns the new attempt count.
    pub fn record_attempt(&self, id: &FileId, kind: ErrorKind, message: &str) -> Result<u32> {
        let conn = self.lock();
        let now = Utc::now().to_rfc3339();
        let changed = conn.execute(
            "UPDATE work_items
             SET attempt_count = attempt_count + 1,
                 last_error_kind = ?1, last_error = ?2, updated_at = ?3
             WHERE id = ?4",
            params![kind.as_str(), message, now, id.as_str()],
        )?;
        if changed == 0 {
            return Err(Error::NotFound(id.to_string()));
        }
        let count = conn.query_row(
            "SELECT attempt_count FROM work_items WHERE id = ?1",
            params![id.as_str()],
            |row| row.get::<_, u32>(0),
        )?;
        Ok(count)
    }

    /// Store the remote post id after a successful publish.
    pub fn set_post_id(&self, id: &FileId, post_id: &str) -> Result<()> {
        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE work_items SET post_id = ?1, updated_at = ?2 WHERE id = ?3",
            params![post_id, Utc::now().to_rfc3339(), id.as_str()],
        )?;
        if changed == 0 {
            return Err(Error::NotFound(id.to_string()));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Get a work item by id.
    pub fn get(&self, id: &FileId) -> Result<Option<WorkItem>> {
        let conn = self.lock();
        get_item_on(&conn, id)
    }

    /// List work items in a given state, oldest first.
    pub fn list_by_state(&self, state: State) -> Result<Vec<WorkItem>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT * FROM work_items WHERE state = ?1 ORDER BY created_at ASC, id ASC",
        )?;
        let items = stmt
            .query_map(params![state.as_str()], row_to_item)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(items)
    }

    /// Count items per state, for the operator CLI.
    pub fn counts_by_state(&self) -> Result<Vec<(State, u64)>> {
        let conn = self.lock();
        let mut stmt =
            conn.prepare("SELECT state, COUNT(*) FROM work_items GROUP BY state ORDER BY state")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, u64>(1)?))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows
            .into_iter()
            .filter_map(|(s, n)| State::parse(&s).map(|s| (s, n)))
            .collect())
    }

    /// Find items whose id starts with the given prefix, for the CLI.
    pub fn find_by_prefix(&self, prefix: &str) -> Result<Vec<WorkItem>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT * FROM work_items WHERE id LIKE ?1 || '%' ORDER BY created_at ASC",
        )?;
        let items = stmt
            .query_map(params![prefix], row_to_item)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(items)
    }

    /// The audit trail for one trace id, in order.
    pub fn audit_trail(&self, trace_id: Uuid) -> Result<Vec<AuditEntry>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT trace_id, at, from_state, to_state FROM audit
             WHERE trace_id = ?1 ORDER BY seq ASC",
        )?;
        let rows = stmt
            .query_map(params![trace_id.to_string()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut entries = Vec::with_capacity(rows.len());
        for (trace, at, from, to) in rows {
            entries.push(AuditEntry {
                trace_id: trace
                    .parse()
                    .map_err(|e: uuid::Error| Error::Other(e.to_string()))?,
                at: parse_ts(&at)?,
                from: State::parse(&from)
                    .ok_or_else(|| Error::Other(format!("unknown state in audit: {from}")))?,
                to: State::parse(&to)
                    .ok_or_else(|| Error::Other(format!("unknown state in audit: {to}")))?,
            });
        }
        Ok(entries)
    }

    // -----------------------------------------------------------------------
    // Recovery
    // -----------------------------------------------------------------------

    /// Sweep items a previous run left mid-pipeline back to Retrying, so a
    /// restart resumes them instead of losing them. Returns the swept items.
    /// Published items are NOT swept — they already hit the remote and must
    /// be finalized, not re-run.
    pub fn sweep_in_flight(&self) -> Result<Vec<WorkItem>> {
        let mut swept = Vec::new();
        for from in [
            State::Admitted,
            State::Analyzing,
            State::Converting,
            State::Publishing,
        ] {
            for item in self.list_by_state(from)? {
                swept.push(self.transition(&item.id, from, State::Retrying)?);
            }
        }
        Ok(swept)
    }
}

// ---------------------------------------------------------------------------
// Row helpers — accept &Connection so they work inside and outside
// transactions (Transaction derefs to Connection).
// ---------------------------------------------------------------------------

fn get_item_on(conn: &Connection, id: &FileId) -> Result<Option<WorkItem>> {
    conn.query_row(
        "SELECT * FROM work_items WHERE id = ?1",
        params![id.as_str()],
        row_to_item,
    )
    .optional()
    .map_err(Error::from)
}

fn row_to_item(row: &rusqlite::Row) -> std::result::Result<WorkItem, rusqlite::Error> {
    let id: String = row.get("id")?;
    let state: String = row.get("state")?;
    let kind: Option<String> = row.get("last_error_kind")?;
    let trace: String = row.get("trace_id")?;
    let created: String = row.get("created_at")?;
    let updated: String = row.get("updated_at")?;

    Ok(WorkItem {
        id: FileId::from(id),
        path: std::path::PathBuf::from(row.get::<_, String>("path")?),
        category: row.get("category")?,
        size: row.get::<_, i64>("size")? as u64,
        state: State::parse(&state).unwrap_or(State::Failed),
        attempt_count: row.get("attempt_count")?,
        last_error_kind: kind.as_deref().and_then(ErrorKind::parse),
        last_error: row.get("last_error")?,
        post_id: row.get("post_id")?,
        trace_id: trace.parse().unwrap_or_else(|_| Uuid::nil()),
        created_at: parse_ts_or_now(&created),
        updated_at: parse_ts_or_now(&updated),
    })
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Other(format!("bad timestamp {s}: {e}")))
}

fn parse_ts_or_now(s: &str) -> DateTime<Utc> {
    parse_ts(s).unwrap_or_else(|_| Utc::now())
}
