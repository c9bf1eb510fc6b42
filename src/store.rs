//! Session and message persistence.
//!
//! SQLite via rusqlite, one connection behind a mutex. All writes for a
//! session are routed through the session runtime, so the store itself only
//! needs to guarantee durability and monotonic message ids; `AUTOINCREMENT`
//! gives ids that grow monotonically within (and across) sessions and are
//! never reused after deletes.
//!
//! The message log is the only conversation state in the system. Restores,
//! reconnects and model-context rebuilds all read it; nothing keeps a
//! parallel in-memory history.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;

use crate::profile::DatasetProfile;
use crate::types::{MessageKind, MessageRole, SessionId, SessionMeta, StoredMessage, UserId};
use crate::{Error, Result};

/// A session row joined with its cached dataset profile.
#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub meta: SessionMeta,
    pub file_path: String,
    pub profile: DatasetProfile,
}

/// Thread-safe store handle.
pub struct MessageStore {
    conn: Mutex<Connection>,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS sessions (
    id           TEXT PRIMARY KEY,
    user_id      TEXT NOT NULL,
    title        TEXT,
    filename     TEXT NOT NULL,
    file_path    TEXT NOT NULL,
    profile_json TEXT NOT NULL,
    created_at   TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS messages (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id   TEXT NOT NULL,
    role         TEXT NOT NULL,
    kind         TEXT NOT NULL,
    body         TEXT NOT NULL,
    payload_json TEXT,
    created_at   TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_messages_session ON messages(session_id, id);
CREATE INDEX IF NOT EXISTS idx_sessions_user ON sessions(user_id);
";

impl MessageStore {
    /// Open (or create) the store at `path` and initialize the schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        conn.execute_batch("PRAGMA journal_mode=WAL;").ok();
        conn.execute_batch(SCHEMA)?;
        Ok(MessageStore { conn: Mutex::new(conn) })
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(MessageStore { conn: Mutex::new(conn) })
    }

    // ── Sessions ─────────────────────────────────────────────────────────

    /// Record a freshly uploaded session.
    pub fn register_session(
        &self,
        meta: &SessionMeta,
        file_path: &str,
        profile: &DatasetProfile,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO sessions (id, user_id, title, filename, file_path, profile_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                meta.id,
                meta.user_id,
                meta.title,
                meta.filename,
                file_path,
                serde_json::to_string(profile)?,
                meta.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Fetch a session owned by `user_id`. Non-owners see nothing.
    pub fn get_session(&self, user_id: &UserId, session_id: &SessionId) -> Result<Option<SessionRecord>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, user_id, title, filename, file_path, profile_json, created_at
             FROM sessions WHERE id = ?1 AND user_id = ?2",
            params![session_id, user_id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                ))
            },
        )
        .optional()?
        .map(|(id, user_id, title, filename, file_path, profile_json, created_at)| -> Result<SessionRecord> {
            Ok(SessionRecord {
                meta: SessionMeta {
                    id,
                    user_id,
                    title,
                    filename,
                    created_at: parse_timestamp(&created_at)?,
                },
                file_path,
                profile: serde_json::from_str(&profile_json)?,
            })
        })
        .transpose()
    }

    /// Sessions owned by `user_id`, most recent first.
    pub fn list_sessions(&self, user_id: &UserId) -> Result<Vec<SessionMeta>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, user_id, title, filename, created_at
             FROM sessions WHERE user_id = ?1
             ORDER BY created_at DESC, rowid DESC",
        )?;
        let rows = stmt.query_map(params![user_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (id, user_id, title, filename, created_at) = row?;
            out.push(SessionMeta {
                id,
                user_id,
                title,
                filename,
                created_at: parse_timestamp(&created_at)?,
            });
        }
        Ok(out)
    }

    /// Delete a session and its messages in one transaction.
    ///
    /// Returns `true` when a row was deleted; a repeat call returns `false`.
    pub fn delete_session(&self, user_id: &UserId, session_id: &SessionId) -> Result<bool> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let deleted = tx.execute(
            "DELETE FROM sessions WHERE id = ?1 AND user_id = ?2",
            params![session_id, user_id],
        )?;
        if deleted > 0 {
            tx.execute("DELETE FROM messages WHERE session_id = ?1", params![session_id])?;
        }
        tx.commit()?;
        Ok(deleted > 0)
    }

    pub fn set_title(&self, session_id: &SessionId, title: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE sessions SET title = ?2 WHERE id = ?1",
            params![session_id, title],
        )?;
        Ok(())
    }

    pub fn get_title(&self, session_id: &SessionId) -> Result<Option<String>> {
        let conn = self.conn.lock();
        let title = conn
            .query_row(
                "SELECT title FROM sessions WHERE id = ?1",
                params![session_id],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()?
            .flatten();
        Ok(title)
    }

    // ── Messages ─────────────────────────────────────────────────────────

    /// Append one message; returns its monotonic id.
    pub fn append(
        &self,
        session_id: &SessionId,
        role: MessageRole,
        kind: MessageKind,
        body: &str,
        payload: Option<&serde_json::Value>,
    ) -> Result<i64> {
        let payload_json = payload.map(serde_json::to_string).transpose()?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO messages (session_id, role, kind, body, payload_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                session_id,
                role.as_str(),
                kind.as_str(),
                body,
                payload_json,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// All messages of a session in insertion order (model-context replay).
    pub fn list_messages(&self, session_id: &SessionId) -> Result<Vec<StoredMessage>> {
        self.query_messages(session_id, false)
    }

    /// Messages returned on session restore: `query_result` and `internal`
    /// kinds are excluded.
    pub fn restore_messages(&self, session_id: &SessionId) -> Result<Vec<StoredMessage>> {
        self.query_messages(session_id, true)
    }

    fn query_messages(&self, session_id: &SessionId, restore_only: bool) -> Result<Vec<StoredMessage>> {
        let conn = self.conn.lock();
        let sql = if restore_only {
            "SELECT id, role, kind, body, payload_json, created_at FROM messages
             WHERE session_id = ?1 AND kind NOT IN ('query_result', 'internal')
             ORDER BY id ASC"
        } else {
            "SELECT id, role, kind, body, payload_json, created_at FROM messages
             WHERE session_id = ?1 ORDER BY id ASC"
        };
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params![session_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (id, role, kind, body, payload_json, created_at) = row?;
            out.push(StoredMessage {
                id,
                role: MessageRole::parse(&role)?,
                kind: MessageKind::parse(&kind)?,
                body,
                payload: payload_json.as_deref().map(serde_json::from_str).transpose()?,
                created_at: parse_timestamp(&created_at)?,
            });
        }
        Ok(out)
    }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::other(format!("bad stored timestamp {raw:?}: {e}")))
}
