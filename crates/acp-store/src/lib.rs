//! # acp-store
//!
//! Per-identity SQLite store. Each identity gets its own database file with
//! four tables whose names are suffixed with the hex MD5 of the agent id:
//! `messages_<h>`, `conversation_<h>`, `chat_config_<h>`, `friend_<h>`.
//! The runtime depends on the message insert/update/get operations, session
//! rows (whose `identifying_code` lets an owner rejoin), and the friend
//! list; everything runs behind an `r2d2` pool with WAL pragmas.

mod connection;

use md5::{Digest, Md5};
use rusqlite::{OptionalExtension, params};
use tracing::debug;

use acp_core::blocks::unix_millis;
use acp_core::errors::PersistenceError;

pub use connection::{ConnectionConfig, ConnectionPool, PooledConnection};

/// One row of the per-identity message table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageRow {
    /// Rowid.
    pub id: i64,
    /// Application-level message id.
    pub message_id: String,
    /// Session the message belongs to.
    pub session_id: String,
    /// `user` for sent, `assistant` for received.
    pub role: String,
    /// The authoring identity.
    pub message_aid: String,
    /// Reply-threading reference.
    pub parent_message_id: String,
    /// Comma-joined receivers.
    pub to_aids: String,
    /// JSON-encoded block array.
    pub content: String,
    /// JSON-encoded instruction, empty when absent.
    pub instruction: String,
    /// Payload kind, usually `text`.
    pub kind: String,
    /// Delivery status (`sent`, `success`, ...).
    pub status: String,
    /// Unix-millisecond insert time.
    pub timestamp: i64,
}

/// One row of the per-identity conversation table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConversationRow {
    /// Rowid.
    pub id: i64,
    /// Server-assigned session id.
    pub session_id: String,
    /// Owner secret; empty for joined sessions.
    pub identifying_code: String,
    /// The identity owning this row.
    pub main_aid: String,
    /// Display name.
    pub name: String,
    /// Session kind.
    pub kind: String,
    /// Unix-millisecond insert time.
    pub timestamp: i64,
}

/// One row of the per-identity friend table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FriendRow {
    /// The friend's identity.
    pub aid: String,
    /// Display name.
    pub name: String,
    /// Avatar URL.
    pub avatar_url: String,
    /// Free-form description.
    pub description: String,
}

/// Hex MD5 of an agent id, used as the table-name suffix.
#[must_use]
pub fn table_suffix(agent_id: &str) -> String {
    let digest = Md5::digest(agent_id.as_bytes());
    let mut out = String::with_capacity(32);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Per-identity store handle.
pub struct Store {
    pool: ConnectionPool,
    agent_id: String,
    messages: String,
    conversations: String,
    chat_config: String,
    friends: String,
}

type StoreResult<T> = Result<T, PersistenceError>;

fn db_err(table: &str, operation: &str, e: &rusqlite::Error) -> PersistenceError {
    PersistenceError::new(table, operation, e.to_string())
}

impl Store {
    /// Open (and migrate) the store at `path`.
    pub fn open(path: &str, agent_id: &str) -> StoreResult<Self> {
        let pool = connection::new_file(path, &ConnectionConfig::default())
            .map_err(|e| PersistenceError::new("pool", "open", e.to_string()))?;
        Self::with_pool(pool, agent_id)
    }

    /// In-memory store, for tests.
    pub fn in_memory(agent_id: &str) -> StoreResult<Self> {
        let config = ConnectionConfig {
            // A shared cache would still give distinct databases per
            // connection for `:memory:`; keep the pool at one connection.
            pool_size: 1,
            ..Default::default()
        };
        let pool = connection::new_in_memory(&config)
            .map_err(|e| PersistenceError::new("pool", "open", e.to_string()))?;
        Self::with_pool(pool, agent_id)
    }

    fn with_pool(pool: ConnectionPool, agent_id: &str) -> StoreResult<Self> {
        let suffix = table_suffix(agent_id);
        let store = Self {
            pool,
            agent_id: agent_id.to_owned(),
            messages: format!("messages_{suffix}"),
            conversations: format!("conversation_{suffix}"),
            chat_config: format!("chat_config_{suffix}"),
            friends: format!("friend_{suffix}"),
        };
        store.migrate()?;
        Ok(store)
    }

    fn conn(&self) -> StoreResult<PooledConnection> {
        self.pool
            .get()
            .map_err(|e| PersistenceError::new("pool", "acquire", e.to_string()))
    }

    fn migrate(&self) -> StoreResult<()> {
        let conn = self.conn()?;
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {m} (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 message_id TEXT NOT NULL,
                 session_id TEXT NOT NULL,
                 role TEXT NOT NULL,
                 message_aid TEXT NOT NULL DEFAULT '',
                 parent_message_id TEXT NOT NULL DEFAULT '',
                 to_aids TEXT NOT NULL DEFAULT '',
                 content TEXT NOT NULL DEFAULT '',
                 instruction TEXT NOT NULL DEFAULT '',
                 type TEXT NOT NULL DEFAULT 'text',
                 status TEXT NOT NULL DEFAULT '',
                 timestamp INTEGER NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_{m}_session_message
                 ON {m}(session_id, message_id);
             CREATE TABLE IF NOT EXISTS {c} (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 session_id TEXT NOT NULL UNIQUE,
                 identifying_code TEXT NOT NULL DEFAULT '',
                 main_aid TEXT NOT NULL,
                 name TEXT NOT NULL DEFAULT '',
                 type TEXT NOT NULL DEFAULT 'public',
                 timestamp INTEGER NOT NULL
             );
             CREATE TABLE IF NOT EXISTS {cc} (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 session_id TEXT NOT NULL,
                 aid TEXT NOT NULL,
                 avaurl TEXT NOT NULL DEFAULT '',
                 description TEXT NOT NULL DEFAULT '',
                 post_data TEXT NOT NULL DEFAULT ''
             );
             CREATE TABLE IF NOT EXISTS {f} (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 aid TEXT NOT NULL UNIQUE,
                 name TEXT NOT NULL DEFAULT '',
                 avaurl TEXT NOT NULL DEFAULT '',
                 description TEXT NOT NULL DEFAULT ''
             );",
            m = self.messages,
            c = self.conversations,
            cc = self.chat_config,
            f = self.friends,
        );
        conn.execute_batch(&ddl)
            .map_err(|e| db_err(&self.messages, "migrate", &e))?;
        debug!(agent_id = %self.agent_id, "store migrated");
        Ok(())
    }

    // ── messages ────────────────────────────────────────────────────────────

    /// Insert a message row.
    #[allow(clippy::too_many_arguments)]
    pub fn insert_message(
        &self,
        role: &str,
        session_id: &str,
        message_aid: &str,
        parent_message_id: &str,
        to_aids: &str,
        instruction: &str,
        content: &str,
        kind: &str,
        status: &str,
        message_id: &str,
    ) -> StoreResult<i64> {
        let conn = self.conn()?;
        let sql = format!(
            "INSERT INTO {} (message_id, session_id, role, message_aid, parent_message_id,
                             to_aids, content, instruction, type, status, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            self.messages
        );
        let timestamp = i64::try_from(unix_millis()).unwrap_or(i64::MAX);
        let _ = conn
            .execute(
                &sql,
                params![
                    message_id,
                    session_id,
                    role,
                    message_aid,
                    parent_message_id,
                    to_aids,
                    content,
                    instruction,
                    kind,
                    status,
                    timestamp
                ],
            )
            .map_err(|e| db_err(&self.messages, "insert", &e))?;
        Ok(conn.last_insert_rowid())
    }

    /// Replace the content (and optionally status) of an existing message.
    pub fn update_message_content(
        &self,
        session_id: &str,
        message_id: &str,
        content: &str,
        status: Option<&str>,
    ) -> StoreResult<usize> {
        let conn = self.conn()?;
        let changed = match status {
            Some(status) => conn
                .execute(
                    &format!(
                        "UPDATE {} SET content = ?1, status = ?2
                         WHERE session_id = ?3 AND message_id = ?4",
                        self.messages
                    ),
                    params![content, status, session_id, message_id],
                )
                .map_err(|e| db_err(&self.messages, "update", &e))?,
            None => conn
                .execute(
                    &format!(
                        "UPDATE {} SET content = ?1
                         WHERE session_id = ?2 AND message_id = ?3",
                        self.messages
                    ),
                    params![content, session_id, message_id],
                )
                .map_err(|e| db_err(&self.messages, "update", &e))?,
        };
        Ok(changed)
    }

    fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRow> {
        Ok(MessageRow {
            id: row.get(0)?,
            message_id: row.get(1)?,
            session_id: row.get(2)?,
            role: row.get(3)?,
            message_aid: row.get(4)?,
            parent_message_id: row.get(5)?,
            to_aids: row.get(6)?,
            content: row.get(7)?,
            instruction: row.get(8)?,
            kind: row.get(9)?,
            status: row.get(10)?,
            timestamp: row.get(11)?,
        })
    }

    const MESSAGE_COLUMNS: &'static str = "id, message_id, session_id, role, message_aid,
        parent_message_id, to_aids, content, instruction, type, status, timestamp";

    /// Fetch one message by session and message id.
    pub fn get_message_by_id(
        &self,
        session_id: &str,
        message_id: &str,
    ) -> StoreResult<Option<MessageRow>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM {} WHERE session_id = ?1 AND message_id = ?2 LIMIT 1",
            Self::MESSAGE_COLUMNS,
            self.messages
        );
        conn.query_row(&sql, params![session_id, message_id], Self::row_to_message)
            .optional()
            .map_err(|e| db_err(&self.messages, "query", &e))
    }

    /// Page through a session's messages, newest last.
    pub fn message_list(
        &self,
        session_id: &str,
        page: u32,
        page_size: u32,
    ) -> StoreResult<Vec<MessageRow>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM {} WHERE session_id = ?1
             ORDER BY id ASC LIMIT ?2 OFFSET ?3",
            Self::MESSAGE_COLUMNS,
            self.messages
        );
        let offset = page.saturating_sub(1) * page_size;
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| db_err(&self.messages, "query", &e))?;
        let rows = stmt
            .query_map(params![session_id, page_size, offset], Self::row_to_message)
            .map_err(|e| db_err(&self.messages, "query", &e))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| db_err(&self.messages, "query", &e))
    }

    // ── conversations ───────────────────────────────────────────────────────

    /// Create a session row if it does not exist yet.
    pub fn create_session(
        &self,
        session_id: &str,
        identifying_code: &str,
        name: &str,
        kind: &str,
    ) -> StoreResult<()> {
        let conn = self.conn()?;
        let sql = format!(
            "INSERT OR IGNORE INTO {} (session_id, identifying_code, main_aid, name, type, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            self.conversations
        );
        let timestamp = i64::try_from(unix_millis()).unwrap_or(i64::MAX);
        let _ = conn
            .execute(
                &sql,
                params![
                    session_id,
                    identifying_code,
                    self.agent_id,
                    name,
                    kind,
                    timestamp
                ],
            )
            .map_err(|e| db_err(&self.conversations, "insert", &e))?;
        Ok(())
    }

    fn row_to_conversation(row: &rusqlite::Row<'_>) -> rusqlite::Result<ConversationRow> {
        Ok(ConversationRow {
            id: row.get(0)?,
            session_id: row.get(1)?,
            identifying_code: row.get(2)?,
            main_aid: row.get(3)?,
            name: row.get(4)?,
            kind: row.get(5)?,
            timestamp: row.get(6)?,
        })
    }

    /// Fetch one session row.
    pub fn get_conversation_by_id(&self, session_id: &str) -> StoreResult<Option<ConversationRow>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT id, session_id, identifying_code, main_aid, name, type, timestamp
             FROM {} WHERE session_id = ?1 LIMIT 1",
            self.conversations
        );
        conn.query_row(&sql, params![session_id], Self::row_to_conversation)
            .optional()
            .map_err(|e| db_err(&self.conversations, "query", &e))
    }

    /// The owner's identifying code for `session_id`, if this identity
    /// created the session. Used to rebuild session state after a restart.
    pub fn load_session_history(&self, session_id: &str) -> StoreResult<Option<String>> {
        Ok(self
            .get_conversation_by_id(session_id)?
            .map(|row| row.identifying_code))
    }

    /// Page through session rows, newest first.
    pub fn conversation_list(&self, page: u32, page_size: u32) -> StoreResult<Vec<ConversationRow>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT id, session_id, identifying_code, main_aid, name, type, timestamp
             FROM {} ORDER BY id DESC LIMIT ?1 OFFSET ?2",
            self.conversations
        );
        let offset = page.saturating_sub(1) * page_size;
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| db_err(&self.conversations, "query", &e))?;
        let rows = stmt
            .query_map(params![page_size, offset], Self::row_to_conversation)
            .map_err(|e| db_err(&self.conversations, "query", &e))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| db_err(&self.conversations, "query", &e))
    }

    /// Delete a session row and its messages.
    pub fn delete_session(&self, session_id: &str) -> StoreResult<()> {
        let conn = self.conn()?;
        let _ = conn
            .execute(
                &format!("DELETE FROM {} WHERE session_id = ?1", self.conversations),
                params![session_id],
            )
            .map_err(|e| db_err(&self.conversations, "delete", &e))?;
        let _ = conn
            .execute(
                &format!("DELETE FROM {} WHERE session_id = ?1", self.messages),
                params![session_id],
            )
            .map_err(|e| db_err(&self.messages, "delete", &e))?;
        Ok(())
    }

    // ── membership and friends ──────────────────────────────────────────────

    /// Record an invited member for a session.
    pub fn record_invite(&self, session_id: &str, aid: &str) -> StoreResult<()> {
        let conn = self.conn()?;
        let _ = conn
            .execute(
                &format!(
                    "INSERT INTO {} (session_id, aid) VALUES (?1, ?2)",
                    self.chat_config
                ),
                params![session_id, aid],
            )
            .map_err(|e| db_err(&self.chat_config, "insert", &e))?;
        Ok(())
    }

    /// Member identities recorded for a session.
    pub fn session_member_list(&self, session_id: &str) -> StoreResult<Vec<String>> {
        let conn = self.conn()?;
        let sql = format!("SELECT aid FROM {} WHERE session_id = ?1", self.chat_config);
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| db_err(&self.chat_config, "query", &e))?;
        let rows = stmt
            .query_map(params![session_id], |row| row.get::<_, String>(0))
            .map_err(|e| db_err(&self.chat_config, "query", &e))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| db_err(&self.chat_config, "query", &e))
    }

    /// Add or replace a friend entry.
    pub fn add_friend(
        &self,
        aid: &str,
        name: &str,
        avatar_url: &str,
        description: &str,
    ) -> StoreResult<()> {
        let conn = self.conn()?;
        let _ = conn
            .execute(
                &format!(
                    "INSERT OR REPLACE INTO {} (aid, name, avaurl, description)
                     VALUES (?1, ?2, ?3, ?4)",
                    self.friends
                ),
                params![aid, name, avatar_url, description],
            )
            .map_err(|e| db_err(&self.friends, "insert", &e))?;
        Ok(())
    }

    /// Remove a friend entry; returns whether it existed.
    pub fn delete_friend(&self, aid: &str) -> StoreResult<bool> {
        let conn = self.conn()?;
        let changed = conn
            .execute(
                &format!("DELETE FROM {} WHERE aid = ?1", self.friends),
                params![aid],
            )
            .map_err(|e| db_err(&self.friends, "delete", &e))?;
        Ok(changed > 0)
    }

    /// All friend entries.
    pub fn friend_list(&self) -> StoreResult<Vec<FriendRow>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT aid, name, avaurl, description FROM {} ORDER BY id ASC",
            self.friends
        );
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| db_err(&self.friends, "query", &e))?;
        let rows = stmt
            .query_map([], |row| {
                Ok(FriendRow {
                    aid: row.get(0)?,
                    name: row.get(1)?,
                    avatar_url: row.get(2)?,
                    description: row.get(3)?,
                })
            })
            .map_err(|e| db_err(&self.friends, "query", &e))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| db_err(&self.friends, "query", &e))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
