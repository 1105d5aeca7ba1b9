//! Durable State Store
//!
//! Load/save of every entity the agent owns: working-memory blocks,
//! archival entries, conversation turns and the gateway snapshot.
//! Each call is atomic for the entity it touches.

use parking_lot::Mutex as SyncMutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use tracing::info;

use crate::archival::ArchivalEntry;
use crate::clock::{from_millis, to_millis};
use crate::conversation::{ConversationTurn, Role, Salience};
use crate::embeddings::{embedding_from_bytes, embedding_to_bytes};
use crate::error::{Error, Result};
use crate::gateway::GatewaySnapshot;
use crate::working_memory::MemoryBlock;

const META_TURN_SEQUENCE: &str = "turn_sequence";
const META_GATEWAY: &str = "gateway";
const META_SEEN_POSTS: &str = "seen_posts";

/// Persistence collaborator injected into every component
pub trait StateStore: Send + Sync {
    fn save_blocks(&self, blocks: &[MemoryBlock]) -> Result<()>;
    fn load_blocks(&self) -> Result<Vec<MemoryBlock>>;

    fn append_archival(&self, entry: &ArchivalEntry) -> Result<()>;
    fn delete_archival(&self, id: &str) -> Result<bool>;
    fn load_archival(&self) -> Result<Vec<ArchivalEntry>>;

    /// Append a turn and advance the sequence high-water mark
    fn append_turn(&self, turn: &ConversationTurn) -> Result<()>;
    fn delete_turns(&self, sequence_nos: &[u64]) -> Result<()>;
    fn mark_turns_consolidated(&self, sequence_nos: &[u64]) -> Result<()>;
    fn load_turns(&self) -> Result<Vec<ConversationTurn>>;
    /// Highest sequence number ever assigned, 0 if none
    fn last_sequence(&self) -> Result<u64>;

    fn save_gateway(&self, snapshot: &GatewaySnapshot) -> Result<()>;
    fn load_gateway(&self) -> Result<Option<GatewaySnapshot>>;

    /// Feed item ids already shown to the reasoning engine, oldest first
    fn save_seen_posts(&self, ids: &[String]) -> Result<()>;
    fn load_seen_posts(&self) -> Result<Vec<String>>;
}

/// SQLite-backed state store
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create the state database
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::Persistence(format!("create {}: {}", parent.display(), e)))?;
        }

        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;

        info!("State store opened: {}", path.display());
        Ok(store)
    }

    /// In-memory database (tests, dry runs)
    pub fn open_in_memory() -> Result<Self> {
        let store = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Persistence("state store lock poisoned".into()))
    }

    fn init_schema(&self) -> Result<()> {
        self.conn()?.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS blocks (
                name TEXT PRIMARY KEY,
                position INTEGER NOT NULL,
                description TEXT NOT NULL,
                content TEXT NOT NULL,
                char_limit INTEGER NOT NULL,
                last_modified INTEGER NOT NULL,
                salient TEXT NOT NULL DEFAULT '[]'
            );

            CREATE TABLE IF NOT EXISTS archival (
                id TEXT PRIMARY KEY,
                text TEXT NOT NULL,
                tags TEXT NOT NULL DEFAULT '[]',
                importance REAL NOT NULL,
                embedding BLOB NOT NULL,
                content_hash TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_archival_hash ON archival(content_hash);
            CREATE INDEX IF NOT EXISTS idx_archival_created ON archival(created_at DESC);

            CREATE TABLE IF NOT EXISTS turns (
                sequence_no INTEGER PRIMARY KEY,
                role TEXT NOT NULL CHECK(role IN ('agent', 'environment', 'tool')),
                content TEXT NOT NULL,
                salience TEXT NOT NULL,
                consolidated INTEGER NOT NULL DEFAULT 0,
                timestamp INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            "#,
        )?;
        Ok(())
    }
}

impl StateStore for SqliteStore {
    fn save_blocks(&self, blocks: &[MemoryBlock]) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM blocks", [])?;
        for (position, block) in blocks.iter().enumerate() {
            tx.execute(
                "INSERT INTO blocks (name, position, description, content, char_limit, last_modified, salient)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    block.name,
                    position as i64,
                    block.description,
                    block.content,
                    block.char_limit as i64,
                    to_millis(block.last_modified),
                    serde_json::to_string(&block.salient)?,
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn load_blocks(&self) -> Result<Vec<MemoryBlock>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT name, description, content, char_limit, last_modified, salient
             FROM blocks ORDER BY position",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(name, description, content, char_limit, modified, salient)| {
                Ok(MemoryBlock {
                    name,
                    description,
                    content,
                    char_limit: char_limit as usize,
                    last_modified: from_millis(modified)?,
                    salient: serde_json::from_str(&salient)?,
                })
            })
            .collect()
    }

    fn append_archival(&self, entry: &ArchivalEntry) -> Result<()> {
        self.conn()?.execute(
            "INSERT INTO archival (id, text, tags, importance, embedding, content_hash, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                entry.id,
                entry.text,
                serde_json::to_string(&entry.tags)?,
                entry.importance as f64,
                embedding_to_bytes(&entry.embedding),
                entry.content_hash,
                to_millis(entry.created_at),
            ],
        )?;
        Ok(())
    }

    fn delete_archival(&self, id: &str) -> Result<bool> {
        let rows = self.conn()?.execute("DELETE FROM archival WHERE id = ?1", params![id])?;
        Ok(rows > 0)
    }

    fn load_archival(&self) -> Result<Vec<ArchivalEntry>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, text, tags, importance, embedding, content_hash, created_at
             FROM archival ORDER BY created_at, rowid",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, f64>(3)?,
                    row.get::<_, Vec<u8>>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, i64>(6)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(id, text, tags, importance, embedding, content_hash, created_at)| {
                Ok(ArchivalEntry {
                    id,
                    text,
                    tags: serde_json::from_str(&tags)?,
                    importance: importance as f32,
                    embedding: embedding_from_bytes(&embedding),
                    content_hash,
                    created_at: from_millis(created_at)?,
                })
            })
            .collect()
    }

    fn append_turn(&self, turn: &ConversationTurn) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO turns (sequence_no, role, content, salience, consolidated, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                turn.sequence_no as i64,
                turn.role.as_str(),
                turn.content,
                turn.salience.as_str(),
                turn.consolidated,
                to_millis(turn.timestamp),
            ],
        )?;
        tx.execute(
            "INSERT INTO meta (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = MAX(CAST(value AS INTEGER), CAST(excluded.value AS INTEGER))",
            params![META_TURN_SEQUENCE, turn.sequence_no.to_string()],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn delete_turns(&self, sequence_nos: &[u64]) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        for seq in sequence_nos {
            tx.execute("DELETE FROM turns WHERE sequence_no = ?1", params![*seq as i64])?;
        }
        tx.commit()?;
        Ok(())
    }

    fn mark_turns_consolidated(&self, sequence_nos: &[u64]) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        for seq in sequence_nos {
            tx.execute(
                "UPDATE turns SET consolidated = 1 WHERE sequence_no = ?1",
                params![*seq as i64],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn load_turns(&self) -> Result<Vec<ConversationTurn>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT sequence_no, role, content, salience, consolidated, timestamp
             FROM turns ORDER BY sequence_no",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, bool>(4)?,
                    row.get::<_, i64>(5)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(seq, role, content, salience, consolidated, timestamp)| {
                Ok(ConversationTurn {
                    sequence_no: seq as u64,
                    role: Role::parse(&role)
                        .ok_or_else(|| Error::Persistence(format!("unknown role: {}", role)))?,
                    content,
                    timestamp: from_millis(timestamp)?,
                    salience: Salience::parse(&salience)
                        .ok_or_else(|| Error::Persistence(format!("unknown salience: {}", salience)))?,
                    consolidated,
                })
            })
            .collect()
    }

    fn last_sequence(&self) -> Result<u64> {
        let conn = self.conn()?;
        let value: Option<String> = conn
            .query_row(
                "SELECT value FROM meta WHERE key = ?1",
                params![META_TURN_SEQUENCE],
                |row| row.get(0),
            )
            .optional()?;
        match value {
            Some(v) => v
                .parse()
                .map_err(|_| Error::Persistence(format!("corrupt turn sequence: {}", v))),
            None => Ok(0),
        }
    }

    fn save_gateway(&self, snapshot: &GatewaySnapshot) -> Result<()> {
        let json = serde_json::to_string(snapshot)?;
        self.conn()?.execute(
            "INSERT INTO meta (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![META_GATEWAY, json],
        )?;
        Ok(())
    }

    fn load_gateway(&self) -> Result<Option<GatewaySnapshot>> {
        let conn = self.conn()?;
        let value: Option<String> = conn
            .query_row("SELECT value FROM meta WHERE key = ?1", params![META_GATEWAY], |row| {
                row.get(0)
            })
            .optional()?;
        match value {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    fn save_seen_posts(&self, ids: &[String]) -> Result<()> {
        let json = serde_json::to_string(ids)?;
        self.conn()?.execute(
            "INSERT INTO meta (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![META_SEEN_POSTS, json],
        )?;
        Ok(())
    }

    fn load_seen_posts(&self) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let value: Option<String> = conn
            .query_row("SELECT value FROM meta WHERE key = ?1", params![META_SEEN_POSTS], |row| {
                row.get(0)
            })
            .optional()?;
        match value {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Ok(Vec::new()),
        }
    }
}

#[derive(Default)]
struct MemoryState {
    blocks: Vec<MemoryBlock>,
    archival: Vec<ArchivalEntry>,
    turns: BTreeMap<u64, ConversationTurn>,
    last_sequence: u64,
    gateway: Option<GatewaySnapshot>,
    seen_posts: Vec<String>,
}

/// Process-local state store
///
/// Same contract as [`SqliteStore`] without durability across restarts.
/// Writes can be made to fail to simulate a storage outage.
#[derive(Default)]
pub struct InMemoryStore {
    state: SyncMutex<MemoryState>,
    fail_writes: AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail with a persistence error
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::Persistence("store unavailable".into()));
        }
        Ok(())
    }
}

impl StateStore for InMemoryStore {
    fn save_blocks(&self, blocks: &[MemoryBlock]) -> Result<()> {
        self.check_writable()?;
        self.state.lock().blocks = blocks.to_vec();
        Ok(())
    }

    fn load_blocks(&self) -> Result<Vec<MemoryBlock>> {
        Ok(self.state.lock().blocks.clone())
    }

    fn append_archival(&self, entry: &ArchivalEntry) -> Result<()> {
        self.check_writable()?;
        let mut state = self.state.lock();
        if state.archival.iter().any(|e| e.id == entry.id) {
            return Err(Error::Persistence(format!("duplicate archival id {}", entry.id)));
        }
        state.archival.push(entry.clone());
        Ok(())
    }

    fn delete_archival(&self, id: &str) -> Result<bool> {
        self.check_writable()?;
        let mut state = self.state.lock();
        let before = state.archival.len();
        state.archival.retain(|e| e.id != id);
        Ok(state.archival.len() < before)
    }

    fn load_archival(&self) -> Result<Vec<ArchivalEntry>> {
        Ok(self.state.lock().archival.clone())
    }

    fn append_turn(&self, turn: &ConversationTurn) -> Result<()> {
        self.check_writable()?;
        let mut state = self.state.lock();
        state.turns.insert(turn.sequence_no, turn.clone());
        state.last_sequence = state.last_sequence.max(turn.sequence_no);
        Ok(())
    }

    fn delete_turns(&self, sequence_nos: &[u64]) -> Result<()> {
        self.check_writable()?;
        let mut state = self.state.lock();
        for seq in sequence_nos {
            state.turns.remove(seq);
        }
        Ok(())
    }

    fn mark_turns_consolidated(&self, sequence_nos: &[u64]) -> Result<()> {
        self.check_writable()?;
        let mut state = self.state.lock();
        for seq in sequence_nos {
            if let Some(turn) = state.turns.get_mut(seq) {
                turn.consolidated = true;
            }
        }
        Ok(())
    }

    fn load_turns(&self) -> Result<Vec<ConversationTurn>> {
        Ok(self.state.lock().turns.values().cloned().collect())
    }

    fn last_sequence(&self) -> Result<u64> {
        Ok(self.state.lock().last_sequence)
    }

    fn save_gateway(&self, snapshot: &GatewaySnapshot) -> Result<()> {
        self.check_writable()?;
        self.state.lock().gateway = Some(snapshot.clone());
        Ok(())
    }

    fn load_gateway(&self) -> Result<Option<GatewaySnapshot>> {
        Ok(self.state.lock().gateway.clone())
    }

    fn save_seen_posts(&self, ids: &[String]) -> Result<()> {
        self.check_writable()?;
        self.state.lock().seen_posts = ids.to_vec();
        Ok(())
    }

    fn load_seen_posts(&self) -> Result<Vec<String>> {
        Ok(self.state.lock().seen_posts.clone())
    }
}
