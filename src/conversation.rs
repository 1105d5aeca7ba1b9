//! Conversation Log
//!
//! Bounded, ordered history of exchanges. Sequence numbers are assigned
//! from a persisted high-water mark and are never reused, even after the
//! turns carrying them are evicted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, info};

use crate::clock::Clock;
use crate::error::Result;
use crate::store::StateStore;

/// Default number of turns kept (N)
const DEFAULT_CAPACITY: usize = 50;

/// Default number of turns evicted at once
const DEFAULT_EVICTION_BATCH: usize = 10;

/// Who produced a turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Agent,
    Environment,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Agent => "agent",
            Role::Environment => "environment",
            Role::Tool => "tool",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "agent" => Some(Role::Agent),
            "environment" => Some(Role::Environment),
            "tool" => Some(Role::Tool),
            _ => None,
        }
    }
}

/// How much a turn is worth keeping
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Salience {
    /// No lasting value, may be discarded on consolidation
    Ephemeral,
    Normal,
    /// Must reach archival memory before eviction
    Important,
}

impl Salience {
    pub fn as_str(&self) -> &'static str {
        match self {
            Salience::Ephemeral => "ephemeral",
            Salience::Normal => "normal",
            Salience::Important => "important",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ephemeral" => Some(Salience::Ephemeral),
            "normal" => Some(Salience::Normal),
            "important" => Some(Salience::Important),
            _ => None,
        }
    }
}

/// A single recorded exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub sequence_no: u64,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub salience: Salience,
    /// Absorbed into archival memory, safe to evict
    pub consolidated: bool,
}

/// Conversation log limits
#[derive(Debug, Clone)]
pub struct ConversationConfig {
    /// Maximum turns retained (N)
    pub capacity: usize,
    /// Oldest turns removed per eviction
    pub eviction_batch: usize,
    /// Turn content is truncated to this many chars
    pub max_turn_chars: usize,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            eviction_batch: DEFAULT_EVICTION_BATCH,
            max_turn_chars: 2000,
        }
    }
}

/// Bounded exchange history
pub struct ConversationLog {
    turns: VecDeque<ConversationTurn>,
    next_sequence: u64,
    config: ConversationConfig,
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
}

impl ConversationLog {
    pub fn open(config: ConversationConfig, store: Arc<dyn StateStore>, clock: Arc<dyn Clock>) -> Result<Self> {
        let mut turns = store.load_turns()?;
        turns.sort_by_key(|t| t.sequence_no);

        let high_water = store
            .last_sequence()?
            .max(turns.last().map(|t| t.sequence_no).unwrap_or(0));

        info!("Conversation log opened: {} turns, next sequence {}", turns.len(), high_water + 1);
        Ok(Self {
            turns: turns.into(),
            next_sequence: high_water + 1,
            config,
            store,
            clock,
        })
    }

    /// Append a turn, returning its sequence number
    pub fn append(&mut self, role: Role, content: &str, salience: Salience) -> Result<u64> {
        let content: String = content.chars().take(self.config.max_turn_chars).collect();
        let turn = ConversationTurn {
            sequence_no: self.next_sequence,
            role,
            content,
            timestamp: self.clock.now(),
            salience,
            consolidated: false,
        };

        self.store.append_turn(&turn)?;
        self.next_sequence += 1;

        debug!("Recorded {} turn #{} ({})", role.as_str(), turn.sequence_no, salience.as_str());
        let seq = turn.sequence_no;
        self.turns.push_back(turn);
        Ok(seq)
    }

    /// Last `n` turns in chronological order
    pub fn recent(&self, n: usize) -> Vec<&ConversationTurn> {
        let skip = self.turns.len().saturating_sub(n);
        self.turns.iter().skip(skip).collect()
    }

    /// Case-insensitive substring match, newest first
    pub fn search(&self, query: &str) -> Vec<&ConversationTurn> {
        let needle = query.trim().to_lowercase();
        if needle.is_empty() {
            return Vec::new();
        }
        self.turns
            .iter()
            .rev()
            .filter(|t| t.content.to_lowercase().contains(&needle))
            .collect()
    }

    pub fn get(&self, sequence_no: u64) -> Option<&ConversationTurn> {
        self.turns.iter().find(|t| t.sequence_no == sequence_no)
    }

    /// Turns not yet absorbed into archival memory
    pub fn unconsolidated(&self) -> Vec<&ConversationTurn> {
        self.turns.iter().filter(|t| !t.consolidated).collect()
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.config.capacity
    }

    pub fn needs_eviction(&self) -> bool {
        self.turns.len() > self.config.capacity
    }

    /// Oldest batch to remove: the overflow, rounded up to the batch size
    pub fn eviction_batch(&self) -> Vec<ConversationTurn> {
        if !self.needs_eviction() {
            return Vec::new();
        }
        let overflow = self.turns.len() - self.config.capacity;
        let count = overflow.max(self.config.eviction_batch).min(self.turns.len());
        self.turns.iter().take(count).cloned().collect()
    }

    pub fn mark_consolidated(&mut self, sequence_nos: &[u64]) -> Result<()> {
        if sequence_nos.is_empty() {
            return Ok(());
        }
        self.store.mark_turns_consolidated(sequence_nos)?;
        for turn in self.turns.iter_mut() {
            if sequence_nos.contains(&turn.sequence_no) {
                turn.consolidated = true;
            }
        }
        Ok(())
    }

    /// Remove turns by sequence number
    pub fn evict(&mut self, sequence_nos: &[u64]) -> Result<usize> {
        if sequence_nos.is_empty() {
            return Ok(0);
        }
        self.store.delete_turns(sequence_nos)?;
        let before = self.turns.len();
        self.turns.retain(|t| !sequence_nos.contains(&t.sequence_no));
        let removed = before - self.turns.len();
        debug!("Evicted {} turns", removed);
        Ok(removed)
    }
}
