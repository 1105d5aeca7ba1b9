//! Working Memory
//!
//! Bounded, named text blocks that are always in the reasoning context.
//! Blocks are fixed at bootstrap and edited in place through `rethink`,
//! `replace` and `insert`. Each edit is all-or-nothing: the candidate block
//! set is persisted before it replaces the in-memory state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::store::StateStore;

/// A named, size-limited block of text
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryBlock {
    pub name: String,
    pub description: String,
    pub content: String,
    pub char_limit: usize,
    pub last_modified: DateTime<Utc>,
    /// Text fragments flagged important by the edit that wrote them
    #[serde(default)]
    pub salient: Vec<String>,
}

impl MemoryBlock {
    /// Length in chars
    pub fn len(&self) -> usize {
        self.content.chars().count()
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }

    /// Fraction of the limit in use
    pub fn usage(&self) -> f64 {
        if self.char_limit == 0 {
            return 1.0;
        }
        self.len() as f64 / self.char_limit as f64
    }
}

/// Block definition used at agent creation
#[derive(Debug, Clone)]
pub struct BlockSpec {
    pub name: String,
    pub description: String,
    pub char_limit: usize,
}

impl BlockSpec {
    pub fn new(name: &str, description: &str, char_limit: usize) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            char_limit,
        }
    }
}

/// Working memory configuration
#[derive(Debug, Clone)]
pub struct WorkingMemoryConfig {
    pub blocks: Vec<BlockSpec>,
}

impl Default for WorkingMemoryConfig {
    fn default() -> Self {
        Self {
            blocks: vec![
                BlockSpec::new("persona", "Who you are, your voice and your interests.", 2000),
                BlockSpec::new("human", "Facts about your operator and the agents you talk to.", 2000),
                BlockSpec::new("task-state", "Current goals, plans and things to follow up on.", 5000),
            ],
        }
    }
}

impl WorkingMemoryConfig {
    /// Empty configuration, blocks added with [`with_block`](Self::with_block)
    pub fn empty() -> Self {
        Self { blocks: Vec::new() }
    }

    pub fn with_block(mut self, name: &str, description: &str, char_limit: usize) -> Self {
        self.blocks.retain(|b| b.name != name);
        self.blocks.push(BlockSpec::new(name, description, char_limit));
        self
    }
}

/// Bounded block store with durable, atomic edits
pub struct WorkingMemory {
    blocks: Vec<MemoryBlock>,
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
}

impl WorkingMemory {
    /// Load persisted blocks, creating any configured block that is missing
    pub fn open(config: &WorkingMemoryConfig, store: Arc<dyn StateStore>, clock: Arc<dyn Clock>) -> Result<Self> {
        let mut blocks = store.load_blocks()?;
        let mut created = 0;

        for spec in &config.blocks {
            if blocks.iter().any(|b| b.name == spec.name) {
                continue;
            }
            blocks.push(MemoryBlock {
                name: spec.name.clone(),
                description: spec.description.clone(),
                content: String::new(),
                char_limit: spec.char_limit,
                last_modified: clock.now(),
                salient: Vec::new(),
            });
            created += 1;
        }

        if created > 0 {
            store.save_blocks(&blocks)?;
        }

        info!("Working memory opened: {} blocks ({} new)", blocks.len(), created);
        Ok(Self { blocks, store, clock })
    }

    /// Get a block by name
    pub fn get_block(&self, name: &str) -> Result<&MemoryBlock> {
        self.blocks
            .iter()
            .find(|b| b.name == name)
            .ok_or_else(|| Error::UnknownBlock(name.to_string()))
    }

    /// All blocks in registration order
    pub fn list_blocks(&self) -> &[MemoryBlock] {
        &self.blocks
    }

    /// Replace the entire content of a block
    pub fn rethink(&mut self, name: &str, new_content: &str, important: bool) -> Result<()> {
        let idx = self.index_of(name)?;
        let salient = important.then(|| new_content.to_string());
        self.commit(idx, new_content.to_string(), salient)?;
        debug!("rethink {} ({} chars)", name, new_content.chars().count());
        Ok(())
    }

    /// Replace the single occurrence of `old` with `new`
    pub fn replace(&mut self, name: &str, old: &str, new: &str, important: bool) -> Result<()> {
        let idx = self.index_of(name)?;
        let content = &self.blocks[idx].content;
        let matches = occurrences(content, old);
        if matches != 1 {
            return Err(Error::NotFound {
                block: name.to_string(),
                matches,
            });
        }

        let updated = content.replacen(old, new, 1);
        let salient = (important && !new.is_empty()).then(|| new.to_string());
        self.commit(idx, updated, salient)?;
        debug!("replace in {}", name);
        Ok(())
    }

    /// Insert a line at a 1-based position; 0 or past the end appends
    pub fn insert(&mut self, name: &str, line_number: i64, text: &str, important: bool) -> Result<()> {
        if line_number < 0 {
            return Err(Error::IndexOutOfRange(line_number));
        }
        let idx = self.index_of(name)?;
        let content = &self.blocks[idx].content;

        let mut lines: Vec<&str> = if content.is_empty() {
            Vec::new()
        } else {
            content.split('\n').collect()
        };

        let position = line_number as usize;
        if position == 0 || position > lines.len() {
            lines.push(text);
        } else {
            lines.insert(position - 1, text);
        }

        let updated = lines.join("\n");
        let salient = (important && !text.is_empty()).then(|| text.to_string());
        self.commit(idx, updated, salient)?;
        debug!("insert into {} at line {}", name, line_number);
        Ok(())
    }

    /// Blocks whose free space is within `margin` (fraction of the limit)
    pub fn near_full(&self, margin: f64) -> Vec<&MemoryBlock> {
        let threshold = (1.0 - margin).clamp(0.0, 1.0);
        self.blocks
            .iter()
            .filter(|b| !b.is_empty() && b.usage() >= threshold)
            .collect()
    }

    /// Bounded context view of every block
    pub fn render(&self) -> String {
        let mut out = String::from("<memory_blocks>\n");
        for block in &self.blocks {
            out.push_str(&format!(
                "<{name}>\n<description>{desc}</description>\n<metadata>chars_current={len} chars_limit={limit}</metadata>\n<value>\n{content}\n</value>\n</{name}>\n",
                name = block.name,
                desc = block.description,
                len = block.len(),
                limit = block.char_limit,
                content = block.content,
            ));
        }
        out.push_str("</memory_blocks>");
        out
    }

    fn index_of(&self, name: &str) -> Result<usize> {
        self.blocks
            .iter()
            .position(|b| b.name == name)
            .ok_or_else(|| Error::UnknownBlock(name.to_string()))
    }

    /// Validate, persist, then swap in the new block set
    fn commit(&mut self, idx: usize, content: String, salient: Option<String>) -> Result<()> {
        let limit = self.blocks[idx].char_limit;
        let len = content.chars().count();
        if len > limit {
            return Err(Error::CapacityExceeded {
                block: self.blocks[idx].name.clone(),
                len,
                limit,
            });
        }

        let mut candidate = self.blocks.clone();
        let block = &mut candidate[idx];
        block.content = content;
        block.last_modified = self.clock.now();
        if let Some(text) = salient {
            if !block.salient.contains(&text) {
                block.salient.push(text);
            }
        }
        let current = &block.content;
        block.salient.retain(|s| current.contains(s.as_str()));

        self.store.save_blocks(&candidate)?;
        self.blocks = candidate;
        Ok(())
    }
}

/// Occurrences of `needle`, overlapping ones included
fn occurrences(haystack: &str, needle: &str) -> usize {
    if needle.is_empty() {
        return 0;
    }
    haystack
        .char_indices()
        .filter(|(i, _)| haystack[*i..].starts_with(needle))
        .count()
}
