//! Memory Consolidation
//!
//! Moves information from working memory and the conversation log into
//! archival memory while shrinking near-full blocks back under budget.
//!
//! A pass is planned first and checked for integrity: salient block text
//! and important turns must land in an archive write. Only then is it
//! applied, in order: archive writes, block compaction, turn marking.
//! Writes whose content already exists in the archive are skipped, so a
//! second pass over unchanged input changes nothing.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::archival::{hash_content, ArchivalStore};
use crate::clock::{elapsed_between, Clock};
use crate::conversation::{ConversationLog, ConversationTurn, Salience};
use crate::error::{Error, Result};
use crate::working_memory::{MemoryBlock, WorkingMemory};

/// Why a pass started
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsolidationTrigger {
    Schedule,
    NearFull,
    Eviction,
    Manual,
}

impl ConsolidationTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsolidationTrigger::Schedule => "schedule",
            ConsolidationTrigger::NearFull => "near_full",
            ConsolidationTrigger::Eviction => "eviction",
            ConsolidationTrigger::Manual => "manual",
        }
    }
}

/// Consolidation configuration
#[derive(Debug, Clone)]
pub struct ConsolidationConfig {
    /// Scheduled pass interval
    pub interval: Duration,
    /// A block is near full when its free space is below this fraction of the limit
    pub near_full_margin: f64,
    /// Compacted blocks are shrunk to this fraction of the limit
    pub compaction_target: f64,
    /// Scheduled passes wait for at least this many unconsolidated turns
    pub min_pending_turns: usize,
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(15 * 60),
            near_full_margin: 0.1,
            compaction_target: 0.5,
            min_pending_turns: 3,
        }
    }
}

/// Decision for one conversation turn
#[derive(Debug, Clone, PartialEq)]
pub enum TurnDisposition {
    Discard,
    Archive { tags: Vec<String>, importance: f32 },
}

/// Proposed shrink of one block
#[derive(Debug, Clone, PartialEq)]
pub struct BlockCompaction {
    /// Text to archive verbatim
    pub archived: Vec<String>,
    /// Replacement block content
    pub retained: String,
}

/// Decides what to keep, archive and drop
pub trait ConsolidationPolicy: Send + Sync {
    fn classify_turn(&self, turn: &ConversationTurn) -> TurnDisposition;

    fn compact_block(&self, block: &MemoryBlock, target_chars: usize) -> BlockCompaction;
}

/// Archive turns verbatim, drop ephemeral ones, move the oldest block lines out
#[derive(Debug, Clone, Default)]
pub struct DefaultPolicy;

impl ConsolidationPolicy for DefaultPolicy {
    fn classify_turn(&self, turn: &ConversationTurn) -> TurnDisposition {
        let tags = vec!["conversation".to_string(), turn.role.as_str().to_string()];
        match turn.salience {
            Salience::Ephemeral => TurnDisposition::Discard,
            Salience::Normal => TurnDisposition::Archive { tags, importance: 0.3 },
            Salience::Important => TurnDisposition::Archive { tags, importance: 1.0 },
        }
    }

    fn compact_block(&self, block: &MemoryBlock, target_chars: usize) -> BlockCompaction {
        let lines: Vec<&str> = block.content.split('\n').collect();

        let mut start = 0;
        while start < lines.len() && lines[start..].join("\n").chars().count() > target_chars {
            start += 1;
        }

        let mut archived: Vec<String> = lines[..start]
            .iter()
            .filter(|l| !l.trim().is_empty())
            .map(|l| l.to_string())
            .collect();

        let mut retained = lines[start..].join("\n");
        if start == lines.len() && !archived.is_empty() {
            let marker = format!("({} lines moved to archival memory)", archived.len());
            retained = if marker.chars().count() <= target_chars { marker } else { String::new() };
        }

        for salient in &block.salient {
            if !retained.contains(salient.as_str()) && !archived.iter().any(|a| a == salient) {
                archived.push(salient.clone());
            }
        }

        BlockCompaction { archived, retained }
    }
}

/// One pending archival write
#[derive(Debug, Clone, PartialEq)]
pub struct ArchiveWrite {
    pub text: String,
    pub tags: Vec<String>,
    pub importance: f32,
}

/// Checked consolidation pass, not yet applied
#[derive(Debug, Clone, Default)]
pub struct ConsolidationPlan {
    pub writes: Vec<ArchiveWrite>,
    /// (block name, new content)
    pub compactions: Vec<(String, String)>,
    /// Turns to mark consolidated
    pub turns: Vec<u64>,
    pub discarded: usize,
}

impl ConsolidationPlan {
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty() && self.compactions.is_empty() && self.turns.is_empty()
    }
}

/// Outcome of an applied pass
#[derive(Debug, Clone, Default)]
pub struct ConsolidationReport {
    pub archived: usize,
    pub skipped_existing: usize,
    pub discarded: usize,
    pub compacted_blocks: Vec<String>,
    pub turns_consolidated: usize,
}

impl ConsolidationReport {
    /// Nothing new written or resized
    pub fn is_noop(&self) -> bool {
        self.archived == 0 && self.compacted_blocks.is_empty() && self.turns_consolidated == 0
    }
}

/// Consolidation driver
pub struct Consolidator {
    config: ConsolidationConfig,
    policy: Box<dyn ConsolidationPolicy>,
    clock: Arc<dyn Clock>,
    last_run: DateTime<Utc>,
    passes: u64,
}

impl Consolidator {
    pub fn new(config: ConsolidationConfig, policy: Box<dyn ConsolidationPolicy>, clock: Arc<dyn Clock>) -> Self {
        let last_run = clock.now();
        Self {
            config,
            policy,
            clock,
            last_run,
            passes: 0,
        }
    }

    pub fn with_default_policy(config: ConsolidationConfig, clock: Arc<dyn Clock>) -> Self {
        Self::new(config, Box::new(DefaultPolicy), clock)
    }

    pub fn config(&self) -> &ConsolidationConfig {
        &self.config
    }

    pub fn passes(&self) -> u64 {
        self.passes
    }

    /// Trigger that should fire now, if any
    pub fn due(&self, memory: &WorkingMemory, log: &ConversationLog) -> Option<ConsolidationTrigger> {
        if !memory.near_full(self.config.near_full_margin).is_empty() {
            return Some(ConsolidationTrigger::NearFull);
        }
        let elapsed = elapsed_between(self.last_run, self.clock.now());
        if elapsed >= self.config.interval && log.unconsolidated().len() >= self.config.min_pending_turns {
            return Some(ConsolidationTrigger::Schedule);
        }
        None
    }

    /// Build and integrity-check a pass over the given material
    pub fn plan(&self, blocks: &[&MemoryBlock], turns: &[&ConversationTurn]) -> Result<ConsolidationPlan> {
        let mut plan = ConsolidationPlan::default();

        for turn in turns.iter().filter(|t| !t.consolidated) {
            match self.policy.classify_turn(turn) {
                TurnDisposition::Discard => {
                    if turn.salience == Salience::Important {
                        return Err(Error::ConsolidationIntegrity(format!(
                            "important turn #{} would be discarded",
                            turn.sequence_no
                        )));
                    }
                    plan.discarded += 1;
                }
                TurnDisposition::Archive { tags, importance } => {
                    let importance = if turn.salience == Salience::Important { 1.0 } else { importance };
                    plan.writes.push(ArchiveWrite {
                        text: turn.content.clone(),
                        tags,
                        importance,
                    });
                }
            }
            plan.turns.push(turn.sequence_no);
        }

        for block in blocks {
            let target = (block.char_limit as f64 * self.config.compaction_target) as usize;
            let compaction = self.policy.compact_block(block, target);
            if compaction.retained == block.content {
                continue;
            }

            let len = compaction.retained.chars().count();
            if len > block.char_limit {
                return Err(Error::ConsolidationIntegrity(format!(
                    "compacted '{}' is {} chars, limit {}",
                    block.name, len, block.char_limit
                )));
            }

            for salient in &block.salient {
                let kept = compaction.retained.contains(salient.as_str());
                let archived = compaction.archived.iter().any(|a| a.contains(salient.as_str()));
                if !kept && !archived {
                    return Err(Error::ConsolidationIntegrity(format!(
                        "salient text in '{}' would be lost",
                        block.name
                    )));
                }
            }

            for text in compaction.archived {
                let importance = if block.salient.iter().any(|s| text.contains(s.as_str())) { 1.0 } else { 0.5 };
                plan.writes.push(ArchiveWrite {
                    text,
                    tags: vec!["working-memory".to_string(), block.name.clone()],
                    importance,
                });
            }
            plan.compactions.push((block.name.clone(), compaction.retained));
        }

        Ok(plan)
    }

    /// Consolidate near-full blocks and all unconsolidated turns
    pub async fn run(
        &mut self,
        trigger: ConsolidationTrigger,
        memory: &mut WorkingMemory,
        archive: &mut ArchivalStore,
        log: &mut ConversationLog,
    ) -> Result<ConsolidationReport> {
        let plan = {
            let blocks = memory.near_full(self.config.near_full_margin);
            let turns = log.unconsolidated();
            self.plan(&blocks, &turns)?
        };
        let report = self.apply(plan, memory, archive, log).await?;
        self.log_report(trigger, &report);
        Ok(report)
    }

    /// Consolidate a batch of turns about to be evicted
    pub async fn absorb(
        &mut self,
        batch: &[ConversationTurn],
        memory: &mut WorkingMemory,
        archive: &mut ArchivalStore,
        log: &mut ConversationLog,
    ) -> Result<ConsolidationReport> {
        let turns: Vec<&ConversationTurn> = batch.iter().collect();
        let plan = self.plan(&[], &turns)?;
        let report = self.apply(plan, memory, archive, log).await?;
        self.log_report(ConsolidationTrigger::Eviction, &report);
        Ok(report)
    }

    async fn apply(
        &mut self,
        plan: ConsolidationPlan,
        memory: &mut WorkingMemory,
        archive: &mut ArchivalStore,
        log: &mut ConversationLog,
    ) -> Result<ConsolidationReport> {
        let mut report = ConsolidationReport {
            discarded: plan.discarded,
            ..ConsolidationReport::default()
        };

        for write in &plan.writes {
            if archive.find_by_hash(&hash_content(&write.text)).is_some() {
                report.skipped_existing += 1;
                continue;
            }
            archive.insert(&write.text, &write.tags, write.importance).await?;
            report.archived += 1;
        }

        for (name, retained) in &plan.compactions {
            memory.rethink(name, retained, false)?;
            report.compacted_blocks.push(name.clone());
        }

        log.mark_consolidated(&plan.turns)?;
        report.turns_consolidated = plan.turns.len();

        self.last_run = self.clock.now();
        self.passes += 1;
        Ok(report)
    }

    fn log_report(&self, trigger: ConsolidationTrigger, report: &ConsolidationReport) {
        if report.is_noop() {
            debug!("Consolidation ({}) had nothing to do", trigger.as_str());
            return;
        }
        info!(
            "Consolidation ({}): {} archived, {} already present, {} discarded, {} blocks compacted, {} turns",
            trigger.as_str(),
            report.archived,
            report.skipped_existing,
            report.discarded,
            report.compacted_blocks.len(),
            report.turns_consolidated
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::conversation::{ConversationConfig, Role};
    use crate::embeddings::HashEmbedder;
    use crate::store::{InMemoryStore, StateStore};
    use crate::working_memory::WorkingMemoryConfig;

    struct Fixture {
        memory: WorkingMemory,
        archive: ArchivalStore,
        log: ConversationLog,
        clock: ManualClock,
    }

    fn fixture(limit: usize) -> Fixture {
        let clock = ManualClock::fixed();
        let store: Arc<dyn StateStore> = Arc::new(InMemoryStore::new());
        let shared_clock: Arc<dyn Clock> = Arc::new(clock.clone());
        let config = WorkingMemoryConfig::empty().with_block("task-state", "Goals", limit);
        Fixture {
            memory: WorkingMemory::open(&config, store.clone(), shared_clock.clone()).unwrap(),
            archive: ArchivalStore::open(
                Default::default(),
                Arc::new(HashEmbedder::new(128)),
                store.clone(),
                shared_clock.clone(),
            )
            .unwrap(),
            log: ConversationLog::open(ConversationConfig::default(), store, shared_clock).unwrap(),
            clock,
        }
    }

    fn block(content: &str, limit: usize, salient: &[&str]) -> MemoryBlock {
        MemoryBlock {
            name: "task-state".into(),
            description: String::new(),
            content: content.into(),
            char_limit: limit,
            last_modified: ManualClock::fixed().now(),
            salient: salient.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_default_policy_moves_oldest_lines() {
        let b = block("aaaaaaaaaa\nbbbbbbbbbb\ncccccccccc", 40, &[]);
        let c = DefaultPolicy.compact_block(&b, 21);
        assert_eq!(c.archived, vec!["aaaaaaaaaa"]);
        assert_eq!(c.retained, "bbbbbbbbbb\ncccccccccc");
    }

    #[test]
    fn test_default_policy_oversized_line() {
        let b = block(&"z".repeat(90), 100, &[]);
        let c = DefaultPolicy.compact_block(&b, 50);
        assert_eq!(c.archived, vec!["z".repeat(90)]);
        assert_eq!(c.retained, "(1 lines moved to archival memory)");

        let tiny = DefaultPolicy.compact_block(&b, 10);
        assert_eq!(tiny.retained, "");
    }

    #[test]
    fn test_default_policy_archives_salient_fragment() {
        let b = block("old line with SECRET inside\nnew", 40, &["SECRET inside\nnew"]);
        let c = DefaultPolicy.compact_block(&b, 5);
        assert!(c.archived.contains(&"SECRET inside\nnew".to_string()));
    }

    struct LossyPolicy;

    impl ConsolidationPolicy for LossyPolicy {
        fn classify_turn(&self, _turn: &ConversationTurn) -> TurnDisposition {
            TurnDisposition::Discard
        }

        fn compact_block(&self, _block: &MemoryBlock, _target: usize) -> BlockCompaction {
            BlockCompaction {
                archived: Vec::new(),
                retained: String::new(),
            }
        }
    }

    #[tokio::test]
    async fn test_integrity_violation_leaves_state() {
        let mut f = fixture(50);
        f.memory.rethink("task-state", &"k".repeat(48), true).unwrap();
        let before = f.memory.get_block("task-state").unwrap().content.clone();

        let mut lossy = Consolidator::new(ConsolidationConfig::default(), Box::new(LossyPolicy), Arc::new(f.clock.clone()));
        let err = lossy
            .run(ConsolidationTrigger::Manual, &mut f.memory, &mut f.archive, &mut f.log)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ConsolidationIntegrity(_)));
        assert_eq!(f.memory.get_block("task-state").unwrap().content, before);
        assert!(f.archive.is_empty());
    }

    #[tokio::test]
    async fn test_important_turn_cannot_be_discarded() {
        let mut f = fixture(50);
        f.log.append(Role::Agent, "remember alice", Salience::Important).unwrap();

        let mut lossy = Consolidator::new(ConsolidationConfig::default(), Box::new(LossyPolicy), Arc::new(f.clock.clone()));
        let err = lossy
            .run(ConsolidationTrigger::Manual, &mut f.memory, &mut f.archive, &mut f.log)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ConsolidationIntegrity(_)));
        assert_eq!(f.log.unconsolidated().len(), 1);
    }

    #[tokio::test]
    async fn test_run_is_idempotent() {
        let mut f = fixture(100);
        let lines: Vec<String> = (0..7).map(|i| format!("goal number {}", i)).collect();
        f.memory.rethink("task-state", &lines.join("\n"), false).unwrap();
        f.log.append(Role::Environment, "feed was quiet", Salience::Ephemeral).unwrap();
        f.log.append(Role::Agent, "posted about rust", Salience::Normal).unwrap();

        let mut consolidator =
            Consolidator::with_default_policy(ConsolidationConfig::default(), Arc::new(f.clock.clone()));
        assert_eq!(consolidator.due(&f.memory, &f.log), Some(ConsolidationTrigger::NearFull));

        let first = consolidator
            .run(ConsolidationTrigger::NearFull, &mut f.memory, &mut f.archive, &mut f.log)
            .await
            .unwrap();
        assert!(first.archived > 0);
        assert_eq!(first.discarded, 1);
        assert_eq!(first.compacted_blocks, vec!["task-state"]);
        assert!(f.memory.get_block("task-state").unwrap().len() <= 50);

        let entries = f.archive.len();
        let content = f.memory.get_block("task-state").unwrap().content.clone();

        let second = consolidator
            .run(ConsolidationTrigger::Manual, &mut f.memory, &mut f.archive, &mut f.log)
            .await
            .unwrap();
        assert!(second.is_noop());
        assert_eq!(f.archive.len(), entries);
        assert_eq!(f.memory.get_block("task-state").unwrap().content, content);
    }

    #[tokio::test]
    async fn test_schedule_trigger_waits_for_interval() {
        let mut f = fixture(100);
        let consolidator =
            Consolidator::with_default_policy(ConsolidationConfig::default(), Arc::new(f.clock.clone()));
        for i in 0..3 {
            f.log.append(Role::Agent, &format!("turn {}", i), Salience::Normal).unwrap();
        }
        assert_eq!(consolidator.due(&f.memory, &f.log), None);

        f.clock.advance(Duration::from_secs(15 * 60));
        assert_eq!(consolidator.due(&f.memory, &f.log), Some(ConsolidationTrigger::Schedule));
    }

    #[tokio::test]
    async fn test_salient_content_recoverable() {
        let mut f = fixture(75);
        f.memory.insert("task-state", 0, "the operator password rotates friday", true).unwrap();
        f.memory.insert("task-state", 0, "check the feed hourly for mentions", false).unwrap();

        let mut consolidator =
            Consolidator::with_default_policy(ConsolidationConfig::default(), Arc::new(f.clock.clone()));
        consolidator
            .run(ConsolidationTrigger::NearFull, &mut f.memory, &mut f.archive, &mut f.log)
            .await
            .unwrap();

        assert!(!f.memory.get_block("task-state").unwrap().content.contains("password"));
        let hit = f.archive.search("operator password", 1, &[]).await.unwrap().next().unwrap();
        assert_eq!(hit.entry.text, "the operator password rotates friday");
        assert_eq!(hit.entry.importance, 1.0);
    }
}
