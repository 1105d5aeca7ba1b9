//! Agent State
//!
//! One explicit object owning every memory component, the gateway and the
//! platform client. The scheduler drives it; nothing here is global.

use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::archival::{hash_content, ArchivalConfig, ArchivalStore};
use crate::clock::Clock;
use crate::consolidation::{ConsolidationConfig, ConsolidationReport, ConsolidationTrigger, Consolidator};
use crate::conversation::{ConversationConfig, ConversationLog, Role, Salience};
use crate::embeddings::EmbeddingProvider;
use crate::error::{Error, Result};
use crate::gateway::{ActionGateway, ActionKind, FailureKind, GatewayConfig};
use crate::platform::{ActionRequest, FeedItem, PlatformClient};
use crate::reasoning::{CycleContext, RequestedOp};
use crate::store::StateStore;
use crate::working_memory::{WorkingMemory, WorkingMemoryConfig};

/// Component settings for one agent
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub handle: String,
    pub working_memory: WorkingMemoryConfig,
    pub archival: ArchivalConfig,
    pub conversation: ConversationConfig,
    pub consolidation: ConsolidationConfig,
    pub gateway: GatewayConfig,
    /// Feed item ids remembered so they are not shown twice
    pub seen_post_capacity: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            handle: "openmolt".to_string(),
            working_memory: WorkingMemoryConfig::default(),
            archival: ArchivalConfig::default(),
            conversation: ConversationConfig::default(),
            consolidation: ConsolidationConfig::default(),
            gateway: GatewayConfig::default(),
            seen_post_capacity: 100,
        }
    }
}

/// Result of applying one requested operation
#[derive(Debug, Clone, PartialEq)]
pub enum OpOutcome {
    Edited { block: String },
    Archived { id: String },
    Executed { kind: ActionKind, external_id: Option<String> },
    /// Authorized but the platform call failed
    DispatchFailed { kind: ActionKind, failure: FailureKind, message: String },
    Noop,
}

impl OpOutcome {
    pub fn describe(&self) -> String {
        match self {
            OpOutcome::Edited { block } => format!("edited {}", block),
            OpOutcome::Archived { id } => format!("archived as {}", id),
            OpOutcome::Executed { kind, external_id } => match external_id {
                Some(id) => format!("{} done ({})", kind, id),
                None => format!("{} done", kind),
            },
            OpOutcome::DispatchFailed { kind, failure, message } => {
                format!("{} failed ({:?}): {}", kind, failure, message)
            }
            OpOutcome::Noop => "noop".to_string(),
        }
    }
}

/// The agent: memory, gateway and outbound client
pub struct Agent {
    pub memory: WorkingMemory,
    pub archive: ArchivalStore,
    pub log: ConversationLog,
    pub consolidator: Consolidator,
    pub gateway: ActionGateway,
    platform: Arc<dyn PlatformClient>,
    clock: Arc<dyn Clock>,
    store: Arc<dyn StateStore>,
    seen_posts: VecDeque<String>,
    seen_post_capacity: usize,
    handle: String,
}

impl Agent {
    pub fn open(
        config: AgentConfig,
        store: Arc<dyn StateStore>,
        embedder: Arc<dyn EmbeddingProvider>,
        platform: Arc<dyn PlatformClient>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let mut gateway_config = config.gateway;
        if gateway_config.own_handle.is_none() {
            gateway_config.own_handle = Some(config.handle.clone());
        }

        let memory = WorkingMemory::open(&config.working_memory, store.clone(), clock.clone())?;
        let archive = ArchivalStore::open(config.archival, embedder, store.clone(), clock.clone())?;
        let log = ConversationLog::open(config.conversation, store.clone(), clock.clone())?;
        let gateway = ActionGateway::open(gateway_config, store.clone(), clock.clone())?;
        let seen_posts: VecDeque<String> = store.load_seen_posts()?.into();
        let consolidator = Consolidator::with_default_policy(config.consolidation, clock.clone());

        info!("Agent {} ready", config.handle);
        Ok(Self {
            memory,
            archive,
            log,
            consolidator,
            gateway,
            platform,
            clock,
            store,
            seen_posts,
            seen_post_capacity: config.seen_post_capacity,
            handle: config.handle,
        })
    }

    pub fn handle(&self) -> &str {
        &self.handle
    }

    pub fn platform(&self) -> Arc<dyn PlatformClient> {
        self.platform.clone()
    }

    /// Apply one operation from the reasoning engine
    pub async fn apply_op(&mut self, op: &RequestedOp) -> Result<OpOutcome> {
        op.validate()?;
        match op {
            RequestedOp::Rethink {
                block,
                content,
                important,
            } => {
                self.memory.rethink(block, content, *important)?;
                Ok(OpOutcome::Edited { block: block.clone() })
            }
            RequestedOp::Replace {
                block,
                old,
                new,
                important,
            } => {
                self.memory.replace(block, old, new, *important)?;
                Ok(OpOutcome::Edited { block: block.clone() })
            }
            RequestedOp::Insert {
                block,
                line,
                text,
                important,
            } => {
                self.memory.insert(block, *line, text, *important)?;
                Ok(OpOutcome::Edited { block: block.clone() })
            }
            RequestedOp::ArchivalInsert {
                text,
                tags,
                importance,
            } => {
                let id = self.archive.insert(text, tags, *importance).await?;
                Ok(OpOutcome::Archived { id })
            }
            RequestedOp::Action { .. } => match op.action_request() {
                Some(request) => self.execute_action(&request).await,
                None => Ok(OpOutcome::Noop),
            },
            RequestedOp::Noop => Ok(OpOutcome::Noop),
        }
    }

    /// Authorize, dispatch, then confirm or release
    pub async fn execute_action(&mut self, request: &ActionRequest) -> Result<OpOutcome> {
        let reservation = match self.gateway.authorize(
            request.kind,
            request.target.as_deref(),
            request.content.as_deref(),
        ) {
            Ok(reservation) => reservation,
            Err(e) => {
                if e.is_action_rejection() {
                    info!("{}", e);
                }
                return Err(e);
            }
        };

        match self.platform.dispatch(request).await {
            Ok(receipt) => {
                self.gateway.confirm(reservation, receipt.external_id.as_deref())?;
                Ok(OpOutcome::Executed {
                    kind: request.kind,
                    external_id: receipt.external_id,
                })
            }
            Err(e) => {
                let failure = e.failure_kind();
                self.gateway.release_on_failure(reservation, failure)?;
                Ok(OpOutcome::DispatchFailed {
                    kind: request.kind,
                    failure,
                    message: e.to_string(),
                })
            }
        }
    }

    /// Append a turn and evict the oldest batch if the log is over capacity
    pub async fn record_turn(&mut self, role: Role, content: &str, salience: Salience) -> Result<u64> {
        let seq = self.log.append(role, content, salience)?;
        self.evict_if_needed().await?;
        Ok(seq)
    }

    /// Offer the oldest turns to the consolidator, then evict them
    ///
    /// Returns how many evicted turns were dropped without reaching the
    /// archive. Unarchived important turns stay in the log while it is under
    /// twice its capacity.
    pub async fn evict_if_needed(&mut self) -> Result<usize> {
        if !self.log.needs_eviction() {
            return Ok(0);
        }
        let batch = self.log.eviction_batch();

        let absorbed = self
            .consolidator
            .absorb(&batch, &mut self.memory, &mut self.archive, &mut self.log)
            .await;

        let (to_evict, lost): (Vec<u64>, usize) = match absorbed {
            Ok(report) => {
                debug!("Absorbed {} turns before eviction", report.turns_consolidated);
                (batch.iter().map(|t| t.sequence_no).collect(), 0)
            }
            Err(e) if e.is_fatal_to_cycle() => return Err(e),
            Err(e) => {
                let ceiling = self.log.capacity() * 2;
                let mut over_ceiling = self.log.len().saturating_sub(ceiling);
                let mut evict = Vec::new();
                let mut lost = 0;
                for turn in &batch {
                    // a partial absorb may have archived some of the batch
                    let archived =
                        turn.consolidated || self.archive.find_by_hash(&hash_content(&turn.content)).is_some();
                    if archived || turn.salience == Salience::Ephemeral {
                        evict.push(turn.sequence_no);
                        continue;
                    }
                    if turn.salience == Salience::Important {
                        if over_ceiling == 0 {
                            continue;
                        }
                        over_ceiling -= 1;
                        error!(
                            "Dropping important turn #{} past {} turns without archiving",
                            turn.sequence_no, ceiling
                        );
                    }
                    lost += 1;
                    evict.push(turn.sequence_no);
                }
                warn!(
                    "Consolidation before eviction failed ({}); evicting {} turns, {} unarchived",
                    e,
                    evict.len(),
                    lost
                );
                (evict, lost)
            }
        };

        self.log.evict(&to_evict)?;
        Ok(lost)
    }

    /// Run a consolidation pass; integrity and provider errors leave memory untouched
    pub async fn consolidate(&mut self, trigger: ConsolidationTrigger) -> Result<Option<ConsolidationReport>> {
        let result = self
            .consolidator
            .run(trigger, &mut self.memory, &mut self.archive, &mut self.log)
            .await;
        match result {
            Ok(report) => Ok(Some(report)),
            Err(e) if e.is_fatal_to_cycle() => Err(e),
            Err(e) => {
                warn!("Consolidation ({}) skipped: {}", trigger.as_str(), e);
                Ok(None)
            }
        }
    }

    /// Consolidate if a schedule or near-full trigger is due
    pub async fn maybe_consolidate(&mut self) -> Result<Option<ConsolidationReport>> {
        match self.consolidator.due(&self.memory, &self.log) {
            Some(trigger) => self.consolidate(trigger).await,
            None => Ok(None),
        }
    }

    /// Whether a feed item is ours and must not be engaged with
    pub fn is_own_item(&self, item: &FeedItem) -> bool {
        item.author.eq_ignore_ascii_case(&self.handle) || self.gateway.is_own(&item.id)
    }

    pub fn is_seen(&self, id: &str) -> bool {
        self.seen_posts.iter().any(|seen| seen == id)
    }

    /// Remember feed items shown this cycle, oldest forgotten past capacity
    pub fn mark_seen(&mut self, ids: &[String]) -> Result<()> {
        let mut seen = self.seen_posts.clone();
        for id in ids {
            if !seen.contains(id) {
                seen.push_back(id.clone());
            }
        }
        while seen.len() > self.seen_post_capacity {
            seen.pop_front();
        }
        if seen == self.seen_posts {
            return Ok(());
        }
        let ids: Vec<String> = seen.iter().cloned().collect();
        self.store.save_seen_posts(&ids)?;
        self.seen_posts = seen;
        Ok(())
    }

    /// Bounded context for one decision cycle
    pub async fn assemble_context(
        &self,
        feed: Vec<FeedItem>,
        recall_top_k: usize,
        recent_turns: usize,
    ) -> Result<CycleContext> {
        let before = feed.len();
        let feed: Vec<FeedItem> = feed
            .into_iter()
            .filter(|item| !self.is_own_item(item) && !self.is_seen(&item.id))
            .collect();
        if feed.len() < before {
            debug!("Filtered {} own or already seen items from the feed", before - feed.len());
        }

        let query = self.recall_query(&feed);
        let recalled = if query.trim().is_empty() || recall_top_k == 0 {
            Vec::new()
        } else {
            match self.archive.search(&query, recall_top_k, &[]).await {
                Ok(hits) => hits.map(|hit| hit.entry.text.clone()).collect(),
                Err(Error::Persistence(e)) => return Err(Error::Persistence(e)),
                Err(e) => {
                    warn!("Archival recall failed: {}", e);
                    Vec::new()
                }
            }
        };

        Ok(CycleContext {
            handle: self.handle.clone(),
            memory: self.memory.render(),
            recalled,
            recent_turns: self.log.recent(recent_turns).into_iter().cloned().collect(),
            feed,
            now: self.clock.now(),
        })
    }

    fn recall_query(&self, feed: &[FeedItem]) -> String {
        let from_feed: Vec<&str> = feed.iter().take(5).map(|item| item.title.as_str()).collect();
        let query = from_feed.join(" ");
        if !query.trim().is_empty() {
            return query;
        }
        self.memory
            .get_block("task-state")
            .map(|b| b.content.chars().take(500).collect())
            .unwrap_or_default()
    }

    /// Human-readable state summary for operators
    pub fn status_report(&self) -> String {
        let mut out = format!("agent: {}\n", self.handle);
        out.push_str("working memory:\n");
        for block in self.memory.list_blocks() {
            out.push_str(&format!(
                "  {:<12} {:>5}/{:<5} ({:.0}%)\n",
                block.name,
                block.len(),
                block.char_limit,
                block.usage() * 100.0
            ));
        }

        let archive = self.archive.stats();
        out.push_str(&format!("archival entries: {}\n", archive.total_entries));
        for (tag, count) in archive.by_tag.iter().take(10) {
            out.push_str(&format!("  #{} {}\n", tag, count));
        }

        out.push_str(&format!(
            "conversation: {}/{} turns, {} unconsolidated\n",
            self.log.len(),
            self.log.capacity(),
            self.log.unconsolidated().len()
        ));

        out.push_str("cooldowns:\n");
        for kind in ActionKind::ALL {
            let wait = self.gateway.retry_after(kind);
            if wait.is_zero() {
                out.push_str(&format!("  {:<12} ready\n", kind.as_str()));
            } else {
                out.push_str(&format!("  {:<12} {}s\n", kind.as_str(), wait.as_secs()));
            }
        }
        out.push_str(&format!("own ids: {}\n", self.gateway.own_ids().len()));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::embeddings::HashEmbedder;
    use crate::platform::{DispatchError, DispatchReceipt};
    use crate::store::InMemoryStore;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::time::Duration;

    struct ScriptedPlatform {
        results: Mutex<Vec<std::result::Result<DispatchReceipt, DispatchError>>>,
        sent: Mutex<Vec<ActionRequest>>,
    }

    impl ScriptedPlatform {
        fn new(results: Vec<std::result::Result<DispatchReceipt, DispatchError>>) -> Arc<Self> {
            Arc::new(Self {
                results: Mutex::new(results),
                sent: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl PlatformClient for ScriptedPlatform {
        async fn dispatch(&self, request: &ActionRequest) -> std::result::Result<DispatchReceipt, DispatchError> {
            self.sent.lock().push(request.clone());
            let mut results = self.results.lock();
            if results.is_empty() {
                Ok(DispatchReceipt::default())
            } else {
                results.remove(0)
            }
        }

        async fn fetch_feed(&self, _limit: usize) -> std::result::Result<Vec<FeedItem>, DispatchError> {
            Ok(Vec::new())
        }
    }

    fn agent_with(platform: Arc<ScriptedPlatform>, conversation: ConversationConfig) -> (Agent, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::fixed());
        let config = AgentConfig {
            handle: "molty".into(),
            conversation,
            ..AgentConfig::default()
        };
        let agent = Agent::open(
            config,
            Arc::new(InMemoryStore::new()),
            Arc::new(HashEmbedder::new(64)),
            platform,
            clock.clone(),
        )
        .unwrap();
        (agent, clock)
    }

    fn comment(target: &str, content: &str) -> RequestedOp {
        RequestedOp::Action {
            kind: ActionKind::Comment,
            target: Some(target.into()),
            content: Some(content.into()),
            title: None,
        }
    }

    #[tokio::test]
    async fn test_created_post_joins_self_index() {
        let platform = ScriptedPlatform::new(vec![Ok(DispatchReceipt {
            external_id: Some("p-own".into()),
        })]);
        let (mut agent, clock) = agent_with(platform, ConversationConfig::default());

        let post = RequestedOp::Action {
            kind: ActionKind::Post,
            target: None,
            content: Some("first post".into()),
            title: Some("Hello".into()),
        };
        let outcome = agent.apply_op(&post).await.unwrap();
        assert!(matches!(outcome, OpOutcome::Executed { external_id: Some(ref id), .. } if id == "p-own"));

        clock.advance(Duration::from_secs(60));
        let err = agent.apply_op(&comment("p-own", "me again")).await.unwrap_err();
        assert!(matches!(err, Error::SelfInteraction { .. }));
    }

    #[tokio::test]
    async fn test_transient_failure_releases_slot() {
        let platform = ScriptedPlatform::new(vec![Err(DispatchError::Transient {
            message: "timeout".into(),
            retry_after: None,
        })]);
        let (mut agent, _) = agent_with(platform.clone(), ConversationConfig::default());

        let outcome = agent.apply_op(&comment("p1", "hi")).await.unwrap();
        assert!(matches!(
            outcome,
            OpOutcome::DispatchFailed {
                failure: FailureKind::Transient,
                ..
            }
        ));

        // the cooldown slot is free again
        let next = agent.apply_op(&comment("p2", "hello there")).await.unwrap();
        assert!(matches!(next, OpOutcome::Executed { .. }));

        // but the timed-out comment may have landed, so it is not repeated
        let again = agent.apply_op(&comment("p1", "hi")).await.unwrap_err();
        assert!(matches!(again, Error::DuplicateAction { .. }));
        assert_eq!(platform.sent.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_permanent_failure_keeps_slot() {
        let platform = ScriptedPlatform::new(vec![Err(DispatchError::Permanent("banned words".into()))]);
        let (mut agent, _) = agent_with(platform, ConversationConfig::default());

        agent.apply_op(&comment("p1", "hi")).await.unwrap();
        let err = agent.apply_op(&comment("p2", "other")).await.unwrap_err();
        assert!(matches!(err, Error::RateLimited { .. }));
    }

    #[tokio::test]
    async fn test_own_handle_is_self_target() {
        let (mut agent, _) = agent_with(ScriptedPlatform::new(Vec::new()), ConversationConfig::default());
        let follow = RequestedOp::Action {
            kind: ActionKind::Follow,
            target: Some("molty".into()),
            content: None,
            title: None,
        };
        assert!(matches!(agent.apply_op(&follow).await, Err(Error::SelfInteraction { .. })));
    }

    #[tokio::test]
    async fn test_eviction_archives_before_removal() {
        let conversation = ConversationConfig {
            capacity: 4,
            eviction_batch: 2,
            ..ConversationConfig::default()
        };
        let (mut agent, _) = agent_with(ScriptedPlatform::new(Vec::new()), conversation);

        agent
            .record_turn(Role::Environment, "the secret handshake is two claps", Salience::Important)
            .await
            .unwrap();
        for i in 0..4 {
            agent
                .record_turn(Role::Agent, &format!("filler turn {}", i), Salience::Ephemeral)
                .await
                .unwrap();
        }

        assert_eq!(agent.log.len(), 3);
        let hits: Vec<String> = agent
            .archive
            .search("secret handshake", 3, &[])
            .await
            .unwrap()
            .map(|h| h.entry.text.clone())
            .collect();
        assert_eq!(hits.first().map(String::as_str), Some("the secret handshake is two claps"));
    }

    /// Embeds `successes` texts, then reports the provider as down
    struct FlakyEmbedder {
        inner: HashEmbedder,
        successes: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl EmbeddingProvider for FlakyEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            use std::sync::atomic::Ordering;
            let left = self.successes.load(Ordering::SeqCst);
            if left == 0 {
                return Err(Error::Embedding("provider offline".into()));
            }
            self.successes.store(left - 1, Ordering::SeqCst);
            self.inner.embed(text).await
        }

        fn dimension(&self) -> Option<usize> {
            self.inner.dimension()
        }
    }

    fn agent_with_embedder(successes: usize) -> Agent {
        let config = AgentConfig {
            handle: "molty".into(),
            conversation: ConversationConfig {
                capacity: 2,
                eviction_batch: 2,
                ..ConversationConfig::default()
            },
            ..AgentConfig::default()
        };
        let embedder = FlakyEmbedder {
            inner: HashEmbedder::new(64),
            successes: std::sync::atomic::AtomicUsize::new(successes),
        };
        Agent::open(
            config,
            Arc::new(InMemoryStore::new()),
            Arc::new(embedder),
            ScriptedPlatform::new(Vec::new()),
            Arc::new(ManualClock::fixed()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_partial_absorb_counts_only_unarchived_turns() {
        let mut agent = agent_with_embedder(1);
        agent.log.append(Role::Environment, "alpha", Salience::Important).unwrap();
        agent.log.append(Role::Tool, "beta", Salience::Normal).unwrap();
        agent.log.append(Role::Tool, "gamma", Salience::Normal).unwrap();

        // "alpha" reached the archive before the provider failed on "beta"
        let lost = agent.evict_if_needed().await.unwrap();
        assert_eq!(lost, 1);
        assert_eq!(agent.archive.len(), 1);
        assert_eq!(agent.log.len(), 1);
        assert_eq!(agent.log.recent(1)[0].content, "gamma");
    }

    #[tokio::test]
    async fn test_unarchived_important_turns_capped_at_twice_capacity() {
        let mut agent = agent_with_embedder(0);
        for i in 1..=5 {
            agent
                .log
                .append(Role::Environment, &format!("vital fact {}", i), Salience::Important)
                .unwrap();
        }

        // only the oldest turn over the 2N ceiling goes
        assert_eq!(agent.evict_if_needed().await.unwrap(), 1);
        assert_eq!(agent.log.len(), 4);
        assert_eq!(agent.log.recent(4)[0].content, "vital fact 2");

        // at the ceiling nothing important is dropped
        assert_eq!(agent.evict_if_needed().await.unwrap(), 0);
        assert_eq!(agent.log.len(), 4);

        agent.record_turn(Role::Tool, "tick", Salience::Ephemeral).await.unwrap();
        assert!(agent.log.len() <= 4);
        assert_eq!(agent.log.search("vital fact 5").len(), 1);
    }

    #[tokio::test]
    async fn test_context_filters_own_items() {
        let (mut agent, _) = agent_with(ScriptedPlatform::new(Vec::new()), ConversationConfig::default());
        agent.gateway.record_own("p-mine").unwrap();

        let feed = vec![
            FeedItem {
                id: "p-mine".into(),
                author: "someone".into(),
                title: "mine".into(),
                content: String::new(),
            },
            FeedItem {
                id: "p2".into(),
                author: "Molty".into(),
                title: "also mine".into(),
                content: String::new(),
            },
            FeedItem {
                id: "p3".into(),
                author: "crab".into(),
                title: "theirs".into(),
                content: String::new(),
            },
        ];
        let context = agent.assemble_context(feed, 3, 10).await.unwrap();
        assert_eq!(context.feed.len(), 1);
        assert_eq!(context.feed[0].id, "p3");
    }

    #[tokio::test]
    async fn test_seen_posts_filtered_and_bounded() {
        let store: Arc<dyn StateStore> = Arc::new(InMemoryStore::new());
        let open = |store: Arc<dyn StateStore>| {
            let config = AgentConfig {
                handle: "molty".into(),
                seen_post_capacity: 2,
                ..AgentConfig::default()
            };
            Agent::open(
                config,
                store,
                Arc::new(HashEmbedder::new(64)),
                ScriptedPlatform::new(Vec::new()),
                Arc::new(ManualClock::fixed()),
            )
            .unwrap()
        };
        let item = |id: &str| FeedItem {
            id: id.into(),
            author: "crab".into(),
            title: format!("post {}", id),
            content: String::new(),
        };

        let mut agent = open(store.clone());
        agent.mark_seen(&["p1".into(), "p2".into()]).unwrap();
        agent.mark_seen(&["p2".into(), "p3".into()]).unwrap();
        assert!(!agent.is_seen("p1"));
        assert!(agent.is_seen("p3"));

        let agent = open(store);
        let context = agent.assemble_context(vec![item("p1"), item("p2"), item("p4")], 0, 10).await.unwrap();
        let ids: Vec<&str> = context.feed.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["p1", "p4"]);
    }
}
