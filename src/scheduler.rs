//! Cycle Scheduler
//!
//! Single-flight decision loop. Triggers (timer ticks, operator "run now")
//! set a one-slot request flag; the loop drains it between cycles, so a
//! trigger arriving mid-cycle becomes "run again right after" instead of a
//! second concurrent cycle.
//!
//! States: Idle -> Running -> (Idle | Paused)

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::agent::{Agent, OpOutcome};
use crate::consolidation::ConsolidationReport;
use crate::conversation::{Role, Salience};
use crate::error::{Error, Result};
use crate::reasoning::ReasoningEngine;
use crate::retry::RetryPolicy;

/// Scheduler states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SchedulerState {
    /// Waiting for the next trigger
    Idle = 0,
    /// A cycle is in flight
    Running = 1,
    /// Triggers are queued but no cycle starts
    Paused = 2,
}

impl From<u8> for SchedulerState {
    fn from(v: u8) -> Self {
        match v {
            1 => SchedulerState::Running,
            2 => SchedulerState::Paused,
            _ => SchedulerState::Idle,
        }
    }
}

/// Scheduler settings
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Time between scheduled cycles
    pub poll_interval: Duration,
    /// Operations left when this expires are skipped
    pub cycle_timeout: Duration,
    pub feed_limit: usize,
    pub recall_top_k: usize,
    pub recent_turns: usize,
    /// Backoff for failed cycles
    pub retry: RetryPolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(3 * 60),
            cycle_timeout: Duration::from_secs(5 * 60),
            feed_limit: 20,
            recall_top_k: 5,
            recent_turns: 20,
            retry: RetryPolicy::cycle(),
        }
    }
}

/// Scheduler counters
#[derive(Debug, Default)]
pub struct SchedulerStats {
    pub cycles_run: AtomicU64,
    pub cycles_failed: AtomicU64,
    pub triggers_coalesced: AtomicU64,
    pub actions_executed: AtomicU64,
    pub actions_rejected: AtomicU64,
}

/// Point-in-time view for operators
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerStatus {
    pub state: SchedulerState,
    pub paused: bool,
    pub run_pending: bool,
    pub cycles_run: u64,
    pub cycles_failed: u64,
    pub triggers_coalesced: u64,
    pub actions_executed: u64,
    pub actions_rejected: u64,
}

/// What one cycle did
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub feed_items: usize,
    pub operations: usize,
    pub applied: usize,
    pub rejected: usize,
    pub failed: usize,
    /// Left unapplied after a batch stop, deadline or shutdown
    pub skipped: usize,
    pub consolidation: Option<ConsolidationReport>,
}

struct Shared {
    state: AtomicU8,
    paused: AtomicBool,
    run_requested: AtomicBool,
    wake: Notify,
    stats: SchedulerStats,
}

impl Shared {
    fn state(&self) -> SchedulerState {
        SchedulerState::from(self.state.load(Ordering::SeqCst))
    }

    fn transition_to(&self, new_state: SchedulerState) {
        let old = self.state.swap(new_state as u8, Ordering::SeqCst);
        if old != new_state as u8 {
            debug!("Scheduler: {:?} -> {:?}", SchedulerState::from(old), new_state);
        }
    }
}

/// Trigger source and status view; cheap to clone
///
/// The loop stops once every handle has been dropped.
#[derive(Clone)]
pub struct SchedulerHandle {
    shared: Arc<Shared>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl SchedulerHandle {
    /// Request a cycle; returns false if it merged into one already pending
    pub fn run_now(&self) -> bool {
        let already_pending = self.shared.run_requested.swap(true, Ordering::SeqCst);
        if already_pending {
            self.shared.stats.triggers_coalesced.fetch_add(1, Ordering::Relaxed);
            debug!("Run request coalesced");
        }
        self.shared.wake.notify_one();
        !already_pending
    }

    pub fn pause(&self) {
        if !self.shared.paused.swap(true, Ordering::SeqCst) {
            info!("Scheduler pause requested");
        }
        self.shared.wake.notify_one();
    }

    pub fn resume(&self) {
        if self.shared.paused.swap(false, Ordering::SeqCst) {
            info!("Scheduler resumed");
        }
        self.shared.wake.notify_one();
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        self.shared.wake.notify_one();
    }

    pub fn state(&self) -> SchedulerState {
        self.shared.state()
    }

    pub fn status(&self) -> SchedulerStatus {
        let stats = &self.shared.stats;
        SchedulerStatus {
            state: self.shared.state(),
            paused: self.shared.paused.load(Ordering::SeqCst),
            run_pending: self.shared.run_requested.load(Ordering::SeqCst),
            cycles_run: stats.cycles_run.load(Ordering::Relaxed),
            cycles_failed: stats.cycles_failed.load(Ordering::Relaxed),
            triggers_coalesced: stats.triggers_coalesced.load(Ordering::Relaxed),
            actions_executed: stats.actions_executed.load(Ordering::Relaxed),
            actions_rejected: stats.actions_rejected.load(Ordering::Relaxed),
        }
    }
}

/// Owns the agent and runs decision cycles one at a time
pub struct CycleScheduler {
    agent: Agent,
    engine: Arc<dyn ReasoningEngine>,
    config: SchedulerConfig,
    shared: Arc<Shared>,
    shutdown: watch::Receiver<bool>,
}

impl CycleScheduler {
    pub fn new(agent: Agent, engine: Arc<dyn ReasoningEngine>, config: SchedulerConfig) -> (Self, SchedulerHandle) {
        let shared = Arc::new(Shared {
            state: AtomicU8::new(SchedulerState::Idle as u8),
            paused: AtomicBool::new(false),
            run_requested: AtomicBool::new(false),
            wake: Notify::new(),
            stats: SchedulerStats::default(),
        });
        let (tx, rx) = watch::channel(false);
        let handle = SchedulerHandle {
            shared: shared.clone(),
            shutdown: Arc::new(tx),
        };
        (
            Self {
                agent,
                engine,
                config,
                shared,
                shutdown: rx,
            },
            handle,
        )
    }

    pub fn agent(&self) -> &Agent {
        &self.agent
    }

    pub fn agent_mut(&mut self) -> &mut Agent {
        &mut self.agent
    }

    /// Drive cycles until shutdown, then hand the agent back
    pub async fn run(mut self) -> Agent {
        info!("Scheduler started, polling every {:?}", self.config.poll_interval);
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            if self.shared.paused.load(Ordering::SeqCst) {
                self.shared.transition_to(SchedulerState::Paused);
                tokio::select! {
                    _ = self.shared.wake.notified() => {}
                    changed = self.shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
                continue;
            }

            if self.shared.run_requested.swap(false, Ordering::SeqCst) {
                self.run_with_retry().await;
                continue;
            }

            self.shared.transition_to(SchedulerState::Idle);
            tokio::select! {
                _ = ticker.tick() => {
                    self.shared.run_requested.store(true, Ordering::SeqCst);
                }
                _ = self.shared.wake.notified() => {}
                changed = self.shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        self.shared.transition_to(SchedulerState::Idle);
        info!("Scheduler stopped");
        self.agent
    }

    async fn run_with_retry(&mut self) {
        self.shared.transition_to(SchedulerState::Running);
        let mut attempt = 0;
        loop {
            match self.run_cycle().await {
                Ok(report) => {
                    self.shared.stats.cycles_run.fetch_add(1, Ordering::Relaxed);
                    info!(
                        "Cycle done: {} ops, {} applied, {} rejected, {} failed, {} skipped",
                        report.operations, report.applied, report.rejected, report.failed, report.skipped
                    );
                    return;
                }
                Err(e) => {
                    self.shared.stats.cycles_failed.fetch_add(1, Ordering::Relaxed);
                    if attempt >= self.config.retry.max_retries {
                        error!("Cycle failed after {} retries: {}", attempt, e);
                        return;
                    }
                    let delay = self.config.retry.delay_for_attempt(attempt);
                    warn!("Cycle failed: {}, retrying in {:?}", e, delay);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.shutdown.changed() => return,
                    }
                    if self.shared.paused.load(Ordering::SeqCst) {
                        // retry once resumed
                        self.shared.run_requested.store(true, Ordering::SeqCst);
                        info!("Paused during backoff, retry queued");
                        return;
                    }
                    attempt += 1;
                }
            }
        }
    }

    /// Run exactly one decision cycle
    pub async fn run_cycle(&mut self) -> Result<CycleReport> {
        let deadline = Instant::now() + self.config.cycle_timeout;
        let mut report = CycleReport::default();

        let feed = match self.agent.platform().fetch_feed(self.config.feed_limit).await {
            Ok(feed) => feed,
            Err(e) => {
                warn!("Feed unavailable: {}", e);
                Vec::new()
            }
        };
        report.feed_items = feed.len();

        let context = self
            .agent
            .assemble_context(feed, self.config.recall_top_k, self.config.recent_turns)
            .await?;

        let ops = match tokio::time::timeout_at(deadline, self.engine.decide(&context)).await {
            Ok(ops) => ops?,
            Err(_) => {
                return Err(Error::ReasoningEngineUnavailable(format!(
                    "no answer within {:?}",
                    self.config.cycle_timeout
                )))
            }
        };
        report.operations = ops.len();

        if !context.feed.is_empty() {
            let titles: Vec<&str> = context.feed.iter().map(|item| item.title.as_str()).collect();
            self.agent
                .record_turn(Role::Environment, &format!("feed: {}", titles.join(" | ")), Salience::Ephemeral)
                .await?;
        }

        for (i, op) in ops.iter().enumerate() {
            if Instant::now() >= deadline {
                warn!("Cycle deadline reached, skipping {} operations", ops.len() - i);
                report.skipped = ops.len() - i;
                break;
            }
            if *self.shutdown.borrow() {
                report.skipped = ops.len() - i;
                break;
            }

            // logged before applying so a dispatched action is never unrecorded
            let salience = if op.is_important() { Salience::Important } else { Salience::Normal };
            self.agent.record_turn(Role::Agent, &op.describe(), salience).await?;

            let (outcome, salience) = match self.agent.apply_op(op).await {
                Ok(outcome) => {
                    report.applied += 1;
                    if matches!(outcome, OpOutcome::Executed { .. }) {
                        self.shared.stats.actions_executed.fetch_add(1, Ordering::Relaxed);
                    }
                    (outcome.describe(), Salience::Ephemeral)
                }
                Err(e) if e.is_fatal_to_cycle() => {
                    if let Err(log_err) = self
                        .agent
                        .record_turn(Role::Tool, &format!("error: {}", e), Salience::Normal)
                        .await
                    {
                        warn!("Could not record failed operation: {}", log_err);
                    }
                    return Err(e);
                }
                Err(e) if e.stops_batch() => {
                    report.rejected += 1;
                    report.skipped = ops.len() - i - 1;
                    self.shared.stats.actions_rejected.fetch_add(1, Ordering::Relaxed);
                    info!("Stopping batch after rejection: {}", e);
                    self.agent
                        .record_turn(Role::Tool, &format!("rejected: {}", e), Salience::Ephemeral)
                        .await?;
                    break;
                }
                Err(e) if e.is_action_rejection() => {
                    report.rejected += 1;
                    self.shared.stats.actions_rejected.fetch_add(1, Ordering::Relaxed);
                    (format!("rejected: {}", e), Salience::Ephemeral)
                }
                Err(e) => {
                    report.failed += 1;
                    warn!("Operation failed: {}", e);
                    (format!("error: {}", e), Salience::Normal)
                }
            };
            self.agent.record_turn(Role::Tool, &outcome, salience).await?;
        }

        let feed_ids: Vec<String> = context.feed.iter().map(|item| item.id.clone()).collect();
        self.agent.mark_seen(&feed_ids)?;

        report.consolidation = self.agent.maybe_consolidate().await?;
        Ok(report)
    }
}
