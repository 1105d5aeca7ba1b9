//! Action Gateway
//!
//! Guards every outbound side effect. `authorize` checks, in order:
//! 1. self-interaction: the target is one of our own posts/comments/handle
//! 2. duplicate: same (kind, target, content) inside the de-dup window
//! 3. rate limit: per-kind minimum interval, rolling-window quota and the
//!    optional once-per-target window
//!
//! A successful authorization reserves the cooldown slot immediately. The
//! caller then dispatches and reports back with `confirm` or
//! `release_on_failure`. Transient failures roll the cooldown back;
//! permanent failures keep it. Either way the authorization stays in the
//! de-dup record, since a timed-out call may still have landed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::clock::{elapsed_between, Clock};
use crate::error::{Error, Result};
use crate::store::StateStore;

/// Outbound action kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Post,
    Comment,
    Vote,
    #[serde(alias = "dm")]
    DirectMessage,
    Follow,
    DeletePost,
}

impl ActionKind {
    pub const ALL: [ActionKind; 6] = [
        ActionKind::Post,
        ActionKind::Comment,
        ActionKind::Vote,
        ActionKind::DirectMessage,
        ActionKind::Follow,
        ActionKind::DeletePost,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Post => "post",
            ActionKind::Comment => "comment",
            ActionKind::Vote => "vote",
            ActionKind::DirectMessage => "dm",
            ActionKind::Follow => "follow",
            ActionKind::DeletePost => "delete_post",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-kind limits
#[derive(Debug, Clone)]
pub struct ActionPolicy {
    /// Minimum time between two actions of this kind
    pub min_interval: Duration,
    /// Rolling window for `max_per_window`, none for no quota
    pub window: Option<Duration>,
    pub max_per_window: u32,
    /// May target our own content (e.g. deleting our own post)
    pub self_target_exempt: bool,
    /// Successful dispatch yields an id we own
    pub creates_content: bool,
    /// At most one action of this kind per target inside this window
    pub per_target_window: Option<Duration>,
}

impl ActionPolicy {
    pub fn interval(min_interval: Duration) -> Self {
        Self {
            min_interval,
            window: None,
            max_per_window: 0,
            self_target_exempt: false,
            creates_content: false,
            per_target_window: None,
        }
    }

    pub fn with_quota(mut self, max_per_window: u32, window: Duration) -> Self {
        self.window = Some(window);
        self.max_per_window = max_per_window;
        self
    }

    pub fn creating_content(mut self) -> Self {
        self.creates_content = true;
        self
    }

    pub fn exempt_from_self_check(mut self) -> Self {
        self.self_target_exempt = true;
        self
    }

    pub fn once_per_target(mut self, window: Duration) -> Self {
        self.per_target_window = Some(window);
        self
    }
}

/// Gateway configuration
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub policies: HashMap<ActionKind, ActionPolicy>,
    /// Identical actions inside this window are duplicates
    pub dedup_window: Duration,
    /// Own handle, seeded into the self-action index
    pub own_handle: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        let day = Duration::from_secs(24 * 60 * 60);
        let mut policies = HashMap::new();
        policies.insert(
            ActionKind::Post,
            ActionPolicy::interval(Duration::from_secs(30 * 60)).creating_content(),
        );
        policies.insert(
            ActionKind::Comment,
            ActionPolicy::interval(Duration::from_secs(20))
                .with_quota(50, day)
                .once_per_target(Duration::from_secs(2 * 60 * 60))
                .creating_content(),
        );
        policies.insert(ActionKind::Vote, ActionPolicy::interval(Duration::from_secs(1)));
        policies.insert(
            ActionKind::DirectMessage,
            ActionPolicy::interval(Duration::from_secs(10)),
        );
        policies.insert(ActionKind::Follow, ActionPolicy::interval(Duration::from_secs(1)));
        policies.insert(
            ActionKind::DeletePost,
            ActionPolicy::interval(Duration::ZERO).exempt_from_self_check(),
        );

        Self {
            policies,
            dedup_window: Duration::from_secs(2 * 60 * 60),
            own_handle: None,
        }
    }
}

impl GatewayConfig {
    pub fn policy(&self, kind: ActionKind) -> ActionPolicy {
        self.policies
            .get(&kind)
            .cloned()
            .unwrap_or_else(|| ActionPolicy::interval(Duration::ZERO))
    }

    pub fn with_policy(mut self, kind: ActionKind, policy: ActionPolicy) -> Self {
        self.policies.insert(kind, policy);
        self
    }

    /// How long authorization records must be kept
    fn retention(&self) -> Duration {
        self.policies
            .values()
            .filter_map(|p| p.per_target_window)
            .fold(self.dedup_window, Duration::max)
    }
}

/// Cooldown state for one action kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CooldownRecord {
    pub action_kind: ActionKind,
    pub last_executed_at: Option<DateTime<Utc>>,
    pub count_in_window: u32,
    pub window_started_at: Option<DateTime<Utc>>,
    /// Reservation that last wrote this record
    #[serde(default)]
    pub reservation: u64,
}

impl CooldownRecord {
    fn new(action_kind: ActionKind) -> Self {
        Self {
            action_kind,
            last_executed_at: None,
            count_in_window: 0,
            window_started_at: None,
            reservation: 0,
        }
    }
}

/// Recently authorized action fingerprint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DedupEntry {
    pub fingerprint: String,
    pub kind: ActionKind,
    #[serde(default)]
    pub target: Option<String>,
    pub authorized_at: DateTime<Utc>,
}

/// Persisted gateway state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GatewaySnapshot {
    pub cooldowns: Vec<CooldownRecord>,
    /// Ids produced by our own actions (self-action index)
    pub self_actions: BTreeSet<String>,
    pub recent: Vec<DedupEntry>,
}

/// How a dispatch failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Network error or timeout; the action did not happen
    Transient,
    /// Platform rejected the action
    Permanent,
}

/// Held slot between `authorize` and `confirm`/`release_on_failure`
#[derive(Debug)]
#[must_use = "a reservation must be confirmed or released"]
pub struct Reservation {
    id: u64,
    kind: ActionKind,
    target: Option<String>,
    previous: CooldownRecord,
}

impl Reservation {
    pub fn kind(&self) -> ActionKind {
        self.kind
    }

    pub fn target(&self) -> Option<&str> {
        self.target.as_deref()
    }
}

/// Gateway counters
#[derive(Debug, Clone, Default)]
pub struct GatewayStats {
    pub authorized: u64,
    pub confirmed: u64,
    pub released: u64,
    pub rate_limited: u64,
    pub self_interactions: u64,
    pub duplicates: u64,
}

/// Cooldown, self-interaction and duplicate guard
pub struct ActionGateway {
    config: GatewayConfig,
    cooldowns: HashMap<ActionKind, CooldownRecord>,
    self_actions: BTreeSet<String>,
    recent: Vec<DedupEntry>,
    stats: GatewayStats,
    next_reservation: u64,
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
}

impl ActionGateway {
    pub fn open(config: GatewayConfig, store: Arc<dyn StateStore>, clock: Arc<dyn Clock>) -> Result<Self> {
        let snapshot = store.load_gateway()?.unwrap_or_default();
        let next_reservation = snapshot.cooldowns.iter().map(|r| r.reservation).max().unwrap_or(0) + 1;

        let mut gateway = Self {
            cooldowns: snapshot
                .cooldowns
                .into_iter()
                .map(|r| (r.action_kind, r))
                .collect(),
            self_actions: snapshot.self_actions,
            recent: snapshot.recent,
            stats: GatewayStats::default(),
            next_reservation,
            config,
            store,
            clock,
        };

        if let Some(handle) = gateway.config.own_handle.clone() {
            if gateway.self_actions.insert(handle) {
                gateway.persist()?;
            }
        }

        info!(
            "Action gateway opened: {} own ids, {} cooldowns",
            gateway.self_actions.len(),
            gateway.cooldowns.len()
        );
        Ok(gateway)
    }

    /// Check and reserve a slot for one action
    pub fn authorize(&mut self, kind: ActionKind, target: Option<&str>, content: Option<&str>) -> Result<Reservation> {
        let now = self.clock.now();
        let policy = self.config.policy(kind);

        if let Some(target) = target {
            if !policy.self_target_exempt && self.self_actions.contains(target) {
                self.stats.self_interactions += 1;
                return Err(Error::SelfInteraction {
                    kind,
                    target: target.to_string(),
                });
            }
        }

        let retention = self.config.retention();
        self.recent.retain(|e| elapsed_between(e.authorized_at, now) < retention);
        let dedup_window = self.config.dedup_window;
        let fingerprint = fingerprint(kind, target, content);
        if self
            .recent
            .iter()
            .any(|e| e.fingerprint == fingerprint && elapsed_between(e.authorized_at, now) < dedup_window)
        {
            self.stats.duplicates += 1;
            return Err(Error::DuplicateAction { kind });
        }

        if let (Some(window), Some(target)) = (policy.per_target_window, target) {
            let last_on_target = self
                .recent
                .iter()
                .filter(|e| e.kind == kind && e.target.as_deref() == Some(target))
                .map(|e| e.authorized_at)
                .max();
            if let Some(at) = last_on_target {
                let elapsed = elapsed_between(at, now);
                if elapsed < window {
                    self.stats.rate_limited += 1;
                    return Err(Error::RateLimited {
                        kind,
                        retry_after: window - elapsed,
                    });
                }
            }
        }

        let previous = self
            .cooldowns
            .get(&kind)
            .cloned()
            .unwrap_or_else(|| CooldownRecord::new(kind));
        let mut next = match reserve_slot(&previous, &policy, now) {
            Ok(next) => next,
            Err(retry_after) => {
                self.stats.rate_limited += 1;
                return Err(Error::RateLimited { kind, retry_after });
            }
        };
        let id = self.next_reservation;
        next.reservation = id;

        self.cooldowns.insert(kind, next);
        self.recent.push(DedupEntry {
            fingerprint,
            kind,
            target: target.map(str::to_string),
            authorized_at: now,
        });

        if let Err(e) = self.persist() {
            self.cooldowns.insert(kind, previous);
            self.recent.pop();
            return Err(e);
        }

        self.next_reservation += 1;
        self.stats.authorized += 1;
        debug!("Authorized {} (target {:?})", kind, target);
        Ok(Reservation {
            id,
            kind,
            target: target.map(str::to_string),
            previous,
        })
    }

    /// Record a successful dispatch
    pub fn confirm(&mut self, reservation: Reservation, external_id: Option<&str>) -> Result<()> {
        let policy = self.config.policy(reservation.kind);
        if let (true, Some(id)) = (policy.creates_content, external_id) {
            self.self_actions.insert(id.to_string());
        }
        self.persist()?;
        self.stats.confirmed += 1;
        debug!("Confirmed {} -> {:?}", reservation.kind, external_id);
        Ok(())
    }

    /// Report a failed dispatch; transient failures give the cooldown slot back
    ///
    /// The de-dup entry is kept either way: the call may have reached the
    /// platform before failing.
    pub fn release_on_failure(&mut self, reservation: Reservation, failure: FailureKind) -> Result<()> {
        if failure == FailureKind::Transient {
            let still_ours = self
                .cooldowns
                .get(&reservation.kind)
                .map(|r| r.reservation == reservation.id)
                .unwrap_or(false);
            if still_ours {
                self.cooldowns.insert(reservation.kind, reservation.previous);
                self.persist()?;
            }
        }
        self.stats.released += 1;
        info!("Released {} reservation after {:?} failure", reservation.kind, failure);
        Ok(())
    }

    /// Add an externally known own id (e.g. loaded from the platform profile)
    pub fn record_own(&mut self, id: &str) -> Result<()> {
        if self.self_actions.insert(id.to_string()) {
            self.persist()?;
        }
        Ok(())
    }

    pub fn is_own(&self, id: &str) -> bool {
        self.self_actions.contains(id)
    }

    pub fn own_ids(&self) -> &BTreeSet<String> {
        &self.self_actions
    }

    pub fn cooldown(&self, kind: ActionKind) -> Option<&CooldownRecord> {
        self.cooldowns.get(&kind)
    }

    /// Time until `kind` may run again, zero if ready
    pub fn retry_after(&self, kind: ActionKind) -> Duration {
        let policy = self.config.policy(kind);
        let record = self
            .cooldowns
            .get(&kind)
            .cloned()
            .unwrap_or_else(|| CooldownRecord::new(kind));
        match reserve_slot(&record, &policy, self.clock.now()) {
            Ok(_) => Duration::ZERO,
            Err(wait) => wait,
        }
    }

    pub fn stats(&self) -> &GatewayStats {
        &self.stats
    }

    pub fn snapshot(&self) -> GatewaySnapshot {
        let mut cooldowns: Vec<CooldownRecord> = self.cooldowns.values().cloned().collect();
        cooldowns.sort_by_key(|r| r.action_kind);
        GatewaySnapshot {
            cooldowns,
            self_actions: self.self_actions.clone(),
            recent: self.recent.clone(),
        }
    }

    fn persist(&self) -> Result<()> {
        self.store.save_gateway(&self.snapshot())
    }
}

/// Apply one action to a cooldown record, or return how long to wait
fn reserve_slot(
    record: &CooldownRecord,
    policy: &ActionPolicy,
    now: DateTime<Utc>,
) -> std::result::Result<CooldownRecord, Duration> {
    let mut next = record.clone();

    if let Some(last) = record.last_executed_at {
        let elapsed = elapsed_between(last, now);
        if elapsed < policy.min_interval {
            return Err(policy.min_interval - elapsed);
        }
    }

    if let Some(window) = policy.window {
        let expired = next
            .window_started_at
            .map(|start| elapsed_between(start, now) >= window)
            .unwrap_or(true);
        if expired {
            next.window_started_at = Some(now);
            next.count_in_window = 0;
        }
        if next.count_in_window >= policy.max_per_window {
            let started = next.window_started_at.unwrap_or(now);
            return Err(window.saturating_sub(elapsed_between(started, now)));
        }
        next.count_in_window += 1;
    }

    next.last_executed_at = Some(now);
    Ok(next)
}

fn fingerprint(kind: ActionKind, target: Option<&str>, content: Option<&str>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(kind.as_str().as_bytes());
    hasher.update([0u8]);
    hasher.update(target.unwrap_or("").as_bytes());
    hasher.update([0u8]);
    hasher.update(content.unwrap_or("").trim().as_bytes());
    hex::encode(&hasher.finalize()[..16])
}
