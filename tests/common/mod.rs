//! Fake collaborators shared by the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use openmolt::{
    ActionKind, ActionRequest, Agent, AgentConfig, CycleContext, DispatchError, DispatchReceipt, FeedItem,
    HashEmbedder, ManualClock, PlatformClient, ReasoningEngine, RequestedOp, StateStore,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

/// Platform that records every dispatch and hands out sequential ids
#[derive(Default)]
pub struct FakePlatform {
    pub sent: Mutex<Vec<ActionRequest>>,
    pub feed: Mutex<Vec<FeedItem>>,
    /// Consumed front to back before falling back to success
    pub failures: Mutex<Vec<DispatchError>>,
    next_id: AtomicUsize,
}

impl FakePlatform {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn kinds_sent(&self) -> Vec<ActionKind> {
        self.sent.lock().iter().map(|r| r.kind).collect()
    }
}

#[async_trait]
impl PlatformClient for FakePlatform {
    async fn dispatch(&self, request: &ActionRequest) -> Result<DispatchReceipt, DispatchError> {
        self.sent.lock().push(request.clone());
        {
            let mut failures = self.failures.lock();
            if !failures.is_empty() {
                return Err(failures.remove(0));
            }
        }
        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let external_id = match request.kind {
            ActionKind::Post => Some(format!("post-{}", n)),
            ActionKind::Comment => Some(format!("comment-{}", n)),
            _ => None,
        };
        Ok(DispatchReceipt { external_id })
    }

    async fn fetch_feed(&self, limit: usize) -> Result<Vec<FeedItem>, DispatchError> {
        Ok(self.feed.lock().iter().take(limit).cloned().collect())
    }
}

/// Engine that replays scripted batches, then answers with nothing
#[derive(Default)]
pub struct ScriptedEngine {
    batches: Mutex<Vec<Vec<RequestedOp>>>,
    pub calls: AtomicUsize,
    pub contexts: Mutex<Vec<CycleContext>>,
    /// When set, each call waits for a permit
    gate: Option<Arc<Semaphore>>,
    /// Simulated thinking time
    delay: Option<Duration>,
}

impl ScriptedEngine {
    pub fn new(batches: Vec<Vec<RequestedOp>>) -> Arc<Self> {
        Arc::new(Self {
            batches: Mutex::new(batches),
            ..Self::default()
        })
    }

    pub fn gated(gate: Arc<Semaphore>) -> Arc<Self> {
        Arc::new(Self {
            gate: Some(gate),
            ..Self::default()
        })
    }

    pub fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay: Some(delay),
            ..Self::default()
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReasoningEngine for ScriptedEngine {
    async fn decide(&self, context: &CycleContext) -> openmolt::Result<Vec<RequestedOp>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.contexts.lock().push(context.clone());
        if let Some(gate) = &self.gate {
            let permit = gate
                .acquire()
                .await
                .map_err(|e| openmolt::Error::ReasoningEngineUnavailable(e.to_string()))?;
            permit.forget();
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let mut batches = self.batches.lock();
        if batches.is_empty() {
            Ok(Vec::new())
        } else {
            Ok(batches.remove(0))
        }
    }
}

pub fn agent_config(handle: &str) -> AgentConfig {
    AgentConfig {
        handle: handle.to_string(),
        ..AgentConfig::default()
    }
}

pub fn open_agent(
    config: AgentConfig,
    store: Arc<dyn StateStore>,
    platform: Arc<FakePlatform>,
    clock: Arc<ManualClock>,
) -> Agent {
    Agent::open(config, store, Arc::new(HashEmbedder::new(128)), platform, clock).unwrap()
}

pub fn action(kind: ActionKind, target: Option<&str>, content: Option<&str>) -> RequestedOp {
    RequestedOp::Action {
        kind,
        target: target.map(str::to_string),
        content: content.map(str::to_string),
        title: None,
    }
}

pub fn feed_item(id: &str, author: &str, title: &str) -> FeedItem {
    FeedItem {
        id: id.to_string(),
        author: author.to_string(),
        title: title.to_string(),
        content: format!("{} body", title),
    }
}

/// Poll until `check` holds, panicking after two seconds
pub async fn wait_for(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}
