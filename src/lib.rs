//! OpenMolt Agent Core
//!
//! Memory and action gating for an autonomous social-feed agent.
//!
//! # Features
//!
//! - **Working Memory**: bounded named blocks edited in place, atomically
//! - **Archival Memory**: append-only, embedding-indexed long-term store
//! - **Conversation Log**: bounded history with never-reused sequence numbers
//! - **Consolidation**: moves material to archival memory without losing salient text
//! - **Action Gateway**: cooldowns, quotas, self-interaction and duplicate guards
//! - **Cycle Scheduler**: single-flight decision loop with pause/resume
//!
//! # Architecture
//!
//! ```text
//! Trigger ──► CycleScheduler ──► ReasoningEngine (LLM)
//!                  │
//!                  ├── WorkingMemory ──┐
//!                  ├── ArchivalStore ◄─┼── Consolidator
//!                  ├── ConversationLog ┘
//!                  └── ActionGateway ──► PlatformClient (REST)
//!
//!            all state ──► StateStore (SQLite)
//! ```

pub mod agent;
pub mod archival;
pub mod clock;
pub mod config;
pub mod consolidation;
pub mod conversation;
pub mod embeddings;
pub mod error;
pub mod gateway;
pub mod platform;
pub mod reasoning;
pub mod retry;
pub mod scheduler;
pub mod store;
pub mod working_memory;

pub use agent::{Agent, AgentConfig, OpOutcome};
pub use archival::{ArchivalConfig, ArchivalEntry, ArchivalStats, ArchivalStore, SearchHit, SearchHits};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{Config, EmbedderKind};
pub use consolidation::{
    ConsolidationConfig, ConsolidationPolicy, ConsolidationReport, ConsolidationTrigger, Consolidator, DefaultPolicy,
};
pub use conversation::{ConversationConfig, ConversationLog, ConversationTurn, Role, Salience};
pub use embeddings::{cosine_similarity, EmbeddingConfig, EmbeddingProvider, HashEmbedder, OllamaEmbedder};
pub use error::{Error, Result};
pub use gateway::{
    ActionGateway, ActionKind, ActionPolicy, CooldownRecord, FailureKind, GatewayConfig, GatewaySnapshot,
    GatewayStats, Reservation,
};
pub use platform::{
    ActionRequest, DispatchError, DispatchReceipt, FeedItem, HttpPlatformClient, PlatformClient, PlatformConfig,
};
pub use reasoning::{ChatReasoningEngine, CycleContext, ReasoningConfig, ReasoningEngine, RequestedOp};
pub use retry::RetryPolicy;
pub use scheduler::{CycleReport, CycleScheduler, SchedulerConfig, SchedulerHandle, SchedulerState, SchedulerStatus};
pub use store::{InMemoryStore, SqliteStore, StateStore};
pub use working_memory::{BlockSpec, MemoryBlock, WorkingMemory, WorkingMemoryConfig};
