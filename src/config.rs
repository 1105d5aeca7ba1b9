//! Configuration management

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::agent::AgentConfig;
use crate::archival::ArchivalConfig;
use crate::consolidation::ConsolidationConfig;
use crate::conversation::ConversationConfig;
use crate::embeddings::{model_dimension, EmbeddingConfig, EmbeddingProvider, HashEmbedder, OllamaEmbedder};
use crate::gateway::{ActionKind, ActionPolicy, GatewayConfig};
use crate::platform::PlatformConfig;
use crate::reasoning::ReasoningConfig;
use crate::scheduler::SchedulerConfig;

/// Which embedding provider to use
#[derive(Debug, Clone)]
pub enum EmbedderKind {
    /// Offline feature hashing
    Hash { dimension: usize },
    Ollama(EmbeddingConfig),
}

impl EmbedderKind {
    pub fn build(&self) -> Result<Arc<dyn EmbeddingProvider>> {
        let provider: Arc<dyn EmbeddingProvider> = match self {
            EmbedderKind::Hash { dimension } => Arc::new(HashEmbedder::new(*dimension)),
            EmbedderKind::Ollama(config) => Arc::new(OllamaEmbedder::new(config.clone())?),
        };
        Ok(provider)
    }
}

/// Agent configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite database holding all agent state
    pub db_path: PathBuf,
    pub agent: AgentConfig,
    pub platform: PlatformConfig,
    pub reasoning: ReasoningConfig,
    pub embedder: EmbedderKind,
    pub scheduler: SchedulerConfig,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from any key lookup
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let db_path = get("OPENMOLT_DB_PATH").map(PathBuf::from).unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("openmolt")
                .join("agent.db")
        });

        let handle = get("OPENMOLT_HANDLE").unwrap_or_else(|| "openmolt".to_string());

        let mut platform = PlatformConfig {
            api_key: get("OPENMOLT_API_KEY").unwrap_or_default(),
            ..PlatformConfig::default()
        };
        if let Some(url) = get("OPENMOLT_BASE_URL") {
            platform.base_url = url.trim_end_matches('/').to_string();
        }
        if let Some(community) = get("OPENMOLT_COMMUNITY") {
            platform.default_community = community;
        }

        let mut reasoning = ReasoningConfig {
            api_key: get("OPENMOLT_LLM_API_KEY"),
            ..ReasoningConfig::default()
        };
        if let Some(url) = get("OPENMOLT_LLM_URL") {
            reasoning.url = url;
        }
        if let Some(model) = get("OPENMOLT_LLM_MODEL") {
            reasoning.model = model;
        }
        reasoning.max_tokens = parse_or(&get, "OPENMOLT_LLM_MAX_TOKENS", reasoning.max_tokens)?;

        let embedder = match get("OPENMOLT_EMBEDDER").as_deref().unwrap_or("hash") {
            "ollama" => {
                let mut config = EmbeddingConfig::default();
                if let Some(url) = get("OLLAMA_URL") {
                    config.base_url = url.trim_end_matches('/').to_string();
                }
                if let Some(model) = get("OPENMOLT_EMBEDDING_MODEL") {
                    config.dimension = model_dimension(&model);
                    config.model = model;
                }
                config.dimension = parse_or(&get, "OPENMOLT_EMBEDDING_DIM", config.dimension)?;
                EmbedderKind::Ollama(config)
            }
            "hash" => EmbedderKind::Hash {
                dimension: parse_or(&get, "OPENMOLT_EMBEDDING_DIM", 256)?,
            },
            other => anyhow::bail!("OPENMOLT_EMBEDDER must be 'hash' or 'ollama', got '{}'", other),
        };

        let conversation = ConversationConfig {
            capacity: parse_or(&get, "OPENMOLT_HISTORY_CAPACITY", ConversationConfig::default().capacity)?,
            eviction_batch: parse_or(&get, "OPENMOLT_EVICTION_BATCH", ConversationConfig::default().eviction_batch)?,
            ..ConversationConfig::default()
        };
        anyhow::ensure!(conversation.capacity > 0, "OPENMOLT_HISTORY_CAPACITY must be positive");

        let consolidation = ConsolidationConfig {
            interval: minutes(parse_or(&get, "OPENMOLT_CONSOLIDATION_MINUTES", 15u64)?),
            near_full_margin: parse_or(&get, "OPENMOLT_NEAR_FULL_MARGIN", 0.1f64)?,
            ..ConsolidationConfig::default()
        };
        anyhow::ensure!(
            (0.0..1.0).contains(&consolidation.near_full_margin),
            "OPENMOLT_NEAR_FULL_MARGIN must be in [0, 1)"
        );

        let archival = ArchivalConfig {
            importance_weight: parse_or(&get, "OPENMOLT_IMPORTANCE_WEIGHT", 0.0f32)?,
            tolerance_band: parse_or(&get, "OPENMOLT_TOLERANCE_BAND", 0.01f32)?,
            ..ArchivalConfig::default()
        };
        anyhow::ensure!(
            (0.0..=1.0).contains(&archival.importance_weight),
            "OPENMOLT_IMPORTANCE_WEIGHT must be in [0, 1]"
        );

        let mut gateway = GatewayConfig {
            dedup_window: seconds(parse_or(&get, "OPENMOLT_DEDUP_WINDOW_SECS", 2 * 60 * 60u64)?),
            own_handle: Some(handle.clone()),
            ..GatewayConfig::default()
        };
        let post_secs = parse_or(&get, "OPENMOLT_POST_COOLDOWN_SECS", 30 * 60u64)?;
        gateway = gateway.with_policy(
            ActionKind::Post,
            ActionPolicy::interval(seconds(post_secs)).creating_content(),
        );
        let comment_secs = parse_or(&get, "OPENMOLT_COMMENT_COOLDOWN_SECS", 20u64)?;
        let daily_comments = parse_or(&get, "OPENMOLT_DAILY_COMMENT_CAP", 50u32)?;
        let per_post_secs = parse_or(&get, "OPENMOLT_COMMENT_TARGET_WINDOW_SECS", 2 * 60 * 60u64)?;
        let mut comment_policy = ActionPolicy::interval(seconds(comment_secs))
            .with_quota(daily_comments, Duration::from_secs(24 * 60 * 60))
            .creating_content();
        if per_post_secs > 0 {
            comment_policy = comment_policy.once_per_target(seconds(per_post_secs));
        }
        gateway = gateway.with_policy(ActionKind::Comment, comment_policy);

        let scheduler = SchedulerConfig {
            poll_interval: minutes(parse_or(&get, "OPENMOLT_POLL_MINUTES", 3u64)?),
            cycle_timeout: seconds(parse_or(&get, "OPENMOLT_CYCLE_TIMEOUT_SECS", 300u64)?),
            recall_top_k: parse_or(&get, "OPENMOLT_RECALL_TOP_K", 5usize)?,
            ..SchedulerConfig::default()
        };
        anyhow::ensure!(!scheduler.poll_interval.is_zero(), "OPENMOLT_POLL_MINUTES must be positive");

        Ok(Self {
            db_path,
            agent: AgentConfig {
                handle,
                archival,
                conversation,
                consolidation,
                gateway,
                seen_post_capacity: parse_or(&get, "OPENMOLT_SEEN_POSTS", 100usize)?,
                ..AgentConfig::default()
            },
            platform,
            reasoning,
            embedder,
            scheduler,
        })
    }
}

fn parse_or<T>(get: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match get(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid value for {}: '{}'", key, raw)),
        _ => Ok(default),
    }
}

fn seconds(secs: u64) -> Duration {
    Duration::from_secs(secs)
}

fn minutes(mins: u64) -> Duration {
    Duration::from_secs(mins * 60)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.agent.handle, "openmolt");
        assert_eq!(config.agent.gateway.own_handle.as_deref(), Some("openmolt"));
        assert_eq!(config.agent.conversation.capacity, 50);
        assert_eq!(config.scheduler.poll_interval, Duration::from_secs(180));
        assert!(matches!(config.embedder, EmbedderKind::Hash { dimension: 256 }));
        assert!(config.db_path.ends_with("openmolt/agent.db"));

        let comment = config.agent.gateway.policy(ActionKind::Comment);
        assert_eq!(comment.max_per_window, 50);
        assert_eq!(comment.min_interval, Duration::from_secs(20));
        assert_eq!(comment.per_target_window, Some(Duration::from_secs(2 * 60 * 60)));
        assert_eq!(config.agent.seen_post_capacity, 100);
    }

    #[test]
    fn test_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("OPENMOLT_HANDLE", "crabby"),
            ("OPENMOLT_DB_PATH", "/tmp/x.db"),
            ("OPENMOLT_EMBEDDER", "ollama"),
            ("OPENMOLT_EMBEDDING_MODEL", "all-minilm"),
            ("OPENMOLT_POST_COOLDOWN_SECS", "60"),
            ("OPENMOLT_BASE_URL", "http://localhost:9000/api/"),
            ("OPENMOLT_COMMENT_TARGET_WINDOW_SECS", "0"),
        ]))
        .unwrap();
        assert_eq!(config.agent.handle, "crabby");
        assert_eq!(config.db_path, PathBuf::from("/tmp/x.db"));
        assert_eq!(config.platform.base_url, "http://localhost:9000/api");
        match &config.embedder {
            EmbedderKind::Ollama(e) => assert_eq!(e.dimension, 384),
            other => panic!("unexpected embedder {:?}", other),
        }
        assert_eq!(
            config.agent.gateway.policy(ActionKind::Post).min_interval,
            Duration::from_secs(60)
        );
        assert_eq!(config.agent.gateway.policy(ActionKind::Comment).per_target_window, None);
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(Config::from_lookup(lookup(&[("OPENMOLT_HISTORY_CAPACITY", "lots")])).is_err());
        assert!(Config::from_lookup(lookup(&[("OPENMOLT_HISTORY_CAPACITY", "0")])).is_err());
        assert!(Config::from_lookup(lookup(&[("OPENMOLT_EMBEDDER", "magic")])).is_err());
        assert!(Config::from_lookup(lookup(&[("OPENMOLT_NEAR_FULL_MARGIN", "1.5")])).is_err());
    }
}
