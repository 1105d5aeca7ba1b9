//! Reasoning Engine Boundary
//!
//! The language model sees an assembled context and answers with an ordered
//! list of operations. Its free-form output is parsed into the closed
//! [`RequestedOp`] enum and validated here, before anything is applied.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::conversation::ConversationTurn;
use crate::error::{Error, Result};
use crate::gateway::ActionKind;
use crate::platform::{ActionRequest, FeedItem};

fn default_importance() -> f32 {
    0.5
}

/// One operation proposed by the reasoning engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum RequestedOp {
    Rethink {
        block: String,
        content: String,
        #[serde(default)]
        important: bool,
    },
    Replace {
        block: String,
        old: String,
        new: String,
        #[serde(default)]
        important: bool,
    },
    Insert {
        block: String,
        #[serde(default)]
        line: i64,
        text: String,
        #[serde(default)]
        important: bool,
    },
    ArchivalInsert {
        text: String,
        #[serde(default)]
        tags: Vec<String>,
        #[serde(default = "default_importance")]
        importance: f32,
    },
    Action {
        kind: ActionKind,
        #[serde(default)]
        target: Option<String>,
        #[serde(default)]
        content: Option<String>,
        #[serde(default)]
        title: Option<String>,
    },
    Noop,
}

impl RequestedOp {
    /// Reject malformed operations before they reach memory or the gateway
    pub fn validate(&self) -> Result<()> {
        let blank = |s: &Option<String>| s.as_deref().map(str::trim).unwrap_or_default().is_empty();
        match self {
            RequestedOp::Rethink { block, .. }
            | RequestedOp::Replace { block, .. }
            | RequestedOp::Insert { block, .. }
                if block.trim().is_empty() =>
            {
                Err(Error::InvalidOperation("edit without a block name".into()))
            }
            RequestedOp::ArchivalInsert { text, .. } if text.trim().is_empty() => {
                Err(Error::InvalidOperation("archival insert without text".into()))
            }
            RequestedOp::ArchivalInsert { importance, .. } if !importance.is_finite() => {
                Err(Error::InvalidOperation("importance is not a number".into()))
            }
            RequestedOp::Action {
                kind, target, content, ..
            } => {
                let needs_target = !matches!(kind, ActionKind::Post);
                let needs_content = matches!(kind, ActionKind::Post | ActionKind::Comment | ActionKind::DirectMessage);
                if needs_target && blank(target) {
                    return Err(Error::InvalidOperation(format!("{} without a target", kind)));
                }
                if needs_content && blank(content) {
                    return Err(Error::InvalidOperation(format!("{} without content", kind)));
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Whether the operation was flagged important by the engine
    pub fn is_important(&self) -> bool {
        match self {
            RequestedOp::Rethink { important, .. }
            | RequestedOp::Replace { important, .. }
            | RequestedOp::Insert { important, .. } => *important,
            RequestedOp::ArchivalInsert { importance, .. } => *importance >= 0.9,
            _ => false,
        }
    }

    /// Gateway request for an action, `None` for memory operations
    pub fn action_request(&self) -> Option<ActionRequest> {
        match self {
            RequestedOp::Action {
                kind,
                target,
                content,
                title,
            } => Some(ActionRequest {
                kind: *kind,
                target: target.clone(),
                content: content.clone(),
                title: title.clone(),
            }),
            _ => None,
        }
    }

    /// Short form for the conversation log
    pub fn describe(&self) -> String {
        match self {
            RequestedOp::Rethink { block, content, .. } => format!("rethink {}: {}", block, content),
            RequestedOp::Replace { block, old, new, .. } => format!("replace in {}: '{}' -> '{}'", block, old, new),
            RequestedOp::Insert { block, line, text, .. } => format!("insert into {} at {}: {}", block, line, text),
            RequestedOp::ArchivalInsert { text, .. } => format!("archive: {}", text),
            RequestedOp::Action {
                kind, target, content, ..
            } => {
                let mut out = kind.to_string();
                if let Some(t) = target {
                    out.push_str(&format!(" -> {}", t));
                }
                if let Some(c) = content {
                    out.push_str(&format!(": {}", c));
                }
                out
            }
            RequestedOp::Noop => "noop".to_string(),
        }
    }
}

/// Everything the engine sees in one cycle
#[derive(Debug, Clone)]
pub struct CycleContext {
    pub handle: String,
    /// Rendered working memory blocks
    pub memory: String,
    /// Archival entries recalled for this cycle
    pub recalled: Vec<String>,
    pub recent_turns: Vec<ConversationTurn>,
    pub feed: Vec<FeedItem>,
    pub now: DateTime<Utc>,
}

impl CycleContext {
    pub fn to_prompt(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("You are {}. Current time: {}\n\n", self.handle, self.now.to_rfc3339()));
        out.push_str(&self.memory);
        out.push_str("\n\n<archival_recall>\n");
        for text in &self.recalled {
            out.push_str(&format!("- {}\n", text));
        }
        out.push_str("</archival_recall>\n\n<recent_conversation>\n");
        for turn in &self.recent_turns {
            out.push_str(&format!("[{}] {}: {}\n", turn.sequence_no, turn.role.as_str(), turn.content));
        }
        out.push_str("</recent_conversation>\n\n<feed>\n");
        for item in &self.feed {
            out.push_str(&format!("[{}] {} - {}\n{}\n", item.id, item.author, item.title, item.content));
        }
        out.push_str("</feed>");
        out
    }
}

/// Language model collaborator
#[async_trait]
pub trait ReasoningEngine: Send + Sync {
    async fn decide(&self, context: &CycleContext) -> Result<Vec<RequestedOp>>;
}

const SYSTEM_PROMPT: &str = r#"You are an autonomous agent on a social feed. Reply with a single JSON object:
{"operations": [ ... ]}
Each operation has an "op" field:
- {"op":"rethink","block":NAME,"content":TEXT,"important":BOOL}
- {"op":"replace","block":NAME,"old":TEXT,"new":TEXT,"important":BOOL}
- {"op":"insert","block":NAME,"line":N,"text":TEXT,"important":BOOL}
- {"op":"archival_insert","text":TEXT,"tags":[...],"importance":0..1}
- {"op":"action","kind":"post|comment|vote|dm|follow|delete_post","target":ID,"content":TEXT,"title":TEXT}
- {"op":"noop"}
Operations run in order. Memory blocks have hard size limits."#;

/// Parse engine output into operations, skipping invalid entries
pub fn parse_operations(text: &str) -> Result<Vec<RequestedOp>> {
    let trimmed = text.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|s| s.strip_suffix("```"))
        .unwrap_or(trimmed)
        .trim();

    let value: serde_json::Value = serde_json::from_str(body)
        .map_err(|e| Error::InvalidOperation(format!("engine output is not JSON: {}", e)))?;

    let raw = match value {
        serde_json::Value::Object(mut map) => match map.remove("operations") {
            Some(serde_json::Value::Array(items)) => items,
            _ => return Err(Error::InvalidOperation("missing operations array".into())),
        },
        serde_json::Value::Array(items) => items,
        _ => return Err(Error::InvalidOperation("unexpected engine output".into())),
    };

    let mut ops = Vec::with_capacity(raw.len());
    for item in raw {
        match serde_json::from_value::<RequestedOp>(item) {
            Ok(op) => match op.validate() {
                Ok(()) => ops.push(op),
                Err(e) => warn!("Dropping operation: {}", e),
            },
            Err(e) => warn!("Dropping unparseable operation: {}", e),
        }
    }
    Ok(ops)
}

/// Settings for an OpenAI-compatible chat endpoint
#[derive(Debug, Clone)]
pub struct ReasoningConfig {
    pub url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
    pub max_tokens: usize,
}

impl Default for ReasoningConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:11434/v1".to_string(),
            model: "llama3.1".to_string(),
            api_key: None,
            timeout: Duration::from_secs(120),
            max_tokens: 2048,
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: usize,
    response_format: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Debug, Deserialize)]
struct ChatReply {
    #[serde(default)]
    content: Option<String>,
}

/// Reasoning through `/chat/completions`
pub struct ChatReasoningEngine {
    client: Client,
    config: ReasoningConfig,
}

impl ChatReasoningEngine {
    pub fn new(config: ReasoningConfig) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(config.timeout).build()?;
        info!("Reasoning engine: {} at {}", config.model, config.url);
        Ok(Self { client, config })
    }
}

#[async_trait]
impl ReasoningEngine for ChatReasoningEngine {
    async fn decide(&self, context: &CycleContext) -> Result<Vec<RequestedOp>> {
        let prompt = context.to_prompt();
        let request = ChatRequest {
            model: &self.config.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                ChatMessage {
                    role: "user",
                    content: &prompt,
                },
            ],
            max_tokens: self.config.max_tokens,
            response_format: serde_json::json!({ "type": "json_object" }),
        };

        let url = format!("{}/chat/completions", self.config.url.trim_end_matches('/'));
        let mut builder = self.client.post(&url).json(&request);
        if let Some(key) = &self.config.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| Error::ReasoningEngineUnavailable(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(Error::ReasoningEngineUnavailable(format!(
                "{}: {}",
                status,
                text.chars().take(200).collect::<String>()
            )));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| Error::ReasoningEngineUnavailable(format!("bad response: {}", e)))?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();

        let ops = parse_operations(&content)?;
        debug!("Engine proposed {} operations", ops.len());
        Ok(ops)
    }
}
