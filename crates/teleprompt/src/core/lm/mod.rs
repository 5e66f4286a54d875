//! Generative model collaborator.
//!
//! Every component that talks to a model receives it explicitly as an
//! `Arc<dyn GenerativeModel>` (or a borrow of one). There is no process-wide
//! model configuration.

mod mock;
mod usage;

pub use mock::*;
pub use usage::*;

use anyhow::Result;
use async_trait::async_trait;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Message role in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A message in a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Chat {
    pub messages: Vec<Message>,
}

impl Chat {
    pub fn new(messages: Vec<Message>) -> Self {
        Self { messages }
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn push_all(&mut self, other: Chat) {
        self.messages.extend(other.messages);
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last_user(&self) -> Option<&Message> {
        self.messages.iter().rev().find(|m| m.role == Role::User)
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(&self.messages).unwrap_or(Value::Null)
    }
}

/// Sampling configuration for a single request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LmConfig {
    /// Sampling temperature (0.0 - 2.0). `None` leaves the provider default.
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

impl LmConfig {
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, tokens: u32) -> Self {
        self.max_tokens = Some(tokens);
        self
    }
}

/// Structured prompt handed to a model.
///
/// `chat` is the rendered conversation a real provider sends over the wire.
/// `signature`, `instruction` and `inputs` carry the same request in
/// structured form so that deterministic stand-ins can answer without
/// parsing prose.
#[derive(Debug, Clone, PartialEq)]
pub struct LmRequest {
    pub signature: String,
    pub instruction: String,
    pub inputs: IndexMap<String, Value>,
    pub chat: Chat,
    pub config: LmConfig,
}

impl LmRequest {
    pub fn input_str(&self, field: &str) -> Option<&str> {
        self.inputs.get(field).and_then(|v| v.as_str())
    }
}

/// Raw completion from a model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LmResponse {
    pub content: String,
    #[serde(default)]
    pub usage: LmUsage,
    pub model: String,
}

/// The model collaborator used by predictor execution and by the candidate
/// proposer.
///
/// Implementations are nondeterministic and may fail (rate limits, timeouts);
/// callers treat a failure as the failure of that one operation.
#[async_trait]
pub trait GenerativeModel: Send + Sync {
    /// Name of this model (for logging/debugging).
    fn name(&self) -> &str;

    async fn invoke(&self, request: LmRequest) -> Result<LmResponse>;
}
