use anyhow::Result;
use async_trait::async_trait;
use indexmap::IndexMap;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};

use super::{GenerativeModel, LmRequest, LmResponse, LmUsage};
use crate::adapter::render_fields;

type Responder = Box<dyn Fn(&LmRequest) -> Result<String> + Send + Sync>;

enum Behavior {
    Cycle(Vec<String>),
    Respond(Responder),
}

/// Deterministic model for tests and demos.
///
/// Either cycles through canned responses or answers each request with a
/// caller-supplied function of the structured request.
pub struct MockLm {
    name: String,
    behavior: Behavior,
    calls: AtomicU64,
    tokens: AtomicU64,
}

impl MockLm {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            behavior: Behavior::Cycle(vec!["Mock response".to_string()]),
            calls: AtomicU64::new(0),
            tokens: AtomicU64::new(0),
        }
    }

    /// Set custom responses (cycles through them).
    pub fn with_responses(mut self, responses: Vec<String>) -> Self {
        self.behavior = Behavior::Cycle(responses);
        self
    }

    /// Answer each request with the raw text `f` returns.
    pub fn with_responder<F>(mut self, f: F) -> Self
    where
        F: Fn(&LmRequest) -> Result<String> + Send + Sync + 'static,
    {
        self.behavior = Behavior::Respond(Box::new(f));
        self
    }

    /// Answer each request with output fields, rendered in the
    /// `[[ ## field ## ]]` format the chat adapter parses.
    pub fn with_fields<F>(self, f: F) -> Self
    where
        F: Fn(&LmRequest) -> Result<IndexMap<String, Value>> + Send + Sync + 'static,
    {
        self.with_responder(move |request| {
            let fields = f(request)?;
            Ok(render_fields(&fields))
        })
    }

    /// Number of `invoke` calls so far, failed ones included.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn total_tokens(&self) -> u64 {
        self.tokens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GenerativeModel for MockLm {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, request: LmRequest) -> Result<LmResponse> {
        let idx = self.calls.fetch_add(1, Ordering::SeqCst) as usize;

        let content = match &self.behavior {
            Behavior::Cycle(responses) if responses.is_empty() => {
                anyhow::bail!("{} has no responses configured", self.name)
            }
            Behavior::Cycle(responses) => responses[idx % responses.len()].clone(),
            Behavior::Respond(f) => f(&request)?,
        };

        // Estimate tokens from text length
        let prompt_len: usize = request.chat.messages.iter().map(|m| m.content.len()).sum();
        let usage = LmUsage::new(prompt_len as u64 / 4 + 1, content.len() as u64 / 4 + 1);
        self.tokens.fetch_add(usage.total_tokens, Ordering::SeqCst);

        Ok(LmResponse {
            content,
            usage,
            model: self.name.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Chat;

    fn request() -> LmRequest {
        LmRequest {
            signature: "QA".to_string(),
            instruction: String::new(),
            inputs: crate::fields! { "question" => "What is 2+2?" },
            chat: Chat::default(),
            config: Default::default(),
        }
    }

    #[tokio::test]
    async fn test_mock_lm_custom_responses() {
        let lm = MockLm::new("test").with_responses(vec!["First".to_string(), "Second".to_string()]);

        let r1 = lm.invoke(request()).await.unwrap();
        let r2 = lm.invoke(request()).await.unwrap();
        let r3 = lm.invoke(request()).await.unwrap();

        assert_eq!(r1.content, "First");
        assert_eq!(r2.content, "Second");
        assert_eq!(r3.content, "First"); // Cycles back
        assert_eq!(lm.calls(), 3);
    }

    #[tokio::test]
    async fn test_mock_lm_fields_are_rendered() {
        let lm = MockLm::new("fields").with_fields(|req| {
            let question = req.input_str("question").unwrap_or_default();
            Ok(crate::fields! { "answer" => format!("echo: {question}") })
        });

        let response = lm.invoke(request()).await.unwrap();
        assert!(response.content.contains("[[ ## answer ## ]]"));
        assert!(response.content.contains("echo: What is 2+2?"));
        assert!(response.usage.total_tokens > 0);
    }

    #[tokio::test]
    async fn test_mock_lm_responder_error() {
        let lm = MockLm::new("broken").with_responder(|_| anyhow::bail!("rate limited"));
        assert!(lm.invoke(request()).await.is_err());
        assert_eq!(lm.calls(), 1);
    }
}
