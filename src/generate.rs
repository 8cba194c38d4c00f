//! Text generation behind a bounded worker pool.
//!
//! The engine never calls the language model itself; analysis workflows do,
//! through [`GenerationPool`]. The pool holds a semaphore sized by
//! `generation.max_concurrency` (default 1), so a batch of analyses never has
//! more requests in flight than the model service is meant to take.
//!
//! | Provider | Implementation |
//! |----------|----------------|
//! | `openai` | [`OpenAiGenerator`], `POST {url}/chat/completions` |
//! | `disabled` | no generator; analysis endpoints report `generation_disabled` |

use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::Semaphore;

use crate::config::GenerationConfig;
use crate::engine::ContextResponse;
use crate::openai::OpenAiClient;

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a quality-engineering analyst. \
Base your answer on the supplied context records and cite them by their Source title. \
When the context is a sample, extrapolate findings to the full corpus it was drawn from.";

/// A chat-style prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Prompt {
    pub system: String,
    pub user: String,
}

/// Assemble the prompt for one analysis: instructions, then the formatted
/// context block.
pub fn build_prompt(system_prompt: Option<&str>, task: &str, context: &ContextResponse) -> Prompt {
    let user = format!(
        "Task:\n{task}\n\nContext ({used} of {found} retrieved items):\n{text}",
        task = task.trim(),
        used = context.meta.items_used,
        found = context.meta.items_found,
        text = context.context_text,
    );
    Prompt {
        system: system_prompt.unwrap_or(DEFAULT_SYSTEM_PROMPT).to_string(),
        user,
    }
}

#[async_trait]
pub trait TextGenerator: Send + Sync {
    fn model_name(&self) -> &str;

    async fn generate(&self, prompt: &Prompt) -> Result<String>;
}

/// Build the generator named by `config.provider`, or `None` when disabled.
pub fn create_generator(config: &GenerationConfig) -> Result<Option<Arc<dyn TextGenerator>>> {
    match config.provider.as_str() {
        "disabled" => Ok(None),
        "openai" => Ok(Some(Arc::new(OpenAiGenerator::new(config)?))),
        other => bail!("Unknown generation provider: {}", other),
    }
}

// ============ OpenAI-compatible ============

pub struct OpenAiGenerator {
    model: String,
    temperature: Option<f32>,
    client: OpenAiClient,
}

impl OpenAiGenerator {
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow!("generation.model required for OpenAI provider"))?;
        let client = OpenAiClient::new(
            config.url.as_deref(),
            config.timeout_secs,
            config.max_retries,
        )?;
        Ok(Self {
            model,
            temperature: config.temperature,
            client,
        })
    }
}

#[async_trait]
impl TextGenerator for OpenAiGenerator {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, prompt: &Prompt) -> Result<String> {
        let mut body = serde_json::json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": prompt.system},
                {"role": "user", "content": prompt.user},
            ],
        });
        if let Some(t) = self.temperature {
            body["temperature"] = serde_json::json!(t);
        }
        let json = self.client.post_json("chat/completions", &body).await?;
        parse_chat_response(&json)
    }
}

/// Extract `choices[0].message.content`.
fn parse_chat_response(json: &serde_json::Value) -> Result<String> {
    json.get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .map(str::to_string)
        .ok_or_else(|| anyhow!("Invalid chat completion response: missing choices[0].message.content"))
}

// ============ Pool ============

/// Bounded-concurrency front for a [`TextGenerator`].
#[derive(Clone)]
pub struct GenerationPool {
    generator: Arc<dyn TextGenerator>,
    permits: Arc<Semaphore>,
    max_concurrency: usize,
}

impl GenerationPool {
    pub fn new(generator: Arc<dyn TextGenerator>, max_concurrency: usize) -> Self {
        let max_concurrency = max_concurrency.max(1);
        Self {
            generator,
            permits: Arc::new(Semaphore::new(max_concurrency)),
            max_concurrency,
        }
    }

    /// Pool for `config`, or `None` when generation is disabled.
    pub fn from_config(config: &GenerationConfig) -> Result<Option<Self>> {
        Ok(create_generator(config)?.map(|g| Self::new(g, config.max_concurrency)))
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    pub fn model_name(&self) -> &str {
        self.generator.model_name()
    }

    /// Run one prompt once a slot is free.
    pub async fn submit(&self, prompt: &Prompt) -> Result<String> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| anyhow!("generation pool closed"))?;
        let started = std::time::Instant::now();
        let result = self.generator.generate(prompt).await;
        tracing::debug!(
            model = self.generator.model_name(),
            ok = result.is_ok(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "generation finished"
        );
        result
    }

    /// Run every prompt through the pool. Results come back in submission
    /// order regardless of completion order.
    pub async fn run_batch(&self, prompts: Vec<Prompt>) -> Vec<Result<String>> {
        let handles: Vec<_> = prompts
            .into_iter()
            .map(|prompt| {
                let pool = self.clone();
                tokio::spawn(async move { pool.submit(&prompt).await })
            })
            .collect();

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            results.push(match handle.await {
                Ok(r) => r,
                Err(e) => Err(anyhow!("generation task failed: {e}")),
            });
        }
        results
    }
}
