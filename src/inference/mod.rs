#[cfg(feature = "llama-cpp")]
pub mod llama_cpp_service;

use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, bail, Result};
use tracing::{debug, info};
use uuid::Uuid;

/// Sampling knobs handed to the generator for a single request.
#[derive(Clone, Debug, PartialEq)]
pub struct GenerationParams {
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub repeat_penalty: Option<f32>,
    pub stop: Vec<String>,
}

impl GenerationParams {
    pub fn validate(&self) -> Result<()> {
        if self.max_tokens == 0 {
            bail!("max_tokens must be a positive integer");
        }
        if !(0.0..=1.0).contains(&self.temperature) {
            bail!("temperature must be between 0 and 1, got {}", self.temperature);
        }
        if !(0.0..=1.0).contains(&self.top_p) {
            bail!("top_p must be between 0 and 1, got {}", self.top_p);
        }
        if let Some(penalty) = self.repeat_penalty {
            if !penalty.is_finite() || penalty <= 0.0 {
                bail!("repeat_penalty must be a positive number, got {penalty}");
            }
        }
        Ok(())
    }
}

/// What a generator hands back: either the whole text or the pieces it
/// produced along the way.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RawCompletion {
    Text(String),
    Chunks(Vec<String>),
}

impl RawCompletion {
    pub fn into_text(self) -> String {
        match self {
            RawCompletion::Text(text) => text,
            RawCompletion::Chunks(chunks) => chunks.concat(),
        }
    }
}

/// Blocking text generator backed by a loaded model.
pub trait TextGenerator: Send + Sync {
    fn generate(&self, prompt: &str, params: &GenerationParams) -> Result<RawCompletion>;
}

/// Cuts `text` at the earliest occurrence of any non-empty stop sentinel.
pub fn truncate_at_stop<'a>(text: &'a str, stops: &[String]) -> (&'a str, bool) {
    match stops
        .iter()
        .filter(|s| !s.is_empty())
        .filter_map(|s| text.find(s.as_str()))
        .min()
    {
        Some(end) => (&text[..end], true),
        None => (text, false),
    }
}

#[derive(Clone)]
pub struct InferenceService {
    engine: Arc<dyn TextGenerator>,
}

impl InferenceService {
    pub fn new(engine: Arc<dyn TextGenerator>) -> Self {
        Self { engine }
    }

    /// Runs the generator on the blocking pool. The caller waits for the
    /// whole generation; nothing here cancels or times it out.
    pub async fn generate(&self, prompt: String, params: GenerationParams) -> Result<RawCompletion> {
        let request_id = Uuid::new_v4();
        let engine = Arc::clone(&self.engine);
        let prompt_len = prompt.len();
        debug!(%request_id, prompt_len, max_tokens = params.max_tokens, "generation started");

        let started = Instant::now();
        let out = tokio::task::spawn_blocking(move || engine.generate(&prompt, &params))
            .await
            .map_err(|e| anyhow!("generation task failed: {e}"))??;

        let output_len = match &out {
            RawCompletion::Text(text) => text.len(),
            RawCompletion::Chunks(chunks) => chunks.iter().map(String::len).sum(),
        };
        info!(
            %request_id,
            prompt_len,
            output_len,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "generation finished"
        );
        Ok(out)
    }
}
