use serde::{Deserialize, Serialize};

use crate::conversation::ChatMessage;
use crate::inference::GenerationParams;

pub const DEFAULT_MAX_TOKENS: u32 = 128;
pub const DEFAULT_TEMPERATURE: f32 = 0.7;
pub const DEFAULT_TOP_P: f32 = 0.9;

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChatResponse {
    pub reply: String,
}

/// Body of `/v1/completions`. Missing and `null` fields both take the
/// defaults.
#[derive(Debug, Deserialize)]
pub struct CompletionRequest {
    pub prompt: String,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub stop: Option<Vec<String>>,
}

impl CompletionRequest {
    pub fn params(&self, repeat_penalty: Option<f32>) -> GenerationParams {
        GenerationParams {
            max_tokens: self.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            temperature: self.temperature.unwrap_or(DEFAULT_TEMPERATURE),
            top_p: self.top_p.unwrap_or(DEFAULT_TOP_P),
            repeat_penalty,
            stop: self
                .stop
                .iter()
                .flatten()
                .filter(|s| !s.is_empty())
                .cloned()
                .collect(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub generated_text: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub model: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completion_defaults_apply_to_missing_and_null() {
        let req: CompletionRequest = serde_json::from_str(
            r#"{"prompt":"hi","temperature":null,"stop":null}"#,
        )
        .unwrap();
        let params = req.params(None);
        assert_eq!(params.max_tokens, 128);
        assert_eq!(params.temperature, 0.7);
        assert_eq!(params.top_p, 0.9);
        assert!(params.stop.is_empty());
    }

    #[test]
    fn completion_stop_drops_empty_strings() {
        let req: CompletionRequest =
            serde_json::from_str(r#"{"prompt":"hi","stop":["", "\n"]}"#).unwrap();
        assert_eq!(req.params(Some(1.1)).stop, vec!["\n".to_string()]);
    }
}
