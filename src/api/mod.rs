use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};

use crate::{config::ServerConfig, inference::GenerationParams, inference::InferenceService};

pub mod error;
pub mod handlers;
pub mod types;

#[derive(Clone)]
pub struct AppState {
    pub infer: InferenceService,
    pub chat_defaults: GenerationParams,
    pub model_name: Arc<str>,
}

impl AppState {
    pub fn new(infer: InferenceService, config: &ServerConfig) -> Self {
        Self {
            infer,
            chat_defaults: config.chat_defaults.clone(),
            model_name: config.llama.model_path.display().to_string().into(),
        }
    }
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/chat", post(handlers::chat))
        .route("/v1/completions", post(handlers::completions))
        .route("/health", get(handlers::health))
}
