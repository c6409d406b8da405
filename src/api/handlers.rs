use axum::{
    extract::{rejection::JsonRejection, State},
    Json,
};

use super::{
    error::ApiError,
    types::{ChatRequest, ChatResponse, CompletionRequest, CompletionResponse, HealthResponse},
    AppState,
};
use crate::conversation::{extract_reply, format_prompt};

pub async fn chat(
    State(state): State<AppState>,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Json<ChatResponse>, ApiError> {
    let Json(req) = payload?;

    let prompt = format_prompt(&req.messages);
    let raw = state
        .infer
        .generate(prompt.clone(), state.chat_defaults.clone())
        .await
        .map_err(ApiError::Generation)?;

    Ok(Json(ChatResponse {
        reply: extract_reply(raw, &prompt),
    }))
}

pub async fn completions(
    State(state): State<AppState>,
    payload: Result<Json<CompletionRequest>, JsonRejection>,
) -> Result<Json<CompletionResponse>, ApiError> {
    let Json(req) = payload?;

    let params = req.params(state.chat_defaults.repeat_penalty);
    params
        .validate()
        .map_err(|e| ApiError::Validation(e.to_string()))?;

    let raw = state
        .infer
        .generate(req.prompt, params)
        .await
        .map_err(ApiError::Generation)?;

    Ok(Json(CompletionResponse {
        generated_text: raw.into_text(),
    }))
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".into(),
        model: state.model_name.to_string(),
    })
}
