use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use tracing::{error, warn};

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub detail: String,
}

/// Everything a handler can fail with. Validation problems are the client's
/// fault (422); anything the model raises is reported as a 500 carrying the
/// error text.
#[derive(Debug)]
pub enum ApiError {
    Validation(String),
    Generation(anyhow::Error),
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::Validation(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, detail) = match self {
            ApiError::Validation(detail) => {
                warn!(%detail, "rejected request body");
                (StatusCode::UNPROCESSABLE_ENTITY, detail)
            }
            ApiError::Generation(err) => {
                error!(error = %err, "generation failed");
                (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
            }
        };
        (status, Json(ErrorBody { detail })).into_response()
    }
}
