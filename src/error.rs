//! Error kinds for the public API.
//!
//! Every rejection the server produces maps to one of these kinds; the
//! HTTP layer renders them as a status code plus `{"error": "..."}`.
//! Engine rejections arrive already typed and are classified here; store
//! and channel failures surface as `Internal` with the detail kept in the
//! log, never in the response body.

use crate::engine::MoveError;
use crate::store::StoreError;
use actix_web::{HttpResponse, http::StatusCode};
use serde::Serialize;
use thiserror::Error;
use utoipa::ToSchema;

/// JSON body for every error response.
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorBody {
    /// Human-readable description of what went wrong.
    pub error: String,
}

#[derive(Debug, Error)]
pub enum ApiError {
    /// Malformed input: bad squares, unknown time control, bad promotion
    /// field, missing body fields.
    #[error("{0}")]
    Validation(String),

    /// A chess-rules rejection from the engine.
    #[error("{0}")]
    IllegalMove(String),

    /// Missing or invalid credentials where authentication is required.
    #[error("{0}")]
    Unauthorized(String),

    /// Authenticated but not allowed: wrong seat, another user's unranked
    /// history, and similar.
    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    NotFound(String),

    /// The game state does not admit the request right now: wrong turn,
    /// exhausted draw offers, full game, lost CAS race.
    #[error("{0}")]
    Conflict(String),

    /// Store or channel failure the caller cannot act on. The payload is
    /// for the log; callers only ever see "internal error".
    #[error("internal error")]
    Internal(String),
}

impl ApiError {
    pub fn internal(detail: impl Into<String>) -> Self {
        let detail = detail.into();
        log::error!("internal error: {}", detail);
        ApiError::Internal(detail)
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        ApiError::internal(err.to_string())
    }
}

impl From<MoveError> for ApiError {
    fn from(err: MoveError) -> Self {
        match err {
            // Turn order is a state conflict, not a rules question.
            MoveError::WrongTurn => ApiError::Conflict(err.to_string()),
            MoveError::PromotionRequired | MoveError::PromotionInvalid => {
                ApiError::Validation(err.to_string())
            }
            _ => ApiError::IllegalMove(err.to_string()),
        }
    }
}

impl actix_web::ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) | ApiError::IllegalMove(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(ErrorBody {
            error: self.to_string(),
        })
    }
}
