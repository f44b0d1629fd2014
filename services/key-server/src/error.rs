//! HTTP error mapping
//!
//! Pool outcomes that are not successes still get a plain-text body; the
//! status code tells clients which kind of failure it was.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

pub const NO_KEYS_LEFT: &str = "No Available keys left !";
pub const KEY_NOT_ASSIGNED: &str = "Key is either invalid or not assigned yet !";
pub const KEY_EXPIRED: &str = "The key is either invalid or expired";

/// Request-level failures returned by route handlers.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("missing required query parameter: key")]
    MissingKey,

    #[error(transparent)]
    Pool(#[from] key_pool::Error),

    /// Keep-alive failures answer with their own text for every outcome.
    #[error(transparent)]
    KeepAlive(key_pool::Error),
}

impl ApiError {
    fn status_and_body(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::MissingKey => (
                StatusCode::BAD_REQUEST,
                "missing required query parameter: key",
            ),
            ApiError::Pool(key_pool::Error::PoolEmpty) => (StatusCode::NOT_FOUND, NO_KEYS_LEFT),
            ApiError::Pool(key_pool::Error::Expired(_)) => (StatusCode::GONE, KEY_EXPIRED),
            ApiError::Pool(key_pool::Error::Unknown(_) | key_pool::Error::NotLeased(_)) => {
                (StatusCode::NOT_FOUND, KEY_NOT_ASSIGNED)
            }
            ApiError::KeepAlive(key_pool::Error::Expired(_)) => (StatusCode::GONE, KEY_EXPIRED),
            ApiError::KeepAlive(_) => (StatusCode::NOT_FOUND, KEY_EXPIRED),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = self.status_and_body();
        (status, body).into_response()
    }
}
