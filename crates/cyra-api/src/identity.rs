//! Caller identity extractor.

use axum::{extract::FromRequestParts, http::request::Parts};
use cyra_core::subscriber::SubscriberId;

use crate::error::ApiError;

/// Header carrying the authenticated subscriber's id.
pub const SUBSCRIBER_HEADER: &str = "x-subscriber-id";

/// The subscriber making the request. Rejects with `401` when the header is
/// absent or blank.
#[derive(Debug, Clone)]
pub struct Caller(pub SubscriberId);

impl<St: Send + Sync> FromRequestParts<St> for Caller {
  type Rejection = ApiError;

  async fn from_request_parts(parts: &mut Parts, _: &St) -> Result<Self, Self::Rejection> {
    parts
      .headers
      .get(SUBSCRIBER_HEADER)
      .and_then(|v| v.to_str().ok())
      .map(str::trim)
      .filter(|v| !v.is_empty())
      .map(|v| Caller(SubscriberId::from(v)))
      .ok_or(ApiError::Unauthorized)
  }
}
