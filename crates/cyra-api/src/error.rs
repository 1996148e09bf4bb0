//! API error type and [`axum::response::IntoResponse`] implementation.

use axum::{
  Json,
  http::StatusCode,
  response::{IntoResponse, Response},
};
use cyra_core::Error as CoreError;
use serde_json::json;
use thiserror::Error;

/// An error returned by an API handler.
#[derive(Debug, Error)]
pub enum ApiError {
  #[error("missing or empty subscriber identity")]
  Unauthorized,

  #[error("not found: {0}")]
  NotFound(String),

  #[error(transparent)]
  Core(#[from] CoreError),
}

impl ApiError {
  fn status(&self) -> StatusCode {
    match self {
      ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
      ApiError::NotFound(_) => StatusCode::NOT_FOUND,
      ApiError::Core(e) => match e {
        CoreError::QuotaExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
        CoreError::SessionBusy
        | CoreError::InvalidTransition { .. }
        | CoreError::TransitionInProgress(_) => StatusCode::CONFLICT,
        CoreError::ProviderUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        CoreError::BillingRejected { .. } => StatusCode::PAYMENT_REQUIRED,
        CoreError::UnknownPlan(_) | CoreError::SamePlan(_) | CoreError::EmptyMessage => {
          StatusCode::BAD_REQUEST
        }
        CoreError::TransitionNotFound(_) | CoreError::ThreatNotFound(_) => {
          StatusCode::NOT_FOUND
        }
        CoreError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
      },
    }
  }
}

impl IntoResponse for ApiError {
  fn into_response(self) -> Response {
    let status = self.status();
    let mut body = json!({ "error": self.to_string() });
    match &self {
      ApiError::Core(CoreError::QuotaExceeded { used, limit, upgrade }) => {
        body["used"] = json!(used);
        body["limit"] = json!(limit);
        body["upgrade"] = json!(upgrade);
      }
      ApiError::Core(CoreError::BillingRejected { transition_id, .. })
      | ApiError::Core(CoreError::TransitionInProgress(transition_id)) => {
        body["transition_id"] = json!(transition_id);
      }
      ApiError::Core(CoreError::ProviderUnavailable(reason)) => {
        body["reason"] = json!(reason);
      }
      ApiError::Core(CoreError::Store(e)) => {
        tracing::error!(error = %e, "store failure while handling request");
      }
      _ => {}
    }
    (status, Json(body)).into_response()
  }
}
