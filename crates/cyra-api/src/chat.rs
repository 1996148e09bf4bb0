//! Handlers for `/chat` endpoints.
//!
//! | Method   | Path | Notes |
//! |----------|------|-------|
//! | `POST`   | `/chat/authorize` | Admission check only; nothing is counted |
//! | `POST`   | `/chat` | Body: `{"message":"..."}` |
//! | `GET`    | `/chat` | Transcript snapshot |
//! | `DELETE` | `/chat` | 409 while a request is in flight |

use std::sync::Arc;

use axum::{Json, extract::State, http::StatusCode};
use chrono::Utc;
use cyra_core::{
  Engine,
  chat::{AssistantReply, SessionView},
  quota::{Action, Decision},
  store::SubscriberStore,
};
use serde::Deserialize;

use crate::{error::ApiError, identity::Caller};

/// `POST /chat/authorize`
pub async fn authorize<S>(
  State(engine): State<Arc<Engine<S>>>,
  Caller(id): Caller,
) -> Result<Json<Decision>, ApiError>
where
  S: SubscriberStore,
{
  let decision = engine.enforcer().authorize(&id, Action::Query, Utc::now()).await?;
  Ok(Json(decision))
}

#[derive(Debug, Deserialize)]
pub struct SubmitBody {
  pub message: String,
}

/// `POST /chat`
pub async fn submit<S>(
  State(engine): State<Arc<Engine<S>>>,
  Caller(id): Caller,
  Json(body): Json<SubmitBody>,
) -> Result<Json<AssistantReply>, ApiError>
where
  S: SubscriberStore,
{
  let reply = engine.chat().submit(&id, &body.message, Utc::now()).await?;
  Ok(Json(reply))
}

/// `GET /chat`
pub async fn transcript<S>(
  State(engine): State<Arc<Engine<S>>>,
  Caller(id): Caller,
) -> Json<SessionView>
where
  S: SubscriberStore,
{
  Json(engine.chat().transcript(&id))
}

/// `DELETE /chat`
pub async fn clear<S>(
  State(engine): State<Arc<Engine<S>>>,
  Caller(id): Caller,
) -> Result<StatusCode, ApiError>
where
  S: SubscriberStore,
{
  engine.chat().clear(&id)?;
  Ok(StatusCode::NO_CONTENT)
}
