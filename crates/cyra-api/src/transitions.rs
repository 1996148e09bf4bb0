//! Handlers for `/transitions` endpoints.
//!
//! | Method | Path | Notes |
//! |--------|------|-------|
//! | `POST` | `/transitions` | Body: `{"plan_id":"pro"}`; 402 if billing rejects |
//! | `GET`  | `/transitions/{id}` | Caller's own transitions only |
//! | `POST` | `/transitions/{id}/retry` | |
//! | `POST` | `/transitions/{id}/cancel` | Only from `requested` |

use std::sync::Arc;

use axum::{
  Json,
  extract::{Path, State},
};
use chrono::Utc;
use cyra_core::{
  Engine,
  catalog::PlanId,
  store::SubscriberStore,
  subscriber::SubscriberId,
  transition::PlanTransition,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::{error::ApiError, identity::Caller};

#[derive(Debug, Deserialize)]
pub struct CreateBody {
  pub plan_id: PlanId,
}

/// `POST /transitions`
pub async fn create<S>(
  State(engine): State<Arc<Engine<S>>>,
  Caller(id): Caller,
  Json(body): Json<CreateBody>,
) -> Result<Json<PlanTransition>, ApiError>
where
  S: SubscriberStore,
{
  let transition = engine
    .transitions()
    .request_change(&id, &body.plan_id, Utc::now())
    .await?;
  Ok(Json(transition))
}

/// Look up `transition_id`, hiding other subscribers' transitions.
fn owned<S: SubscriberStore>(
  engine: &Engine<S>,
  caller: &SubscriberId,
  transition_id: Uuid,
) -> Result<PlanTransition, ApiError> {
  engine
    .transitions()
    .get(transition_id)
    .filter(|t| &t.subscriber_id == caller)
    .ok_or_else(|| ApiError::NotFound(format!("transition {transition_id}")))
}

/// `GET /transitions/{id}`
pub async fn get_one<S>(
  State(engine): State<Arc<Engine<S>>>,
  Caller(id): Caller,
  Path(transition_id): Path<Uuid>,
) -> Result<Json<PlanTransition>, ApiError>
where
  S: SubscriberStore,
{
  owned(&engine, &id, transition_id).map(Json)
}

/// `POST /transitions/{id}/retry`
pub async fn retry<S>(
  State(engine): State<Arc<Engine<S>>>,
  Caller(id): Caller,
  Path(transition_id): Path<Uuid>,
) -> Result<Json<PlanTransition>, ApiError>
where
  S: SubscriberStore,
{
  owned(&engine, &id, transition_id)?;
  Ok(Json(engine.transitions().retry(transition_id, Utc::now()).await?))
}

/// `POST /transitions/{id}/cancel`
pub async fn cancel<S>(
  State(engine): State<Arc<Engine<S>>>,
  Caller(id): Caller,
  Path(transition_id): Path<Uuid>,
) -> Result<Json<PlanTransition>, ApiError>
where
  S: SubscriberStore,
{
  owned(&engine, &id, transition_id)?;
  Ok(Json(engine.transitions().cancel(transition_id, Utc::now())?))
}
