//! Handlers for the plan catalog and the caller's own assignment.
//!
//! | Method | Path | Notes |
//! |--------|------|-------|
//! | `GET`  | `/plans` | Catalog order is upgrade order |
//! | `GET`  | `/plans/{id}` | 404 if not found |
//! | `GET`  | `/me` | Enrols the caller on first contact |

use std::sync::Arc;

use axum::{
  Json,
  extract::{Path, State},
};
use chrono::Utc;
use cyra_core::{
  Engine,
  catalog::{Plan, PlanId},
  store::SubscriberStore,
  subscriber::Subscriber,
};
use serde::Serialize;

use crate::{error::ApiError, identity::Caller};

/// `GET /plans`
pub async fn list<S>(State(engine): State<Arc<Engine<S>>>) -> Json<Vec<Plan>>
where
  S: SubscriberStore,
{
  Json(engine.catalog().list().to_vec())
}

/// `GET /plans/{id}`
pub async fn get_one<S>(
  State(engine): State<Arc<Engine<S>>>,
  Path(id): Path<String>,
) -> Result<Json<Plan>, ApiError>
where
  S: SubscriberStore,
{
  engine
    .catalog()
    .lookup(&PlanId::new(id.clone()))
    .map(|plan| Json(plan.clone()))
    .map_err(|_| ApiError::NotFound(format!("plan {id}")))
}

#[derive(Debug, Serialize)]
pub struct Me {
  pub subscriber: Subscriber,
  pub plan:       Plan,
  /// Next plan up, if any.
  pub upgrade:    Option<Plan>,
}

/// `GET /me`
pub async fn me<S>(
  State(engine): State<Arc<Engine<S>>>,
  Caller(id): Caller,
) -> Result<Json<Me>, ApiError>
where
  S: SubscriberStore,
{
  let subscriber = engine.subscriber(&id, Utc::now()).await?;
  let catalog = engine.catalog();
  let plan = catalog.lookup(&subscriber.plan_id)?.clone();
  let upgrade = catalog.upgrade_from(&plan.id)?.cloned();
  Ok(Json(Me { subscriber, plan, upgrade }))
}
