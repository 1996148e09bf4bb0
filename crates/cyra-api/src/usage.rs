//! Handlers for `/usage` endpoints.

use std::sync::Arc;

use axum::{Json, extract::State};
use chrono::Utc;
use cyra_core::{
  Engine, engine::UsageSummary, ledger::UsageRecord, store::SubscriberStore,
};

use crate::{error::ApiError, identity::Caller};

/// `GET /usage`: the current cycle against the caller's plan.
pub async fn summary<S>(
  State(engine): State<Arc<Engine<S>>>,
  Caller(id): Caller,
) -> Result<Json<UsageSummary>, ApiError>
where
  S: SubscriberStore,
{
  Ok(Json(engine.usage_summary(&id, Utc::now()).await?))
}

/// `GET /usage/history`: archived cycles, newest first.
pub async fn history<S>(
  State(engine): State<Arc<Engine<S>>>,
  Caller(id): Caller,
) -> Result<Json<Vec<UsageRecord>>, ApiError>
where
  S: SubscriberStore,
{
  Ok(Json(engine.usage_history(&id).await?))
}
