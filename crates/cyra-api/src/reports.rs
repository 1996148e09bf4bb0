//! Handler for `GET /reports/threats`.

use std::sync::Arc;

use axum::{Json, extract::State};
use chrono::Utc;
use cyra_core::{Engine, engine::ThreatReport, store::SubscriberStore};

use crate::{error::ApiError, identity::Caller};

/// `GET /reports/threats`: counted against the caller's reports.
pub async fn threats<S>(
  State(engine): State<Arc<Engine<S>>>,
  Caller(id): Caller,
) -> Result<Json<ThreatReport>, ApiError>
where
  S: SubscriberStore,
{
  Ok(Json(engine.threat_report(&id, Utc::now()).await?))
}
