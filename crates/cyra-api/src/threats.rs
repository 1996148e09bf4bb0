//! Handlers for `/threats` endpoints. Reads are served from the cache and
//! never reach the threat-intelligence provider.

use std::{collections::BTreeMap, sync::Arc};

use axum::{
  Json,
  extract::{Path, Query, State},
};
use chrono::Utc;
use cyra_core::{
  Engine,
  engine::FlaggedThreat,
  store::SubscriberStore,
  threat::{PollStatus, ThreatItem},
};
use serde::{Deserialize, Serialize};

use crate::{error::ApiError, identity::Caller};

const DEFAULT_LIMIT: usize = 20;

#[derive(Debug, Deserialize)]
pub struct ListParams {
  pub limit: Option<usize>,
}

/// `GET /threats[?limit=<n>]`: newest first.
pub async fn list<S>(
  State(engine): State<Arc<Engine<S>>>,
  _caller: Caller,
  Query(params): Query<ListParams>,
) -> Json<Vec<ThreatItem>>
where
  S: SubscriberStore,
{
  Json(engine.feed().recent(params.limit.unwrap_or(DEFAULT_LIMIT)))
}

/// `GET /threats/tags`: tag → item count over the cache.
pub async fn tags<S>(
  State(engine): State<Arc<Engine<S>>>,
  _caller: Caller,
) -> Json<BTreeMap<String, usize>>
where
  S: SubscriberStore,
{
  Json(engine.feed().tag_distribution())
}

#[derive(Debug, Serialize)]
pub struct FeedStatus {
  pub cached:    usize,
  pub last_poll: Option<PollStatus>,
}

/// `GET /threats/status`
pub async fn status<S>(
  State(engine): State<Arc<Engine<S>>>,
  _caller: Caller,
) -> Json<FeedStatus>
where
  S: SubscriberStore,
{
  let feed = engine.feed();
  Json(FeedStatus { cached: feed.len(), last_poll: feed.last_poll() })
}

/// `POST /threats/{id}/flag`
pub async fn flag<S>(
  State(engine): State<Arc<Engine<S>>>,
  Caller(id): Caller,
  Path(threat_id): Path<String>,
) -> Result<Json<FlaggedThreat>, ApiError>
where
  S: SubscriberStore,
{
  Ok(Json(engine.flag_threat(&id, &threat_id, Utc::now()).await?))
}
