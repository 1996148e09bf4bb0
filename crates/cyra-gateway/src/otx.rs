//! [`ThreatIntelProvider`] over the AlienVault OTX pulse API.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use cyra_core::{
  error::FeedError,
  provider::{ThreatIntelProvider, ThreatRecord},
};
use reqwest::Client;
use serde::Deserialize;

use crate::{Result, settings::FeedSettings};

const API_KEY_HEADER: &str = "X-OTX-API-KEY";

pub struct OtxFeed {
  client:  Client,
  url:     String,
  api_key: String,
}

#[derive(Deserialize)]
struct PulsePage {
  #[serde(default)]
  results: Vec<Pulse>,
}

#[derive(Deserialize)]
struct Pulse {
  id:          String,
  #[serde(default)]
  name:        String,
  #[serde(default)]
  description: String,
  #[serde(default)]
  author_name: String,
  created:     String,
  #[serde(default)]
  tags:        Vec<String>,
}

/// OTX timestamps usually omit the offset; those are UTC.
fn parse_created(s: &str) -> Option<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .ok()
    .or_else(|| {
      NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
    })
}

impl OtxFeed {
  pub fn new(settings: &FeedSettings) -> Result<Self> {
    let client = Client::builder()
      .timeout(Duration::from_secs(settings.timeout_secs.saturating_add(5)))
      .build()?;
    Ok(Self { client, url: settings.url.clone(), api_key: settings.api_key.clone() })
  }
}

impl Pulse {
  fn into_record(self) -> Option<ThreatRecord> {
    let Some(created_at) = parse_created(&self.created) else {
      tracing::debug!(pulse = %self.id, created = %self.created, "skipping pulse with bad timestamp");
      return None;
    };
    Some(ThreatRecord {
      id: self.id,
      name: self.name,
      description: self.description,
      author: self.author_name,
      created_at,
      tags: self.tags,
    })
  }
}

#[async_trait]
impl ThreatIntelProvider for OtxFeed {
  async fn fetch_latest(&self) -> Result<Vec<ThreatRecord>, FeedError> {
    let resp = self
      .client
      .get(&self.url)
      .header(API_KEY_HEADER, &self.api_key)
      .send()
      .await
      .map_err(|e| {
        if e.is_timeout() { FeedError::Timeout } else { FeedError::Transport(e.to_string()) }
      })?;

    let status = resp.status();
    if !status.is_success() {
      return Err(FeedError::Status(status.as_u16()));
    }

    let page: PulsePage =
      resp.json().await.map_err(|e| FeedError::Malformed(e.to_string()))?;
    Ok(page.results.into_iter().filter_map(Pulse::into_record).collect())
  }
}
