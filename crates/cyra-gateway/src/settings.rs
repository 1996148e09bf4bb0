//! Gateway configuration, deserialised from `cyra.toml` layered with `CYRA_*`
//! environment variables.

use std::{path::PathBuf, time::Duration};

use chrono::TimeDelta;
use cyra_core::{
  EngineConfig,
  catalog::{PlanCatalog, PlanSpec},
  chat::ChatConfig,
  error::CatalogError,
  threat::FeedConfig,
};
use serde::Deserialize;

pub const OTX_SUBSCRIBED_PULSES: &str =
  "https://otx.alienvault.com/api/v1/pulses/subscribed";

/// Runtime gateway configuration. Every field has a default, so an absent
/// config file yields a runnable (if key-less) gateway.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
  pub host:                      String,
  pub port:                      u16,
  pub store_path:                PathBuf,
  /// Replaces the built-in catalog when present.
  pub plans:                     Option<Vec<PlanSpec>>,
  pub chat:                      ChatSettings,
  pub feed:                      FeedSettings,
  pub billing:                   BillingSettings,
  pub transition_retention_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChatSettings {
  pub api_base:     String,
  pub api_key:      String,
  pub model:        String,
  pub timeout_secs: u64,
  pub max_turns:    usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FeedSettings {
  pub url:           String,
  pub api_key:       String,
  pub interval_secs: u64,
  pub capacity:      usize,
  pub timeout_secs:  u64,
}

/// Without a `url` the gateway runs against sandbox billing.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BillingSettings {
  pub url:          Option<String>,
  pub api_key:      Option<String>,
  pub timeout_secs: u64,
}

impl Default for GatewayConfig {
  fn default() -> Self {
    Self {
      host:                      "127.0.0.1".into(),
      port:                      8080,
      store_path:                PathBuf::from("cyra.db"),
      plans:                     None,
      chat:                      ChatSettings::default(),
      feed:                      FeedSettings::default(),
      billing:                   BillingSettings::default(),
      transition_retention_secs: 3600,
    }
  }
}

impl Default for ChatSettings {
  fn default() -> Self {
    Self {
      api_base:     "https://api.openai.com/v1".into(),
      api_key:      String::new(),
      model:        "gpt-4o-mini".into(),
      timeout_secs: 30,
      max_turns:    20,
    }
  }
}

impl Default for BillingSettings {
  fn default() -> Self { Self { url: None, api_key: None, timeout_secs: 30 } }
}

impl Default for FeedSettings {
  fn default() -> Self {
    Self {
      url:           OTX_SUBSCRIBED_PULSES.into(),
      api_key:       String::new(),
      interval_secs: 300,
      capacity:      50,
      timeout_secs:  20,
    }
  }
}

impl GatewayConfig {
  /// The configured catalog, or the built-in one.
  pub fn catalog(&self) -> Result<PlanCatalog, CatalogError> {
    match &self.plans {
      Some(specs) => PlanCatalog::from_specs(specs.iter().cloned()),
      None => Ok(PlanCatalog::builtin()),
    }
  }

  pub fn engine_config(&self) -> EngineConfig {
    EngineConfig {
      chat:                 ChatConfig {
        max_turns: self.chat.max_turns,
        timeout:   Duration::from_secs(self.chat.timeout_secs),
      },
      feed:                 FeedConfig {
        capacity: self.feed.capacity,
        timeout:  Duration::from_secs(self.feed.timeout_secs),
      },
      transition_retention: i64::try_from(self.transition_retention_secs)
        .ok()
        .and_then(TimeDelta::try_seconds)
        .unwrap_or(TimeDelta::MAX),
      billing_timeout:      Duration::from_secs(self.billing.timeout_secs),
    }
  }

  pub fn poll_interval(&self) -> Duration {
    Duration::from_secs(self.feed.interval_secs.max(1))
  }
}
