//! Interfaces to the external collaborators the core consumes.
//!
//! Implementations live outside the core (see `cyra-gateway`). All three are
//! object-safe so the engine can hold them as `Arc<dyn ...>`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
  catalog::PlanId, chat::Message, error::FeedError, subscriber::SubscriberId,
};

// ─── Completion provider ─────────────────────────────────────────────────────

/// Why a completion call did not produce a reply. The core treats every
/// variant the same for quota purposes; the reason is kept for display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Error)]
#[serde(rename_all = "snake_case")]
pub enum ProviderError {
  #[error("request timed out")]
  Timeout,
  #[error("rate limited")]
  RateLimited,
  #[error("service unavailable")]
  Unavailable,
  #[error("malformed response")]
  MalformedResponse,
}

#[async_trait]
pub trait CompletionProvider: Send + Sync {
  /// Produce the assistant's next turn for `transcript`, which ends with the
  /// subscriber's newest message.
  async fn complete(
    &self,
    system_preamble: &str,
    transcript: &[Message],
  ) -> Result<String, ProviderError>;
}

// ─── Threat intelligence provider ────────────────────────────────────────────

/// One entry of a threat-intelligence batch, as delivered by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreatRecord {
  pub id:          String,
  pub name:        String,
  pub description: String,
  pub author:      String,
  pub created_at:  DateTime<Utc>,
  pub tags:        Vec<String>,
}

#[async_trait]
pub trait ThreatIntelProvider: Send + Sync {
  async fn fetch_latest(&self) -> Result<Vec<ThreatRecord>, FeedError>;
}

// ─── Billing collaborator ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ChargeOutcome {
  Confirmed,
  Rejected { reason: String },
}

#[async_trait]
pub trait BillingCollaborator: Send + Sync {
  /// Charge `subscriber` for `plan`. Transport failures are reported as
  /// [`ChargeOutcome::Rejected`].
  async fn charge(&self, subscriber: &SubscriberId, plan: &PlanId) -> ChargeOutcome;
}
