//! [`BillingCollaborator`] implementations: an HTTP charge endpoint and a
//! sandbox that confirms everything.

use std::time::Duration;

use async_trait::async_trait;
use cyra_core::{
  catalog::PlanId,
  provider::{BillingCollaborator, ChargeOutcome},
  subscriber::SubscriberId,
};
use reqwest::Client;
use serde::Serialize;

use crate::Result;

/// Posts `{"subscriber_id", "plan_id"}` to a billing endpoint which answers
/// with a [`ChargeOutcome`].
pub struct HttpBilling {
  client:  Client,
  url:     String,
  api_key: Option<String>,
}

#[derive(Serialize)]
struct ChargeRequest<'a> {
  subscriber_id: &'a SubscriberId,
  plan_id:       &'a PlanId,
}

impl HttpBilling {
  pub fn new(url: impl Into<String>, api_key: Option<String>) -> Result<Self> {
    let client = Client::builder().timeout(Duration::from_secs(30)).build()?;
    Ok(Self { client, url: url.into(), api_key })
  }
}

#[async_trait]
impl BillingCollaborator for HttpBilling {
  async fn charge(&self, subscriber: &SubscriberId, plan: &PlanId) -> ChargeOutcome {
    let mut req = self
      .client
      .post(&self.url)
      .json(&ChargeRequest { subscriber_id: subscriber, plan_id: plan });
    if let Some(key) = &self.api_key {
      req = req.bearer_auth(key);
    }

    let resp = match req.send().await {
      Ok(resp) => resp,
      Err(e) => {
        tracing::warn!(error = %e, "billing endpoint unreachable");
        return ChargeOutcome::Rejected { reason: "billing unavailable".into() };
      }
    };
    let status = resp.status();
    if !status.is_success() {
      return ChargeOutcome::Rejected { reason: format!("billing returned HTTP {status}") };
    }
    resp.json().await.unwrap_or_else(|e| {
      tracing::warn!(error = %e, "unreadable billing response");
      ChargeOutcome::Rejected { reason: "unreadable billing response".into() }
    })
  }
}

/// Confirms every charge. Used when no billing endpoint is configured.
#[derive(Debug, Default)]
pub struct SandboxBilling;

#[async_trait]
impl BillingCollaborator for SandboxBilling {
  async fn charge(&self, subscriber: &SubscriberId, plan: &PlanId) -> ChargeOutcome {
    tracing::warn!(%subscriber, %plan, "sandbox billing: charge confirmed without payment");
    ChargeOutcome::Confirmed
  }
}
