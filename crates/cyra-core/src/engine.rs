//! The engine: wires the catalog, ledger, enforcer, chat sessions, threat
//! feed and plan transitions together around one subscriber store.
//!
//! Every component is reachable through an accessor; the methods defined here
//! are the operations that span more than one of them.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;

use crate::{
  Error, Result,
  catalog::{Plan, PlanCatalog},
  chat::{ChatConfig, ChatSessions},
  ledger::{UsageLedger, UsageRecord},
  provider::{BillingCollaborator, CompletionProvider, ThreatIntelProvider},
  quota::{Action, QuotaEnforcer},
  store::{SubscriberStore, get_or_enrol},
  subscriber::{Subscriber, SubscriberId, SubscriberLocks},
  threat::{FeedConfig, ThreatFeed, ThreatItem},
  transition::PlanTransitions,
};

/// The external services the engine calls out to.
pub struct Collaborators {
  pub completion:   Arc<dyn CompletionProvider>,
  pub threat_intel: Arc<dyn ThreatIntelProvider>,
  pub billing:      Arc<dyn BillingCollaborator>,
}

#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
  pub chat:                 ChatConfig,
  pub feed:                 FeedConfig,
  /// How long settled plan transitions remain queryable.
  pub transition_retention: TimeDelta,
  /// Billing calls exceeding this are treated as a rejection.
  pub billing_timeout:      Duration,
}

impl Default for EngineConfig {
  fn default() -> Self {
    Self {
      chat:                 ChatConfig::default(),
      feed:                 FeedConfig::default(),
      transition_retention: TimeDelta::hours(1),
      billing_timeout:      Duration::from_secs(30),
    }
  }
}

/// A subscriber's plan alongside their consumption this cycle.
#[derive(Debug, Clone, Serialize)]
pub struct UsageSummary {
  pub subscriber:   Subscriber,
  pub plan:         Plan,
  pub usage:        UsageRecord,
  pub limit:        u32,
  pub remaining:    u32,
  /// Whole percent of the query limit consumed, capped at 100.
  pub percent_used: u32,
}

impl UsageSummary {
  fn new(subscriber: Subscriber, plan: Plan, usage: UsageRecord) -> Self {
    let limit = plan.max_queries;
    let used = usage.queries_used;
    let percent_used = match limit {
      0 => 100,
      _ => (u64::from(used) * 100 / u64::from(limit)).min(100) as u32,
    };
    Self {
      subscriber,
      plan,
      usage,
      limit,
      remaining: limit.saturating_sub(used),
      percent_used,
    }
  }
}

/// Snapshot of the threat cache generated on a subscriber's behalf.
#[derive(Debug, Clone, Serialize)]
pub struct ThreatReport {
  pub generated_at:     DateTime<Utc>,
  pub total:            usize,
  pub tag_distribution: BTreeMap<String, usize>,
  pub recent:           Vec<ThreatItem>,
  /// The requesting subscriber's usage after the report was counted.
  pub usage:            UsageRecord,
}

/// Items included in the `recent` section of a [`ThreatReport`].
const REPORT_RECENT: usize = 10;

#[derive(Debug, Clone, Serialize)]
pub struct FlaggedThreat {
  pub threat: ThreatItem,
  pub usage:  UsageRecord,
}

pub struct Engine<S> {
  store:       Arc<S>,
  catalog:     Arc<PlanCatalog>,
  ledger:      Arc<UsageLedger>,
  enforcer:    Arc<QuotaEnforcer<S>>,
  chat:        ChatSessions<S>,
  feed:        ThreatFeed,
  transitions: PlanTransitions<S>,
}

impl<S: SubscriberStore> Engine<S> {
  pub fn new(
    store: Arc<S>,
    catalog: PlanCatalog,
    collaborators: Collaborators,
    config: EngineConfig,
  ) -> Self {
    let catalog = Arc::new(catalog);
    let ledger = Arc::new(UsageLedger::new());
    let locks = Arc::new(SubscriberLocks::new());
    let enforcer = Arc::new(QuotaEnforcer::new(
      store.clone(),
      catalog.clone(),
      ledger.clone(),
      locks.clone(),
    ));
    let chat = ChatSessions::new(enforcer.clone(), collaborators.completion, config.chat);
    let feed = ThreatFeed::new(collaborators.threat_intel, config.feed);
    let transitions = PlanTransitions::new(
      store.clone(),
      catalog.clone(),
      ledger.clone(),
      locks,
      collaborators.billing,
      config.transition_retention,
      config.billing_timeout,
    );
    Self { store, catalog, ledger, enforcer, chat, feed, transitions }
  }

  pub fn store(&self) -> &S { &self.store }

  pub fn catalog(&self) -> &PlanCatalog { &self.catalog }

  pub fn ledger(&self) -> &UsageLedger { &self.ledger }

  pub fn enforcer(&self) -> &QuotaEnforcer<S> { &self.enforcer }

  pub fn chat(&self) -> &ChatSessions<S> { &self.chat }

  pub fn feed(&self) -> &ThreatFeed { &self.feed }

  pub fn transitions(&self) -> &PlanTransitions<S> { &self.transitions }

  /// The subscriber record for `id`, enrolling it on first contact.
  pub async fn subscriber(&self, id: &SubscriberId, now: DateTime<Utc>) -> Result<Subscriber> {
    get_or_enrol(&*self.store, &self.catalog, id, now).await
  }

  pub async fn usage_summary(
    &self,
    id: &SubscriberId,
    now: DateTime<Utc>,
  ) -> Result<UsageSummary> {
    let subscriber = self.subscriber(id, now).await?;
    let plan = self.catalog.lookup(&subscriber.plan_id)?.clone();
    let usage = self.enforcer.usage(id, now).await?;
    Ok(UsageSummary::new(subscriber, plan, usage))
  }

  /// Archived usage cycles for `id`, newest first.
  pub async fn usage_history(&self, id: &SubscriberId) -> Result<Vec<UsageRecord>> {
    self.enforcer.history(id).await
  }

  /// Build a report over the current threat cache and count it against `id`.
  pub async fn threat_report(
    &self,
    id: &SubscriberId,
    now: DateTime<Utc>,
  ) -> Result<ThreatReport> {
    self.enforcer.authorize(id, Action::Report, now).await?.into_result()?;
    let recent = self.feed.recent(REPORT_RECENT);
    let tag_distribution = self.feed.tag_distribution();
    let total = self.feed.len();
    let usage = self.enforcer.record(id, Action::Report, now).await?;
    tracing::info!(subscriber = %id, total, "threat report generated");
    Ok(ThreatReport { generated_at: now, total, tag_distribution, recent, usage })
  }

  /// Record that `id` flagged a cached threat item.
  pub async fn flag_threat(
    &self,
    id: &SubscriberId,
    threat_id: &str,
    now: DateTime<Utc>,
  ) -> Result<FlaggedThreat> {
    let threat = self
      .feed
      .get(threat_id)
      .ok_or_else(|| Error::ThreatNotFound(threat_id.to_owned()))?;
    self.enforcer.authorize(id, Action::FlagThreat, now).await?.into_result()?;
    let usage = self.enforcer.record(id, Action::FlagThreat, now).await?;
    tracing::info!(subscriber = %id, threat = %threat.threat_id, "threat flagged");
    Ok(FlaggedThreat { threat, usage })
  }
}
