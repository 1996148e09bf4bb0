//! Quota enforcer: admits or denies metered actions against a plan's limits.
//!
//! Authorizing never counts anything. Callers [`record`](QuotaEnforcer::record)
//! an action only after the work it stands for has actually succeeded, so a
//! failed provider call never consumes quota.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
  Error, Result,
  catalog::{Plan, PlanCatalog, PlanId},
  ledger::{UsageField, UsageLedger, UsageRecord},
  store::{SubscriberStore, get_or_enrol},
  subscriber::{SubscriberId, SubscriberLocks},
};

/// An action a subscriber may attempt.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Action {
  /// A chat query, limited by `max_queries`.
  Query,
  /// A generated report. Counted, not limited.
  Report,
  /// A threat flagged by the subscriber. Counted, not limited.
  FlagThreat,
}

impl Action {
  /// The ledger counter this action is recorded against.
  pub fn field(self) -> UsageField {
    match self {
      Self::Query => UsageField::Queries,
      Self::Report => UsageField::Reports,
      Self::FlagThreat => UsageField::ThreatsFlagged,
    }
  }

  /// The plan's limit for this action, or `None` if it is unmetered.
  pub fn limit(self, plan: &Plan) -> Option<u32> {
    match self {
      Self::Query => Some(plan.max_queries),
      Self::Report | Self::FlagThreat => None,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum DenyReason {
  QuotaExceeded {
    used:    u32,
    limit:   u32,
    /// Next plan in upgrade order, for an upgrade suggestion.
    upgrade: Option<PlanId>,
  },
}

impl From<DenyReason> for Error {
  fn from(reason: DenyReason) -> Self {
    match reason {
      DenyReason::QuotaExceeded { used, limit, upgrade } => {
        Error::QuotaExceeded { used, limit, upgrade }
      }
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Decision {
  Admit,
  Deny(DenyReason),
}

impl Decision {
  pub fn is_admit(&self) -> bool { matches!(self, Self::Admit) }

  /// Convert a denial into [`Error::QuotaExceeded`].
  pub fn into_result(self) -> Result<()> {
    match self {
      Self::Admit => Ok(()),
      Self::Deny(reason) => Err(reason.into()),
    }
  }
}

pub struct QuotaEnforcer<S> {
  store:   Arc<S>,
  catalog: Arc<PlanCatalog>,
  ledger:  Arc<UsageLedger>,
  locks:   Arc<SubscriberLocks>,
}

impl<S: SubscriberStore> QuotaEnforcer<S> {
  pub fn new(
    store: Arc<S>,
    catalog: Arc<PlanCatalog>,
    ledger: Arc<UsageLedger>,
    locks: Arc<SubscriberLocks>,
  ) -> Self {
    Self { store, catalog, ledger, locks }
  }

  /// Decide whether `id` may perform `action` at `now`.
  ///
  /// The plan and usage are read inside the subscriber's exclusive section,
  /// so a concurrent plan change is observed either entirely or not at all.
  pub async fn authorize(
    &self,
    id: &SubscriberId,
    action: Action,
    now: DateTime<Utc>,
  ) -> Result<Decision> {
    let _section = self.locks.lock(id).await;
    let subscriber = get_or_enrol(&*self.store, &self.catalog, id, now).await?;
    let plan = self.catalog.lookup(&subscriber.plan_id)?;
    let usage = self.active_usage(id, now).await?;
    let decision = self.decide(plan, &usage, action)?;
    tracing::debug!(
      subscriber = %id,
      %action,
      plan = %plan.id,
      admitted = decision.is_admit(),
      "authorization decided"
    );
    Ok(decision)
  }

  /// The active usage record for `id`, loading it from the store if needed.
  pub async fn usage(&self, id: &SubscriberId, now: DateTime<Utc>) -> Result<UsageRecord> {
    let _section = self.locks.lock(id).await;
    self.active_usage(id, now).await
  }

  /// Count one `action` for `id` and write the updated record back.
  pub async fn record(
    &self,
    id: &SubscriberId,
    action: Action,
    now: DateTime<Utc>,
  ) -> Result<UsageRecord> {
    let _section = self.locks.lock(id).await;
    self.ledger.hydrate(&*self.store, id).await?;
    let usage = self.ledger.increment(id, action.field(), now);
    self.store.save_usage(usage.clone()).await.map_err(Error::store)?;
    Ok(usage)
  }

  /// Archived cycles for `id`, newest first.
  pub async fn history(&self, id: &SubscriberId) -> Result<Vec<UsageRecord>> {
    let _section = self.locks.lock(id).await;
    self.ledger.hydrate(&*self.store, id).await?;
    Ok(self.ledger.history(id))
  }

  /// Must be called inside `id`'s exclusive section.
  async fn active_usage(&self, id: &SubscriberId, now: DateTime<Utc>) -> Result<UsageRecord> {
    self.ledger.hydrate(&*self.store, id).await?;
    let (usage, started) = self.ledger.open_cycle(id, now);
    if started {
      self.store.save_usage(usage.clone()).await.map_err(Error::store)?;
    }
    Ok(usage)
  }

  /// Pure admission rule: admit only while `used < limit`.
  pub fn decide(
    &self,
    plan: &Plan,
    usage: &UsageRecord,
    action: Action,
  ) -> Result<Decision> {
    let Some(limit) = action.limit(plan) else {
      return Ok(Decision::Admit);
    };
    let used = usage.get(action.field());
    if used < limit {
      return Ok(Decision::Admit);
    }
    let upgrade = self.catalog.upgrade_from(&plan.id)?.map(|p| p.id.clone());
    Ok(Decision::Deny(DenyReason::QuotaExceeded { used, limit, upgrade }))
  }
}

#[cfg(test)]
mod tests {
  use chrono::TimeZone;

  use super::*;
  use crate::{
    catalog::PlanSpec,
    store::MemoryStore,
    subscriber::Subscriber,
  };

  fn now() -> DateTime<Utc> { Utc.with_ymd_and_hms(2025, 4, 1, 12, 0, 0).unwrap() }

  fn enforcer_with(catalog: PlanCatalog) -> (QuotaEnforcer<MemoryStore>, Arc<UsageLedger>) {
    let ledger = Arc::new(UsageLedger::new());
    let enforcer = QuotaEnforcer::new(
      Arc::new(MemoryStore::new()),
      Arc::new(catalog),
      ledger.clone(),
      Arc::new(SubscriberLocks::new()),
    );
    (enforcer, ledger)
  }

  fn use_queries(ledger: &UsageLedger, id: &SubscriberId, n: u32) {
    for _ in 0..n {
      ledger.increment(id, UsageField::Queries, now());
    }
  }

  #[tokio::test]
  async fn free_plan_at_limit_is_denied_with_upgrade_hint() {
    let (enforcer, ledger) = enforcer_with(PlanCatalog::builtin());
    let id = SubscriberId::from("alice");
    use_queries(&ledger, &id, 50);

    let decision = enforcer.authorize(&id, Action::Query, now()).await.unwrap();
    assert_eq!(
      decision,
      Decision::Deny(DenyReason::QuotaExceeded {
        used:    50,
        limit:   50,
        upgrade: Some(PlanId::from("pro")),
      })
    );
  }

  #[tokio::test]
  async fn one_below_limit_is_admitted() {
    let (enforcer, ledger) = enforcer_with(PlanCatalog::builtin());
    let id = SubscriberId::from("alice");
    use_queries(&ledger, &id, 49);
    let decision = enforcer.authorize(&id, Action::Query, now()).await.unwrap();
    assert!(decision.is_admit());
  }

  #[tokio::test]
  async fn admission_never_lets_usage_pass_the_limit() {
    let (enforcer, ledger) = enforcer_with(PlanCatalog::builtin());
    let id = SubscriberId::from("alice");
    let mut admitted = 0;
    for _ in 0..80 {
      if enforcer.authorize(&id, Action::Query, now()).await.unwrap().is_admit() {
        ledger.increment(&id, UsageField::Queries, now());
        admitted += 1;
      }
      assert!(ledger.current_usage(&id, now()).queries_used <= 50);
    }
    assert_eq!(admitted, 50);
  }

  #[tokio::test]
  async fn zero_quota_plan_always_denies() {
    let catalog = PlanCatalog::from_specs([PlanSpec {
      id: "locked".into(),
      name: "Locked".into(),
      monthly_price_usd: 0,
      max_queries: 0,
      response_time_target: String::new(),
      support_tier: String::new(),
      features: Vec::new(),
      popular: false,
    }])
    .unwrap();
    let (enforcer, _) = enforcer_with(catalog);
    let decision = enforcer
      .authorize(&SubscriberId::from("alice"), Action::Query, now())
      .await
      .unwrap();
    assert_eq!(
      decision,
      Decision::Deny(DenyReason::QuotaExceeded { used: 0, limit: 0, upgrade: None })
    );
  }

  #[tokio::test]
  async fn unmetered_actions_are_always_admitted() {
    let (enforcer, ledger) = enforcer_with(PlanCatalog::builtin());
    let id = SubscriberId::from("alice");
    use_queries(&ledger, &id, 50);
    for action in [Action::Report, Action::FlagThreat] {
      assert!(enforcer.authorize(&id, action, now()).await.unwrap().is_admit());
    }
  }

  #[tokio::test]
  async fn top_tier_denial_has_no_upgrade() {
    let (enforcer, ledger) = enforcer_with(PlanCatalog::builtin());
    let id = SubscriberId::from("bigcorp");
    enforcer
      .store
      .save_subscriber(Subscriber::new(id.clone(), PlanId::from("enterprise"), now()))
      .await
      .unwrap();
    use_queries(&ledger, &id, 2000);
    let err = enforcer
      .authorize(&id, Action::Query, now())
      .await
      .unwrap()
      .into_result()
      .unwrap_err();
    assert!(matches!(
      err,
      Error::QuotaExceeded { used: 2000, limit: 2000, upgrade: None }
    ));
  }

  #[tokio::test]
  async fn recorded_usage_survives_a_fresh_ledger() {
    let store = Arc::new(MemoryStore::new());
    let catalog = Arc::new(PlanCatalog::builtin());
    let id = SubscriberId::from("alice");
    let enforcer = |ledger| {
      QuotaEnforcer::new(
        store.clone(),
        catalog.clone(),
        Arc::new(ledger),
        Arc::new(SubscriberLocks::new()),
      )
    };

    let before = enforcer(UsageLedger::new());
    for _ in 0..50 {
      before.record(&id, Action::Query, now()).await.unwrap();
    }
    before.record(&id, Action::Report, now()).await.unwrap();

    // A new process starts with an empty ledger over the same store.
    let after = enforcer(UsageLedger::new());
    let usage = after.usage(&id, now()).await.unwrap();
    assert_eq!(usage.queries_used, 50);
    assert_eq!(usage.reports_generated, 1);
    assert!(!after.authorize(&id, Action::Query, now()).await.unwrap().is_admit());
  }

  #[tokio::test]
  async fn lapsed_cycle_is_written_back_and_archived() {
    let store = Arc::new(MemoryStore::new());
    let enforcer = QuotaEnforcer::new(
      store.clone(),
      Arc::new(PlanCatalog::builtin()),
      Arc::new(UsageLedger::new()),
      Arc::new(SubscriberLocks::new()),
    );
    let id = SubscriberId::from("alice");
    enforcer.record(&id, Action::Query, now()).await.unwrap();

    let later = now() + chrono::Duration::days(40);
    assert!(enforcer.authorize(&id, Action::Query, later).await.unwrap().is_admit());
    let stored = store.load_usage(&id, 5).await.unwrap();
    assert_eq!(stored.len(), 2);
    assert_eq!(stored[0].cycle_start, later);
    assert_eq!(stored[1].queries_used, 1);
    assert_eq!(enforcer.history(&id).await.unwrap()[0].queries_used, 1);
  }

  #[tokio::test]
  async fn subscriber_on_unknown_plan_is_an_error() {
    let (enforcer, _) = enforcer_with(PlanCatalog::builtin());
    let id = SubscriberId::from("ghost");
    enforcer
      .store
      .save_subscriber(Subscriber::new(id.clone(), PlanId::from("retired"), now()))
      .await
      .unwrap();
    let err = enforcer.authorize(&id, Action::Query, now()).await.unwrap_err();
    assert!(matches!(err, Error::UnknownPlan(_)));
  }
}
