//! The `SubscriberStore` trait and the in-memory implementation.
//!
//! The store persists plan assignments and usage records. Sessions, plan
//! transitions and the threat cache are owned in memory by their components.

use std::{convert::Infallible, future::Future};

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::{
  Error, Result,
  catalog::PlanCatalog,
  ledger::UsageRecord,
  subscriber::{Subscriber, SubscriberId},
};

// ─── Trait ───────────────────────────────────────────────────────────────────

/// Abstraction over subscriber persistence.
///
/// All methods return `Send` futures so the trait can be used in
/// multi-threaded async runtimes (e.g. tokio with `axum`).
pub trait SubscriberStore: Send + Sync {
  type Error: std::error::Error + Send + Sync + 'static;

  /// Retrieve a subscriber by id. Returns `None` if not found.
  fn get_subscriber<'a>(
    &'a self,
    id: &'a SubscriberId,
  ) -> impl Future<Output = Result<Option<Subscriber>, Self::Error>> + Send + 'a;

  /// Insert `subscriber` unless one with the same id already exists.
  /// Returns whichever record is stored afterwards.
  fn enrol_subscriber(
    &self,
    subscriber: Subscriber,
  ) -> impl Future<Output = Result<Subscriber, Self::Error>> + Send + '_;

  /// Insert or replace the plan assignment for `subscriber.subscriber_id`.
  fn save_subscriber(
    &self,
    subscriber: Subscriber,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

  /// All subscribers, ordered by id.
  fn list_subscribers(
    &self,
  ) -> impl Future<Output = Result<Vec<Subscriber>, Self::Error>> + Send + '_;

  /// Up to `limit` usage records for `id`, newest cycle first. The first is
  /// the active record.
  fn load_usage<'a>(
    &'a self,
    id: &'a SubscriberId,
    limit: usize,
  ) -> impl Future<Output = Result<Vec<UsageRecord>, Self::Error>> + Send + 'a;

  /// Insert or replace the record keyed by `(subscriber_id, cycle_start)`.
  /// Earlier cycles are left in place as the archive.
  fn save_usage(
    &self,
    record: UsageRecord,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;
}

/// Fetch `id`, enrolling it on the catalog's entry plan if it has never been
/// seen. Identities arrive pre-authenticated, so first contact is enrolment.
pub async fn get_or_enrol<S: SubscriberStore>(
  store: &S,
  catalog: &PlanCatalog,
  id: &SubscriberId,
  now: DateTime<Utc>,
) -> Result<Subscriber> {
  if let Some(existing) = store.get_subscriber(id).await.map_err(Error::store)? {
    return Ok(existing);
  }
  let entry = Subscriber::new(id.clone(), catalog.entry_plan().id.clone(), now);
  let stored = store.enrol_subscriber(entry).await.map_err(Error::store)?;
  tracing::info!(subscriber = %id, plan = %stored.plan_id, "enrolled subscriber");
  Ok(stored)
}

// ─── In-memory store ─────────────────────────────────────────────────────────

/// A [`SubscriberStore`] held entirely in memory. Useful for tests and for
/// running without a database.
#[derive(Debug, Default)]
pub struct MemoryStore {
  subscribers: DashMap<SubscriberId, Subscriber>,
  /// Oldest cycle first.
  usage:       DashMap<SubscriberId, Vec<UsageRecord>>,
}

impl MemoryStore {
  pub fn new() -> Self { Self::default() }
}

impl SubscriberStore for MemoryStore {
  type Error = Infallible;

  async fn get_subscriber<'a>(
    &'a self,
    id: &'a SubscriberId,
  ) -> Result<Option<Subscriber>, Infallible> {
    Ok(self.subscribers.get(id).map(|s| s.clone()))
  }

  async fn enrol_subscriber(
    &self,
    subscriber: Subscriber,
  ) -> Result<Subscriber, Infallible> {
    Ok(
      self
        .subscribers
        .entry(subscriber.subscriber_id.clone())
        .or_insert(subscriber)
        .clone(),
    )
  }

  async fn save_subscriber(&self, subscriber: Subscriber) -> Result<(), Infallible> {
    self.subscribers.insert(subscriber.subscriber_id.clone(), subscriber);
    Ok(())
  }

  async fn list_subscribers(&self) -> Result<Vec<Subscriber>, Infallible> {
    let mut all: Vec<_> = self.subscribers.iter().map(|s| s.clone()).collect();
    all.sort_by(|a, b| a.subscriber_id.cmp(&b.subscriber_id));
    Ok(all)
  }

  async fn load_usage<'a>(
    &'a self,
    id: &'a SubscriberId,
    limit: usize,
  ) -> Result<Vec<UsageRecord>, Infallible> {
    Ok(
      self
        .usage
        .get(id)
        .map(|records| records.iter().rev().take(limit).cloned().collect())
        .unwrap_or_default(),
    )
  }

  async fn save_usage(&self, record: UsageRecord) -> Result<(), Infallible> {
    let mut records = self.usage.entry(record.subscriber_id.clone()).or_default();
    match records.binary_search_by_key(&record.cycle_start, |r| r.cycle_start) {
      Ok(at) => records[at] = record,
      Err(at) => records.insert(at, record),
    }
    Ok(())
  }
}
