//! Subscriber identity and plan assignment.
//!
//! The core never authenticates: a [`SubscriberId`] arrives already trusted
//! from the surrounding application.

use std::{fmt, sync::Arc};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::catalog::PlanId;

/// Opaque subscriber identifier supplied by the identity source.
#[derive(
  Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct SubscriberId(String);

impl SubscriberId {
  pub fn new(id: impl Into<String>) -> Self { Self(id.into()) }

  pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Display for SubscriberId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

impl From<&str> for SubscriberId {
  fn from(s: &str) -> Self { Self(s.to_owned()) }
}

impl From<String> for SubscriberId {
  fn from(s: String) -> Self { Self(s) }
}

/// A subscriber's current plan assignment. Mutated only by the plan
/// transition workflow; never deleted by the core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscriber {
  pub subscriber_id: SubscriberId,
  pub plan_id:       PlanId,
  pub assigned_at:   DateTime<Utc>,
}

impl Subscriber {
  pub fn new(
    subscriber_id: SubscriberId,
    plan_id: PlanId,
    assigned_at: DateTime<Utc>,
  ) -> Self {
    Self { subscriber_id, plan_id, assigned_at }
  }
}

/// Per-subscriber exclusive sections.
///
/// Each subscriber gets its own async mutex, so work for different
/// subscribers never contends on a shared lock.
#[derive(Debug, Default)]
pub struct SubscriberLocks {
  locks: DashMap<SubscriberId, Arc<Mutex<()>>>,
}

impl SubscriberLocks {
  pub fn new() -> Self { Self::default() }

  /// Enter the exclusive section for `id`, waiting for any current holder.
  pub async fn lock(&self, id: &SubscriberId) -> OwnedMutexGuard<()> {
    // Clone the Arc out so the shard guard is released before awaiting.
    let mutex = self.locks.entry(id.clone()).or_default().clone();
    mutex.lock_owned().await
  }
}

#[cfg(test)]
mod tests {
  use std::time::Duration;

  use super::*;

  #[tokio::test]
  async fn same_subscriber_sections_serialize() {
    let locks = Arc::new(SubscriberLocks::new());
    let id = SubscriberId::from("alice");

    let guard = locks.lock(&id).await;
    let contender = {
      let locks = locks.clone();
      let id = id.clone();
      tokio::spawn(async move {
        let _g = locks.lock(&id).await;
      })
    };

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!contender.is_finished());
    drop(guard);
    contender.await.unwrap();
  }

  #[tokio::test]
  async fn different_subscribers_do_not_block() {
    let locks = SubscriberLocks::new();
    let _alice = locks.lock(&SubscriberId::from("alice")).await;
    let bob = tokio::time::timeout(
      Duration::from_millis(100),
      locks.lock(&SubscriberId::from("bob")),
    )
    .await;
    assert!(bob.is_ok());
  }
}
