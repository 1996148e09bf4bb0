//! Integration tests for `SqliteStore` against an in-memory database.

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use cyra_core::{
  catalog::{PlanCatalog, PlanId},
  ledger::{UsageLedger, UsageRecord},
  quota::{Action, QuotaEnforcer},
  store::{SubscriberStore, get_or_enrol},
  subscriber::{Subscriber, SubscriberId, SubscriberLocks},
};

use crate::SqliteStore;

async fn store() -> SqliteStore {
  SqliteStore::open_in_memory()
    .await
    .expect("in-memory store")
}

fn at(day: u32) -> DateTime<Utc> { Utc.with_ymd_and_hms(2025, 8, day, 10, 0, 0).unwrap() }

fn subscriber(id: &str, plan: &str, day: u32) -> Subscriber {
  Subscriber::new(SubscriberId::from(id), PlanId::from(plan), at(day))
}

// ─── Subscribers ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn missing_subscriber_returns_none() {
  let s = store().await;
  let result = s.get_subscriber(&SubscriberId::from("nobody")).await.unwrap();
  assert!(result.is_none());
}

#[tokio::test]
async fn save_then_get() {
  let s = store().await;
  s.save_subscriber(subscriber("alice", "pro", 1)).await.unwrap();

  let fetched = s.get_subscriber(&SubscriberId::from("alice")).await.unwrap();
  assert_eq!(fetched, Some(subscriber("alice", "pro", 1)));
}

#[tokio::test]
async fn save_replaces_existing_assignment() {
  let s = store().await;
  s.save_subscriber(subscriber("alice", "free", 1)).await.unwrap();
  s.save_subscriber(subscriber("alice", "enterprise", 9)).await.unwrap();

  let fetched = s.get_subscriber(&SubscriberId::from("alice")).await.unwrap().unwrap();
  assert_eq!(fetched.plan_id.as_str(), "enterprise");
  assert_eq!(fetched.assigned_at, at(9));
  assert_eq!(s.list_subscribers().await.unwrap().len(), 1);
}

#[tokio::test]
async fn enrol_keeps_the_first_assignment() {
  let s = store().await;
  let first = s.enrol_subscriber(subscriber("alice", "pro", 1)).await.unwrap();
  assert_eq!(first.plan_id.as_str(), "pro");

  let second = s.enrol_subscriber(subscriber("alice", "free", 2)).await.unwrap();
  assert_eq!(second, subscriber("alice", "pro", 1));
}

#[tokio::test]
async fn list_is_ordered_by_id() {
  let s = store().await;
  for id in ["mallory", "bob", "alice"] {
    s.save_subscriber(subscriber(id, "free", 3)).await.unwrap();
  }
  let ids: Vec<_> = s
    .list_subscribers()
    .await
    .unwrap()
    .into_iter()
    .map(|s| s.subscriber_id.to_string())
    .collect();
  assert_eq!(ids, ["alice", "bob", "mallory"]);
}

#[tokio::test]
async fn first_contact_enrols_on_entry_plan() {
  let s = store().await;
  let catalog = PlanCatalog::builtin();
  let id = SubscriberId::from("carol");

  let enrolled = get_or_enrol(&s, &catalog, &id, at(4)).await.unwrap();
  assert_eq!(enrolled.plan_id.as_str(), "free");
  let again = get_or_enrol(&s, &catalog, &id, at(5)).await.unwrap();
  assert_eq!(again.assigned_at, at(4));
}

fn usage(id: &str, day: u32, queries: u32) -> UsageRecord {
  UsageRecord {
    subscriber_id:     SubscriberId::from(id),
    cycle_start:       at(day),
    reset_at:          at(day) + Duration::days(30),
    queries_used:      queries,
    reports_generated: 1,
    threats_flagged:   0,
  }
}

fn enforcer(store: Arc<SqliteStore>) -> QuotaEnforcer<SqliteStore> {
  QuotaEnforcer::new(
    store,
    Arc::new(PlanCatalog::builtin()),
    Arc::new(UsageLedger::new()),
    Arc::new(SubscriberLocks::new()),
  )
}

// ─── Usage ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn usage_upserts_by_cycle_start() {
  let s = store().await;
  s.save_usage(usage("alice", 1, 3)).await.unwrap();
  s.save_usage(usage("alice", 1, 4)).await.unwrap();

  let loaded = s.load_usage(&SubscriberId::from("alice"), 10).await.unwrap();
  assert_eq!(loaded, [usage("alice", 1, 4)]);
}

#[tokio::test]
async fn usage_loads_newest_cycle_first_within_limit() {
  let s = store().await;
  for (day, queries) in [(2, 20), (1, 10), (3, 30)] {
    s.save_usage(usage("alice", day, queries)).await.unwrap();
  }
  s.save_usage(usage("bob", 9, 99)).await.unwrap();

  let loaded = s.load_usage(&SubscriberId::from("alice"), 2).await.unwrap();
  let queries: Vec<_> = loaded.iter().map(|r| r.queries_used).collect();
  assert_eq!(queries, [30, 20]);
  assert!(s.load_usage(&SubscriberId::from("carol"), 2).await.unwrap().is_empty());
}

#[tokio::test]
async fn file_store_survives_reopen() {
  let dir = std::env::temp_dir().join(format!("cyra-store-{}", std::process::id()));
  std::fs::create_dir_all(&dir).unwrap();
  let path = dir.join("reopen.db");
  let _ = std::fs::remove_file(&path);

  {
    let s = SqliteStore::open(&path).await.unwrap();
    s.save_subscriber(subscriber("alice", "pro", 6)).await.unwrap();
  }
  let s = SqliteStore::open(&path).await.unwrap();
  let fetched = s.get_subscriber(&SubscriberId::from("alice")).await.unwrap();
  assert_eq!(fetched, Some(subscriber("alice", "pro", 6)));

  let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn exhausted_quota_survives_reopen() {
  let dir = std::env::temp_dir().join(format!("cyra-usage-{}", std::process::id()));
  std::fs::create_dir_all(&dir).unwrap();
  let path = dir.join("usage.db");
  let _ = std::fs::remove_file(&path);
  let id = SubscriberId::from("alice");

  {
    let quota = enforcer(Arc::new(SqliteStore::open(&path).await.unwrap()));
    for _ in 0..50 {
      quota.record(&id, Action::Query, at(7)).await.unwrap();
    }
    assert!(!quota.authorize(&id, Action::Query, at(7)).await.unwrap().is_admit());
  }

  let quota = enforcer(Arc::new(SqliteStore::open(&path).await.unwrap()));
  assert_eq!(quota.usage(&id, at(7)).await.unwrap().queries_used, 50);
  assert!(!quota.authorize(&id, Action::Query, at(7)).await.unwrap().is_admit());

  let _ = std::fs::remove_dir_all(&dir);
}
