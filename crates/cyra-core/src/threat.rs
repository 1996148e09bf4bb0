//! Threat feed aggregator: a bounded, deduplicated, newest-first cache of
//! threat-intelligence items.
//!
//! An external scheduler drives [`ThreatFeed::poll`]. Reads never touch the
//! provider, so their latency is independent of it. A failed poll leaves the
//! cache exactly as it was.

use std::{
  collections::{BTreeMap, BTreeSet, HashMap, VecDeque},
  sync::Arc,
  time::Duration,
};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::{
  error::FeedError,
  provider::{ThreatIntelProvider, ThreatRecord},
};

// ─── Items ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreatItem {
  /// Provider identifier; the deduplication key.
  pub threat_id:    String,
  pub title:        String,
  pub description:  String,
  pub author:       String,
  pub published_at: DateTime<Utc>,
  pub tags:         BTreeSet<String>,
}

impl From<ThreatRecord> for ThreatItem {
  fn from(r: ThreatRecord) -> Self {
    Self {
      threat_id:    r.id,
      title:        r.name,
      description:  r.description,
      author:       r.author,
      published_at: r.created_at,
      tags:         r
        .tags
        .into_iter()
        .map(|t| t.trim().to_owned())
        .filter(|t| !t.is_empty())
        .collect(),
    }
  }
}

/// What one merge did to the cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollReport {
  /// Previously unseen identifiers added at the front.
  pub inserted: usize,
  /// Known identifiers whose fields were refreshed.
  pub updated:  usize,
  /// Oldest entries dropped to stay within capacity.
  pub evicted:  usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PollOutcome {
  Merged(PollReport),
  Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollStatus {
  pub at:      DateTime<Utc>,
  #[serde(flatten)]
  pub outcome: PollOutcome,
}

// ─── Cache ───────────────────────────────────────────────────────────────────

/// Newest-first, capacity-bounded item list keyed by `threat_id`.
#[derive(Debug, Clone)]
pub struct ThreatCache {
  items:    VecDeque<ThreatItem>,
  capacity: usize,
}

impl ThreatCache {
  pub fn new(capacity: usize) -> Self {
    Self { items: VecDeque::new(), capacity: capacity.max(1) }
  }

  fn position(&self, threat_id: &str) -> Option<usize> {
    self.items.iter().position(|i| i.threat_id == threat_id)
  }

  /// Merge a provider batch.
  ///
  /// - unseen ids go to the front;
  /// - a seen id with a newer timestamp is refreshed and moves to the front;
  /// - a seen id with the same timestamp is refreshed in place;
  /// - a seen id with an older timestamp is stale and ignored.
  pub fn merge(&mut self, batch: impl IntoIterator<Item = ThreatItem>) -> PollReport {
    let mut report = PollReport::default();

    // Collapse duplicates inside the batch, keeping the newest copy.
    let mut order = Vec::new();
    let mut newest: HashMap<String, ThreatItem> = HashMap::new();
    for item in batch {
      match newest.get(&item.threat_id) {
        Some(seen) if seen.published_at >= item.published_at => {}
        Some(_) => {
          newest.insert(item.threat_id.clone(), item);
        }
        None => {
          order.push(item.threat_id.clone());
          newest.insert(item.threat_id.clone(), item);
        }
      }
    }

    let mut front = Vec::new();
    for item in order.into_iter().filter_map(|id| newest.remove(&id)) {
      match self.position(&item.threat_id) {
        None => {
          report.inserted += 1;
          front.push(item);
        }
        Some(idx) => {
          let cached = &self.items[idx];
          if item.published_at > cached.published_at {
            self.items.remove(idx);
            report.updated += 1;
            front.push(item);
          } else if item.published_at == cached.published_at && *cached != item {
            self.items[idx] = item;
            report.updated += 1;
          }
        }
      }
    }

    front.sort_by(|a, b| b.published_at.cmp(&a.published_at));
    for item in front.into_iter().rev() {
      self.items.push_front(item);
    }
    while self.items.len() > self.capacity {
      self.items.pop_back();
      report.evicted += 1;
    }
    report
  }

  pub fn recent(&self, limit: usize) -> Vec<ThreatItem> {
    self.items.iter().take(limit).cloned().collect()
  }

  pub fn get(&self, threat_id: &str) -> Option<ThreatItem> {
    self.position(threat_id).map(|idx| self.items[idx].clone())
  }

  /// Items per tag over the current contents, computed fresh each call.
  pub fn tag_distribution(&self) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for tag in self.items.iter().flat_map(|i| i.tags.iter()) {
      *counts.entry(tag.clone()).or_insert(0) += 1;
    }
    counts
  }

  pub fn len(&self) -> usize { self.items.len() }

  pub fn is_empty(&self) -> bool { self.items.is_empty() }
}

// ─── Aggregator ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct FeedConfig {
  pub capacity: usize,
  pub timeout:  Duration,
}

impl Default for FeedConfig {
  fn default() -> Self {
    Self { capacity: 50, timeout: Duration::from_secs(20) }
  }
}

/// Exclusively owns the threat cache.
pub struct ThreatFeed {
  provider:  Arc<dyn ThreatIntelProvider>,
  timeout:   Duration,
  cache:     RwLock<ThreatCache>,
  last_poll: RwLock<Option<PollStatus>>,
}

impl ThreatFeed {
  pub fn new(provider: Arc<dyn ThreatIntelProvider>, config: FeedConfig) -> Self {
    Self {
      provider,
      timeout: config.timeout,
      cache: RwLock::new(ThreatCache::new(config.capacity)),
      last_poll: RwLock::new(None),
    }
  }

  /// Fetch the latest batch and merge it. No state carries over between
  /// polls; a failure is recorded and returned, and the next scheduled poll
  /// simply tries again.
  pub async fn poll(&self, now: DateTime<Utc>) -> Result<PollReport, FeedError> {
    let fetched = tokio::time::timeout(self.timeout, self.provider.fetch_latest())
      .await
      .unwrap_or(Err(FeedError::Timeout));

    let outcome = fetched.map(|batch| {
      let items = batch.into_iter().map(ThreatItem::from);
      self.cache.write().merge(items)
    });

    let status = match &outcome {
      Ok(report) => {
        tracing::debug!(
          inserted = report.inserted,
          updated = report.updated,
          evicted = report.evicted,
          "threat feed merged"
        );
        PollOutcome::Merged(*report)
      }
      Err(error) => {
        tracing::warn!(%error, "threat feed poll failed; cache left unchanged");
        PollOutcome::Failed { error: error.to_string() }
      }
    };
    *self.last_poll.write() = Some(PollStatus { at: now, outcome: status });
    outcome
  }

  pub fn recent(&self, limit: usize) -> Vec<ThreatItem> { self.cache.read().recent(limit) }

  pub fn get(&self, threat_id: &str) -> Option<ThreatItem> { self.cache.read().get(threat_id) }

  pub fn tag_distribution(&self) -> BTreeMap<String, usize> {
    self.cache.read().tag_distribution()
  }

  pub fn len(&self) -> usize { self.cache.read().len() }

  pub fn is_empty(&self) -> bool { self.cache.read().is_empty() }

  pub fn last_poll(&self) -> Option<PollStatus> { self.last_poll.read().clone() }
}

#[cfg(test)]
mod tests {
  use async_trait::async_trait;
  use chrono::{Duration as TimeDelta, TimeZone};
  use parking_lot::Mutex;

  use super::*;

  fn t(minutes: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap() + TimeDelta::minutes(minutes)
  }

  fn record(id: &str, at: DateTime<Utc>, description: &str, tags: &[&str]) -> ThreatRecord {
    ThreatRecord {
      id:          id.into(),
      name:        format!("pulse {id}"),
      description: description.into(),
      author:      "AlienVault".into(),
      created_at:  at,
      tags:        tags.iter().map(|t| (*t).to_owned()).collect(),
    }
  }

  /// Serves queued batches in order; an empty queue is a transport error.
  #[derive(Default)]
  struct Batches(Mutex<VecDeque<Result<Vec<ThreatRecord>, FeedError>>>);

  impl Batches {
    fn push(&self, batch: Result<Vec<ThreatRecord>, FeedError>) { self.0.lock().push_back(batch); }
  }

  #[async_trait]
  impl ThreatIntelProvider for Batches {
    async fn fetch_latest(&self) -> Result<Vec<ThreatRecord>, FeedError> {
      self
        .0
        .lock()
        .pop_front()
        .unwrap_or_else(|| Err(FeedError::Transport("no batch queued".into())))
    }
  }

  struct Hanging;

  #[async_trait]
  impl ThreatIntelProvider for Hanging {
    async fn fetch_latest(&self) -> Result<Vec<ThreatRecord>, FeedError> {
      tokio::time::sleep(Duration::from_secs(60)).await;
      Ok(Vec::new())
    }
  }

  fn feed(provider: Arc<dyn ThreatIntelProvider>, capacity: usize) -> ThreatFeed {
    ThreatFeed::new(provider, FeedConfig { capacity, ..FeedConfig::default() })
  }

  fn ids(feed: &ThreatFeed) -> Vec<String> {
    feed.recent(usize::MAX).into_iter().map(|i| i.threat_id).collect()
  }

  #[tokio::test]
  async fn stale_reingest_does_not_grow_or_overwrite() {
    let provider = Arc::new(Batches::default());
    provider.push(Ok((0..5)
      .map(|n| record(&format!("p{n}"), t(10 + n), "fresh", &["malware"]))
      .collect()));
    provider.push(Ok((0..3)
      .map(|n| record(&format!("p{n}"), t(n), "stale", &["phishing"]))
      .collect()));
    let feed = feed(provider, 50);

    let first = feed.poll(t(100)).await.unwrap();
    assert_eq!(first.inserted, 5);
    let second = feed.poll(t(200)).await.unwrap();
    assert_eq!(second, PollReport::default());

    assert_eq!(feed.len(), 5);
    for n in 0..3 {
      let item = feed.get(&format!("p{n}")).unwrap();
      assert_eq!(item.description, "fresh");
      assert!(item.tags.contains("malware"));
      assert!(!item.tags.contains("phishing"));
    }
  }

  #[test]
  fn new_items_go_to_front_and_capacity_evicts_oldest() {
    let mut cache = ThreatCache::new(3);
    cache.merge([record("a", t(1), "", &[]), record("b", t(2), "", &[])].map(ThreatItem::from));
    let report =
      cache.merge([record("c", t(3), "", &[]), record("d", t(4), "", &[])].map(ThreatItem::from));
    assert_eq!(report, PollReport { inserted: 2, updated: 0, evicted: 1 });
    let ids: Vec<_> = cache.recent(10).into_iter().map(|i| i.threat_id).collect();
    assert_eq!(ids, ["d", "c", "b"]);
  }

  #[test]
  fn same_timestamp_refreshes_in_place() {
    let mut cache = ThreatCache::new(10);
    cache.merge([record("a", t(1), "v1", &[]), record("b", t(2), "", &[])].map(ThreatItem::from));
    let report = cache.merge([ThreatItem::from(record("a", t(1), "v2", &[]))]);
    assert_eq!(report.updated, 1);
    let items = cache.recent(10);
    assert_eq!(items[1].threat_id, "a");
    assert_eq!(items[1].description, "v2");
  }

  #[test]
  fn newer_timestamp_refreshes_and_moves_to_front() {
    let mut cache = ThreatCache::new(10);
    cache.merge([record("a", t(1), "v1", &[]), record("b", t(2), "", &[])].map(ThreatItem::from));
    let report = cache.merge([ThreatItem::from(record("a", t(5), "v2", &["apt"]))]);
    assert_eq!(report, PollReport { inserted: 0, updated: 1, evicted: 0 });
    let items = cache.recent(10);
    assert_eq!(items[0].threat_id, "a");
    assert_eq!(items[0].description, "v2");
    assert_eq!(cache.len(), 2);
  }

  #[test]
  fn duplicates_within_a_batch_keep_the_newest() {
    let mut cache = ThreatCache::new(10);
    let report = cache.merge(
      [record("a", t(1), "old", &[]), record("a", t(3), "new", &[])].map(ThreatItem::from),
    );
    assert_eq!(report.inserted, 1);
    assert_eq!(cache.get("a").unwrap().description, "new");
  }

  #[test]
  fn tag_distribution_reflects_current_contents_only() {
    let mut cache = ThreatCache::new(2);
    cache.merge([
      ThreatItem::from(record("a", t(1), "", &["ransomware", "malware"])),
      ThreatItem::from(record("b", t(2), "", &["malware"])),
    ]);
    assert_eq!(cache.tag_distribution().get("malware"), Some(&2));

    cache.merge([ThreatItem::from(record("c", t(3), "", &["phishing"]))]);
    let dist = cache.tag_distribution();
    assert_eq!(dist.get("malware"), Some(&1));
    assert_eq!(dist.get("ransomware"), None);
    assert_eq!(dist.get("phishing"), Some(&1));
  }

  #[tokio::test]
  async fn failed_poll_leaves_cache_untouched() {
    let provider = Arc::new(Batches::default());
    provider.push(Ok(vec![record("a", t(1), "", &[])]));
    provider.push(Err(FeedError::Status(503)));
    let feed = feed(provider, 10);

    feed.poll(t(10)).await.unwrap();
    let err = feed.poll(t(20)).await.unwrap_err();
    assert!(matches!(err, FeedError::Status(503)));
    assert_eq!(ids(&feed), ["a"]);

    let status = feed.last_poll().unwrap();
    assert_eq!(status.at, t(20));
    assert!(matches!(status.outcome, PollOutcome::Failed { .. }));
  }

  #[tokio::test]
  async fn slow_poll_times_out() {
    let feed = ThreatFeed::new(
      Arc::new(Hanging),
      FeedConfig { capacity: 10, timeout: Duration::from_millis(20) },
    );
    assert!(matches!(feed.poll(t(0)).await, Err(FeedError::Timeout)));
    assert!(feed.is_empty());
  }
}
