//! Usage ledger: per-subscriber counters over a rolling quota cycle.
//!
//! Each subscriber has exactly one active [`UsageRecord`]. When `now` reaches
//! the record's `reset_at`, the record is archived untouched and a fresh zero
//! record begins at `now`. Missed cycles are never backfilled.
//!
//! The ledger is a write-through cache over the store's usage records. An
//! account is loaded from the store the first time this process touches it
//! ([`UsageLedger::hydrate`]); every change is then written back by the
//! caller inside the subscriber's exclusive section.

use std::collections::VecDeque;

use chrono::{DateTime, Months, Utc};
use dashmap::{DashMap, mapref::entry::Entry};
use serde::{Deserialize, Serialize};

use crate::{Error, Result, store::SubscriberStore, subscriber::SubscriberId};

/// Rolled-over records retained per subscriber.
pub const ARCHIVE_DEPTH: usize = 12;

/// A metered counter on a [`UsageRecord`].
#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  Hash,
  Serialize,
  Deserialize,
  strum::Display,
  strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum UsageField {
  Queries,
  Reports,
  ThreatsFlagged,
}

/// Consumption for one subscriber over one quota cycle, keyed by
/// `(subscriber_id, cycle_start)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
  pub subscriber_id:     SubscriberId,
  pub cycle_start:       DateTime<Utc>,
  pub reset_at:          DateTime<Utc>,
  pub queries_used:      u32,
  pub reports_generated: u32,
  pub threats_flagged:   u32,
}

impl UsageRecord {
  fn fresh(subscriber_id: SubscriberId, now: DateTime<Utc>, cycle: Months) -> Self {
    Self {
      subscriber_id,
      cycle_start: now,
      reset_at: now.checked_add_months(cycle).unwrap_or(DateTime::<Utc>::MAX_UTC),
      queries_used: 0,
      reports_generated: 0,
      threats_flagged: 0,
    }
  }

  pub fn get(&self, field: UsageField) -> u32 {
    match field {
      UsageField::Queries => self.queries_used,
      UsageField::Reports => self.reports_generated,
      UsageField::ThreatsFlagged => self.threats_flagged,
    }
  }

  pub fn is_expired(&self, now: DateTime<Utc>) -> bool { now >= self.reset_at }

  fn bump(&mut self, field: UsageField) {
    let counter = match field {
      UsageField::Queries => &mut self.queries_used,
      UsageField::Reports => &mut self.reports_generated,
      UsageField::ThreatsFlagged => &mut self.threats_flagged,
    };
    *counter = counter.saturating_add(1);
  }
}

struct Account {
  active:  UsageRecord,
  /// Newest first.
  archive: VecDeque<UsageRecord>,
}

impl Account {
  fn archive_active(&mut self, next: UsageRecord) {
    let old = std::mem::replace(&mut self.active, next);
    self.archive.push_front(old);
    self.archive.truncate(ARCHIVE_DEPTH);
  }
}

/// Owns every [`UsageRecord`].
///
/// Accounts live in a sharded map; each operation runs inside that
/// subscriber's entry lock, so calls for one subscriber serialize while
/// different subscribers proceed independently.
pub struct UsageLedger {
  accounts: DashMap<SubscriberId, Account>,
  cycle:    Months,
}

impl Default for UsageLedger {
  fn default() -> Self { Self::new() }
}

impl UsageLedger {
  /// A ledger with a monthly quota cycle.
  pub fn new() -> Self { Self::with_cycle(Months::new(1)) }

  pub fn with_cycle(cycle: Months) -> Self {
    Self { accounts: DashMap::new(), cycle }
  }

  /// Apply `f` to the active record for the cycle containing `now`, creating
  /// or rolling the record forward first. The flag is `true` when this call
  /// began a new cycle.
  fn with_active<T>(
    &self,
    id: &SubscriberId,
    now: DateTime<Utc>,
    f: impl FnOnce(&mut UsageRecord) -> T,
  ) -> (T, bool) {
    let mut started = false;
    let mut account = self.accounts.entry(id.clone()).or_insert_with(|| {
      started = true;
      Account {
        active:  UsageRecord::fresh(id.clone(), now, self.cycle),
        archive: VecDeque::new(),
      }
    });
    if account.active.is_expired(now) {
      tracing::debug!(subscriber = %id, "usage cycle lapsed, rolling forward");
      account.archive_active(UsageRecord::fresh(id.clone(), now, self.cycle));
      started = true;
    }
    (f(&mut account.active), started)
  }

  /// The active record for the cycle containing `now`.
  pub fn current_usage(&self, id: &SubscriberId, now: DateTime<Utc>) -> UsageRecord {
    self.open_cycle(id, now).0
  }

  /// Like [`current_usage`](Self::current_usage), also reporting whether a
  /// new cycle was started and so needs writing back.
  pub fn open_cycle(&self, id: &SubscriberId, now: DateTime<Utc>) -> (UsageRecord, bool) {
    self.with_active(id, now, |record| record.clone())
  }

  /// Add one to `field` on the active record and return the updated record.
  pub fn increment(
    &self,
    id: &SubscriberId,
    field: UsageField,
    now: DateTime<Utc>,
  ) -> UsageRecord {
    self
      .with_active(id, now, |record| {
        record.bump(field);
        record.clone()
      })
      .0
  }

  /// Force an immediate rollover so a new plan's limit applies from `now`.
  pub fn reset_for(&self, id: &SubscriberId, now: DateTime<Utc>) -> UsageRecord {
    let fresh = UsageRecord::fresh(id.clone(), now, self.cycle);
    match self.accounts.entry(id.clone()) {
      Entry::Occupied(mut entry) => {
        entry.get_mut().archive_active(fresh.clone());
      }
      Entry::Vacant(entry) => {
        entry.insert(Account { active: fresh.clone(), archive: VecDeque::new() });
      }
    }
    fresh
  }

  /// Archived records for `id`, newest first.
  pub fn history(&self, id: &SubscriberId) -> Vec<UsageRecord> {
    self
      .accounts
      .get(id)
      .map(|account| account.archive.iter().cloned().collect())
      .unwrap_or_default()
  }

  // ─── Persistence ───────────────────────────────────────────────────────────

  pub fn is_tracked(&self, id: &SubscriberId) -> bool { self.accounts.contains_key(id) }

  /// Seed `id`'s account from persisted records, newest first. Does nothing
  /// if the account is already tracked or there is nothing to restore.
  pub fn restore(&self, id: &SubscriberId, records: Vec<UsageRecord>) {
    let mut records = records.into_iter();
    let Some(active) = records.next() else {
      return;
    };
    if let Entry::Vacant(entry) = self.accounts.entry(id.clone()) {
      entry.insert(Account { active, archive: records.take(ARCHIVE_DEPTH).collect() });
    }
  }

  /// Load `id`'s persisted records the first time this process sees it.
  /// Callers hold the subscriber's exclusive section.
  pub async fn hydrate<S: SubscriberStore>(&self, store: &S, id: &SubscriberId) -> Result<()> {
    if self.is_tracked(id) {
      return Ok(());
    }
    let records = store
      .load_usage(id, ARCHIVE_DEPTH + 1)
      .await
      .map_err(Error::store)?;
    if !records.is_empty() {
      tracing::debug!(subscriber = %id, records = records.len(), "restored usage");
    }
    self.restore(id, records);
    Ok(())
  }
}
