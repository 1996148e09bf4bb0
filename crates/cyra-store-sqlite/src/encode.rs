//! Conversions between domain types and the plain-text SQLite columns.
//!
//! Timestamps are stored as fixed-width RFC 3339 UTC strings, so text order
//! is time order; identifiers as given.

use chrono::{DateTime, SecondsFormat, Utc};
use cyra_core::{
  catalog::PlanId,
  ledger::UsageRecord,
  subscriber::{Subscriber, SubscriberId},
};

use crate::{Error, Result};

pub fn encode_dt(dt: DateTime<Utc>) -> String {
  dt.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub fn decode_dt(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| Error::DateParse(e.to_string()))
}

/// Raw strings read directly from a `subscribers` row.
pub struct RawSubscriber {
  pub subscriber_id: String,
  pub plan_id:       String,
  pub assigned_at:   String,
}

impl RawSubscriber {
  pub const COLUMNS: &'static str = "subscriber_id, plan_id, assigned_at";

  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      subscriber_id: row.get(0)?,
      plan_id:       row.get(1)?,
      assigned_at:   row.get(2)?,
    })
  }

  pub fn into_subscriber(self) -> Result<Subscriber> {
    Ok(Subscriber {
      subscriber_id: SubscriberId::from(self.subscriber_id),
      plan_id:       PlanId::new(self.plan_id),
      assigned_at:   decode_dt(&self.assigned_at)?,
    })
  }
}

/// Raw values read directly from a `usage_records` row.
pub struct RawUsage {
  pub subscriber_id:     String,
  pub cycle_start:       String,
  pub reset_at:          String,
  pub queries_used:      u32,
  pub reports_generated: u32,
  pub threats_flagged:   u32,
}

impl RawUsage {
  pub const COLUMNS: &'static str = "subscriber_id, cycle_start, reset_at, \
    queries_used, reports_generated, threats_flagged";

  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      subscriber_id:     row.get(0)?,
      cycle_start:       row.get(1)?,
      reset_at:          row.get(2)?,
      queries_used:      row.get(3)?,
      reports_generated: row.get(4)?,
      threats_flagged:   row.get(5)?,
    })
  }

  pub fn from_record(record: &UsageRecord) -> Self {
    Self {
      subscriber_id:     record.subscriber_id.as_str().to_owned(),
      cycle_start:       encode_dt(record.cycle_start),
      reset_at:          encode_dt(record.reset_at),
      queries_used:      record.queries_used,
      reports_generated: record.reports_generated,
      threats_flagged:   record.threats_flagged,
    }
  }

  pub fn into_record(self) -> Result<UsageRecord> {
    Ok(UsageRecord {
      subscriber_id:     SubscriberId::from(self.subscriber_id),
      cycle_start:       decode_dt(&self.cycle_start)?,
      reset_at:          decode_dt(&self.reset_at)?,
      queries_used:      self.queries_used,
      reports_generated: self.reports_generated,
      threats_flagged:   self.threats_flagged,
    })
  }
}
