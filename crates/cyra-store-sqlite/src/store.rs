//! [`SqliteStore`], the SQLite implementation of [`SubscriberStore`].

use std::path::Path;

use rusqlite::OptionalExtension as _;

use cyra_core::{
  ledger::UsageRecord,
  store::SubscriberStore,
  subscriber::{Subscriber, SubscriberId},
};

use crate::{
  Error, Result,
  encode::{RawSubscriber, RawUsage, encode_dt},
  schema::SCHEMA,
};

// ─── Store ───────────────────────────────────────────────────────────────────

/// A subscriber store backed by a single SQLite file.
///
/// Cloning is cheap; the inner connection is reference-counted.
#[derive(Clone)]
pub struct SqliteStore {
  conn: tokio_rusqlite::Connection,
}

impl SqliteStore {
  /// Open (or create) a store at `path` and run schema initialisation.
  pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open(path).await?;
    let store = Self { conn };
    store.init_schema().await?;
    Ok(store)
  }

  /// Open an in-memory store for tests.
  pub async fn open_in_memory() -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open_in_memory().await?;
    let store = Self { conn };
    store.init_schema().await?;
    Ok(store)
  }

  async fn init_schema(&self) -> Result<()> {
    self
      .conn
      .call(|conn| {
        conn.execute_batch(SCHEMA)?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  async fn fetch(&self, id: &SubscriberId) -> Result<Option<Subscriber>> {
    let id_str = id.as_str().to_owned();
    let raw: Option<RawSubscriber> = self
      .conn
      .call(move |conn| {
        Ok(
          conn
            .query_row(
              &format!(
                "SELECT {} FROM subscribers WHERE subscriber_id = ?1",
                RawSubscriber::COLUMNS
              ),
              rusqlite::params![id_str],
              RawSubscriber::from_row,
            )
            .optional()?,
        )
      })
      .await?;

    raw.map(RawSubscriber::into_subscriber).transpose()
  }
}

// ─── SubscriberStore impl ────────────────────────────────────────────────────

impl SubscriberStore for SqliteStore {
  type Error = Error;

  async fn get_subscriber<'a>(&'a self, id: &'a SubscriberId) -> Result<Option<Subscriber>> {
    self.fetch(id).await
  }

  async fn enrol_subscriber(&self, subscriber: Subscriber) -> Result<Subscriber> {
    let id_str = subscriber.subscriber_id.as_str().to_owned();
    let plan_str = subscriber.plan_id.as_str().to_owned();
    let at_str = encode_dt(subscriber.assigned_at);

    let inserted = self
      .conn
      .call(move |conn| {
        Ok(conn.execute(
          "INSERT OR IGNORE INTO subscribers (subscriber_id, plan_id, assigned_at) \
           VALUES (?1, ?2, ?3)",
          rusqlite::params![id_str, plan_str, at_str],
        )?)
      })
      .await?;

    if inserted == 0 {
      tracing::debug!(subscriber = %subscriber.subscriber_id, "already enrolled");
    }
    // Whichever row won the insert is authoritative.
    Ok(self.fetch(&subscriber.subscriber_id).await?.unwrap_or(subscriber))
  }

  async fn save_subscriber(&self, subscriber: Subscriber) -> Result<()> {
    let id_str = subscriber.subscriber_id.as_str().to_owned();
    let plan_str = subscriber.plan_id.as_str().to_owned();
    let at_str = encode_dt(subscriber.assigned_at);

    self
      .conn
      .call(move |conn| {
        conn.execute(
          "INSERT INTO subscribers (subscriber_id, plan_id, assigned_at) \
           VALUES (?1, ?2, ?3) \
           ON CONFLICT (subscriber_id) DO UPDATE SET \
             plan_id = excluded.plan_id, \
             assigned_at = excluded.assigned_at",
          rusqlite::params![id_str, plan_str, at_str],
        )?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  async fn list_subscribers(&self) -> Result<Vec<Subscriber>> {
    let raws: Vec<RawSubscriber> = self
      .conn
      .call(|conn| {
        let mut stmt = conn.prepare(&format!(
          "SELECT {} FROM subscribers ORDER BY subscriber_id",
          RawSubscriber::COLUMNS
        ))?;
        let rows = stmt
          .query_map([], RawSubscriber::from_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    raws.into_iter().map(RawSubscriber::into_subscriber).collect()
  }

  async fn load_usage<'a>(
    &'a self,
    id: &'a SubscriberId,
    limit: usize,
  ) -> Result<Vec<UsageRecord>> {
    let id_str = id.as_str().to_owned();
    let limit = i64::try_from(limit).unwrap_or(i64::MAX);
    let raws: Vec<RawUsage> = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(&format!(
          "SELECT {} FROM usage_records WHERE subscriber_id = ?1 \
           ORDER BY cycle_start DESC LIMIT ?2",
          RawUsage::COLUMNS
        ))?;
        let rows = stmt
          .query_map(rusqlite::params![id_str, limit], RawUsage::from_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    raws.into_iter().map(RawUsage::into_record).collect()
  }

  async fn save_usage(&self, record: UsageRecord) -> Result<()> {
    let raw = RawUsage::from_record(&record);

    self
      .conn
      .call(move |conn| {
        conn.execute(
          &format!(
            "INSERT INTO usage_records ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
             ON CONFLICT (subscriber_id, cycle_start) DO UPDATE SET \
               reset_at = excluded.reset_at, \
               queries_used = excluded.queries_used, \
               reports_generated = excluded.reports_generated, \
               threats_flagged = excluded.threats_flagged",
            RawUsage::COLUMNS
          ),
          rusqlite::params![
            raw.subscriber_id,
            raw.cycle_start,
            raw.reset_at,
            raw.queries_used,
            raw.reports_generated,
            raw.threats_flagged,
          ],
        )?;
        Ok(())
      })
      .await?;
    Ok(())
  }
}
