//! SQL schema for the cyra SQLite store.
//!
//! Executed once at connection startup. Future migrations will be gated on
//! `PRAGMA user_version`.

/// Full schema DDL; idempotent thanks to `CREATE TABLE IF NOT EXISTS`.
pub const SCHEMA: &str = "
PRAGMA journal_mode = WAL;

-- One row per subscriber; rows are replaced on plan change, never deleted.
CREATE TABLE IF NOT EXISTS subscribers (
    subscriber_id TEXT PRIMARY KEY,
    plan_id       TEXT NOT NULL,
    assigned_at   TEXT NOT NULL    -- RFC 3339 UTC
);

CREATE INDEX IF NOT EXISTS subscribers_plan_idx ON subscribers(plan_id);

-- One row per quota cycle. The newest cycle_start is the active record;
-- earlier rows are the archive.
CREATE TABLE IF NOT EXISTS usage_records (
    subscriber_id     TEXT NOT NULL,
    cycle_start       TEXT NOT NULL,  -- fixed-width RFC 3339 UTC, sorts by time
    reset_at          TEXT NOT NULL,
    queries_used      INTEGER NOT NULL DEFAULT 0,
    reports_generated INTEGER NOT NULL DEFAULT 0,
    threats_flagged   INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (subscriber_id, cycle_start)
);

PRAGMA user_version = 2;
";
