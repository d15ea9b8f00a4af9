// 📦 Load Batch - one attempt to load one window of one source

use crate::db::{format_timestamp, insert_event, parse_timestamp, Event};
use crate::error::{EtlError, Result};
use crate::source::Source;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Running,
    Committed,
    Failed,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Running => "running",
            BatchStatus::Committed => "committed",
            BatchStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, BatchStatus::Running)
    }
}

/// Unknown stored values read as `Failed`, never as in flight
impl From<String> for BatchStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "running" => BatchStatus::Running,
            "committed" => BatchStatus::Committed,
            _ => BatchStatus::Failed,
        }
    }
}

/// Record counts accumulated while a batch runs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchCounts {
    /// Raw records returned by the source
    pub extracted: usize,
    /// Documents new to the warehouse
    pub inserted: usize,
    /// Documents whose content changed since they were last loaded
    pub updated: usize,
    /// Documents seen before with identical content
    pub unchanged: usize,
    /// Lines quarantined because no item matched
    pub unresolved: usize,
    /// Documents dropped by data-quality checks
    pub rejected: usize,
}

impl BatchCounts {
    pub fn loaded(&self) -> usize {
        self.inserted + self.updated + self.unchanged
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadBatch {
    pub batch_id: String,
    pub source: Source,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub attempt: u32,
    pub status: BatchStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub counts: BatchCounts,
    pub error_count: usize,
    pub error_message: Option<String>,
}

impl LoadBatch {
    pub fn new(source: Source, window_start: DateTime<Utc>, window_end: DateTime<Utc>, attempt: u32) -> Self {
        LoadBatch {
            batch_id: uuid::Uuid::new_v4().to_string(),
            source,
            window_start,
            window_end,
            attempt,
            status: BatchStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
            counts: BatchCounts::default(),
            error_count: 0,
            error_message: None,
        }
    }
}

/// Insert a `running` batch row
pub fn start_batch(conn: &Connection, batch: &LoadBatch) -> Result<()> {
    conn.execute(
        "INSERT INTO load_batches (
            batch_id, source, window_start, window_end, attempt, status, started_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            batch.batch_id,
            batch.source.code(),
            format_timestamp(batch.window_start),
            format_timestamp(batch.window_end),
            batch.attempt,
            BatchStatus::Running.as_str(),
            format_timestamp(batch.started_at),
        ],
    )?;

    insert_event(
        conn,
        &Event::new(
            "batch_started",
            "load_batch",
            &batch.batch_id,
            serde_json::json!({
                "source": batch.source.code(),
                "window_start": format_timestamp(batch.window_start),
                "window_end": format_timestamp(batch.window_end),
                "attempt": batch.attempt,
            }),
            "pipeline",
        ),
    )?;

    Ok(())
}

/// Mark committed with final counts; called inside the load transaction
pub fn commit_batch(conn: &Connection, batch_id: &str, counts: &BatchCounts, error_count: usize) -> Result<()> {
    let changed = conn.execute(
        "UPDATE load_batches
         SET status = ?2, finished_at = ?3,
             extracted = ?4, inserted = ?5, updated = ?6, unchanged = ?7,
             unresolved = ?8, rejected = ?9, error_count = ?10
         WHERE batch_id = ?1 AND status = 'running'",
        params![
            batch_id,
            BatchStatus::Committed.as_str(),
            format_timestamp(Utc::now()),
            counts.extracted as i64,
            counts.inserted as i64,
            counts.updated as i64,
            counts.unchanged as i64,
            counts.unresolved as i64,
            counts.rejected as i64,
            error_count as i64,
        ],
    )?;

    if changed == 0 {
        return Err(EtlError::Config(format!(
            "batch {} is not running and cannot be committed",
            batch_id
        )));
    }

    insert_event(
        conn,
        &Event::new(
            "batch_committed",
            "load_batch",
            batch_id,
            serde_json::to_value(counts)?,
            "loader",
        ),
    )?;

    Ok(())
}

/// Mark failed; runs after the load transaction has rolled back
pub fn fail_batch(conn: &Connection, batch_id: &str, counts: &BatchCounts, message: &str) -> Result<()> {
    conn.execute(
        "UPDATE load_batches
         SET status = ?2, finished_at = ?3, extracted = ?4, rejected = ?5,
             error_count = error_count + 1, error_message = ?6
         WHERE batch_id = ?1 AND status = 'running'",
        params![
            batch_id,
            BatchStatus::Failed.as_str(),
            format_timestamp(Utc::now()),
            counts.extracted as i64,
            counts.rejected as i64,
            message,
        ],
    )?;

    insert_event(
        conn,
        &Event::new(
            "batch_failed",
            "load_batch",
            batch_id,
            serde_json::json!({ "error": message }),
            "pipeline",
        ),
    )?;

    Ok(())
}

const BATCH_COLUMNS: &str = "batch_id, source, window_start, window_end, attempt, status,
    started_at, finished_at, extracted, inserted, updated, unchanged, unresolved, rejected,
    error_count, error_message";

struct BatchRow {
    batch_id: String,
    source: String,
    window_start: String,
    window_end: String,
    attempt: u32,
    status: String,
    started_at: String,
    finished_at: Option<String>,
    counts: [i64; 6],
    error_count: i64,
    error_message: Option<String>,
}

impl BatchRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(BatchRow {
            batch_id: row.get(0)?,
            source: row.get(1)?,
            window_start: row.get(2)?,
            window_end: row.get(3)?,
            attempt: row.get(4)?,
            status: row.get(5)?,
            started_at: row.get(6)?,
            finished_at: row.get(7)?,
            counts: [
                row.get(8)?,
                row.get(9)?,
                row.get(10)?,
                row.get(11)?,
                row.get(12)?,
                row.get(13)?,
            ],
            error_count: row.get(14)?,
            error_message: row.get(15)?,
        })
    }

    fn into_batch(self) -> Result<LoadBatch> {
        let [extracted, inserted, updated, unchanged, unresolved, rejected] =
            self.counts.map(|c| c.max(0) as usize);

        Ok(LoadBatch {
            batch_id: self.batch_id,
            source: self.source.parse().map_err(EtlError::Config)?,
            window_start: parse_timestamp(&self.window_start)?,
            window_end: parse_timestamp(&self.window_end)?,
            attempt: self.attempt,
            status: BatchStatus::from(self.status),
            started_at: parse_timestamp(&self.started_at)?,
            finished_at: self.finished_at.as_deref().map(parse_timestamp).transpose()?,
            counts: BatchCounts {
                extracted,
                inserted,
                updated,
                unchanged,
                unresolved,
                rejected,
            },
            error_count: self.error_count.max(0) as usize,
            error_message: self.error_message,
        })
    }
}

pub fn get_batch(conn: &Connection, batch_id: &str) -> Result<Option<LoadBatch>> {
    let row = conn
        .query_row(
            &format!("SELECT {} FROM load_batches WHERE batch_id = ?1", BATCH_COLUMNS),
            [batch_id],
            BatchRow::from_row,
        )
        .optional()?;

    row.map(BatchRow::into_batch).transpose()
}

/// Most recent batches first, optionally for one source
pub fn get_recent_batches(conn: &Connection, source: Option<Source>, limit: usize) -> Result<Vec<LoadBatch>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM load_batches
         WHERE ?1 IS NULL OR source = ?1
         ORDER BY started_at DESC
         LIMIT ?2",
        BATCH_COLUMNS
    ))?;

    let rows = stmt
        .query_map(params![source.map(|s| s.code()), limit as i64], BatchRow::from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    rows.into_iter().map(BatchRow::into_batch).collect()
}

/// Batches left `running` by a crashed process are marked failed on startup
pub fn fail_abandoned_batches(conn: &Connection) -> Result<usize> {
    let changed = conn.execute(
        "UPDATE load_batches
         SET status = 'failed', finished_at = ?1, error_count = error_count + 1,
             error_message = 'abandoned: process exited before the batch finished'
         WHERE status = 'running'",
        [format_timestamp(Utc::now())],
    )?;
    Ok(changed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{get_events_for_entity, setup_database};
    use chrono::Duration;

    fn running_batch(conn: &Connection) -> LoadBatch {
        let end = Utc::now();
        let batch = LoadBatch::new(Source::Shopify, end - Duration::days(1), end, 1);
        start_batch(conn, &batch).unwrap();
        batch
    }

    #[test]
    fn test_batch_lifecycle_committed() {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        let batch = running_batch(&conn);

        let counts = BatchCounts {
            extracted: 5,
            inserted: 3,
            updated: 1,
            unchanged: 1,
            unresolved: 2,
            rejected: 0,
        };
        commit_batch(&conn, &batch.batch_id, &counts, 0).unwrap();

        let stored = get_batch(&conn, &batch.batch_id).unwrap().unwrap();
        assert_eq!(stored.status, BatchStatus::Committed);
        assert_eq!(stored.counts, counts);
        assert_eq!(stored.counts.loaded(), 5);
        assert!(stored.finished_at.is_some());

        let events = get_events_for_entity(&conn, "load_batch", &batch.batch_id).unwrap();
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn test_failed_batch_cannot_be_committed() {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        let batch = running_batch(&conn);

        fail_batch(&conn, &batch.batch_id, &BatchCounts::default(), "HTTP 500").unwrap();
        assert!(commit_batch(&conn, &batch.batch_id, &BatchCounts::default(), 0).is_err());

        let stored = get_batch(&conn, &batch.batch_id).unwrap().unwrap();
        assert_eq!(stored.status, BatchStatus::Failed);
        assert_eq!(stored.error_count, 1);
        assert_eq!(stored.error_message.as_deref(), Some("HTTP 500"));
    }

    #[test]
    fn test_recent_batches_filter_by_source() {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        running_batch(&conn);
        let end = Utc::now();
        start_batch(&conn, &LoadBatch::new(Source::Square, end - Duration::hours(1), end, 1)).unwrap();

        assert_eq!(get_recent_batches(&conn, None, 10).unwrap().len(), 2);
        let square = get_recent_batches(&conn, Some(Source::Square), 10).unwrap();
        assert_eq!(square.len(), 1);
        assert_eq!(square[0].source, Source::Square);
    }

    #[test]
    fn test_abandoned_batches_are_failed() {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        let batch = running_batch(&conn);

        assert_eq!(fail_abandoned_batches(&conn).unwrap(), 1);
        let stored = get_batch(&conn, &batch.batch_id).unwrap().unwrap();
        assert!(stored.status.is_terminal());
    }

    #[test]
    fn test_unknown_stored_status_reads_as_failed() {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        let batch = running_batch(&conn);
        conn.execute(
            "UPDATE load_batches SET status = 'cancelled' WHERE batch_id = ?1",
            [&batch.batch_id],
        )
        .unwrap();

        let stored = get_batch(&conn, &batch.batch_id).unwrap().unwrap();
        assert_eq!(stored.status, BatchStatus::Failed);
        assert_eq!(BatchStatus::from("running".to_string()), BatchStatus::Running);
        assert_eq!(BatchStatus::from("committed".to_string()), BatchStatus::Committed);
    }
}
