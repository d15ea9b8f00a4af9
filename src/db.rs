// 🗄️ Warehouse Database - schema, audit trail, and read queries
//
// SQLite in WAL mode. Natural keys are enforced with PRIMARY KEY / UNIQUE
// constraints so a replayed load can never create a second copy of a record.

use crate::error::{EtlError, Result};
use crate::source::Source;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

// ============================================================================
// TIMESTAMPS
// ============================================================================

/// RFC 3339 UTC with fixed microsecond precision, so string order is time order
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| EtlError::Config(format!("Invalid timestamp '{}': {}", s, e)))
}

fn parse_column_timestamp(s: &str, column: usize) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                column,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })
}

// ============================================================================
// EVENTS (audit trail)
// ============================================================================

/// Every batch transition and watermark move is recorded as an event
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Event {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub entity_type: String,
    pub entity_id: String,
    pub data: serde_json::Value,
    pub actor: String,
}

impl Event {
    pub fn new(
        event_type: &str,
        entity_type: &str,
        entity_id: &str,
        data: serde_json::Value,
        actor: &str,
    ) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            event_type: event_type.to_string(),
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            data,
            actor: actor.to_string(),
        }
    }
}

/// Insert event into audit trail
pub fn insert_event(conn: &Connection, event: &Event) -> Result<()> {
    let data_json = serde_json::to_string(&event.data)?;

    conn.execute(
        "INSERT INTO events (
            event_id, timestamp, event_type, entity_type, entity_id, data, actor
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            event.event_id,
            format_timestamp(event.timestamp),
            event.event_type,
            event.entity_type,
            event.entity_id,
            data_json,
            event.actor,
        ],
    )?;

    Ok(())
}

/// Get events for a specific entity, newest first
pub fn get_events_for_entity(
    conn: &Connection,
    entity_type: &str,
    entity_id: &str,
) -> Result<Vec<Event>> {
    let mut stmt = conn.prepare(
        "SELECT event_id, timestamp, event_type, entity_type, entity_id, data, actor
         FROM events
         WHERE entity_type = ?1 AND entity_id = ?2
         ORDER BY timestamp DESC, id DESC",
    )?;

    let events = stmt
        .query_map(params![entity_type, entity_id], |row| {
            let timestamp_str: String = row.get(1)?;
            let data_json: String = row.get(5)?;

            Ok(Event {
                event_id: row.get(0)?,
                timestamp: parse_column_timestamp(&timestamp_str, 1)?,
                event_type: row.get(2)?,
                entity_type: row.get(3)?,
                entity_id: row.get(4)?,
                data: serde_json::from_str(&data_json).map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(
                        5,
                        rusqlite::types::Type::Text,
                        Box::new(e),
                    )
                })?,
                actor: row.get(6)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(events)
}

// ============================================================================
// SCHEMA
// ============================================================================

/// Open (or create) the warehouse file and make sure the schema exists
pub fn open_database(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    let conn = Connection::open(path)?;
    conn.busy_timeout(Duration::from_secs(5))?;
    setup_database(&conn)?;
    Ok(conn)
}

pub fn setup_database(conn: &Connection) -> Result<()> {
    // Enable WAL mode for crash recovery
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;

    // ==========================================================================
    // Reference tables
    // ==========================================================================
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS coffee_profiles (
            profile_id INTEGER PRIMARY KEY,
            profile_name TEXT NOT NULL,
            roast_level TEXT,
            single_origin INTEGER NOT NULL DEFAULT 0,
            components TEXT NOT NULL DEFAULT '[]'
        );

        CREATE TABLE IF NOT EXISTS items (
            item_id INTEGER PRIMARY KEY,
            product_name TEXT NOT NULL,
            variant_name TEXT,
            category_name TEXT,
            form TEXT NOT NULL,
            weight_lb REAL,
            profile_id INTEGER,
            updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
        );

        CREATE TABLE IF NOT EXISTS item_mappings (
            source TEXT NOT NULL,
            external_id TEXT NOT NULL,
            item_id INTEGER NOT NULL REFERENCES items(item_id),
            PRIMARY KEY (source, external_id)
        );

        CREATE TABLE IF NOT EXISTS item_aliases (
            alias TEXT PRIMARY KEY,
            item_id INTEGER NOT NULL REFERENCES items(item_id)
        );",
    )?;

    // ==========================================================================
    // Fact tables
    // ==========================================================================
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS documents (
            source TEXT NOT NULL,
            external_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            occurred_at TEXT NOT NULL,
            customer_id TEXT,
            location TEXT,
            reference TEXT,
            subtotal_cents INTEGER NOT NULL,
            shipping_cents INTEGER NOT NULL DEFAULT 0,
            total_cents INTEGER NOT NULL,
            line_count INTEGER NOT NULL,
            content_hash TEXT NOT NULL,
            batch_id TEXT NOT NULL,
            loaded_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (source, external_id)
        );

        CREATE TABLE IF NOT EXISTS transactions (
            source TEXT NOT NULL,
            external_id TEXT NOT NULL,
            line_no INTEGER NOT NULL,
            occurred_at TEXT NOT NULL,
            item_id INTEGER NOT NULL REFERENCES items(item_id),
            quantity REAL NOT NULL,
            unit TEXT NOT NULL,
            amount_cents INTEGER NOT NULL,
            category_name TEXT,
            content_hash TEXT NOT NULL,
            batch_id TEXT NOT NULL,
            PRIMARY KEY (source, external_id, line_no),
            FOREIGN KEY (source, external_id) REFERENCES documents(source, external_id)
        );

        CREATE TABLE IF NOT EXISTS unresolved_lines (
            source TEXT NOT NULL,
            external_id TEXT NOT NULL,
            line_no INTEGER NOT NULL,
            occurred_at TEXT NOT NULL,
            external_item_id TEXT,
            product_name TEXT,
            quantity REAL NOT NULL,
            unit TEXT NOT NULL,
            amount_cents INTEGER NOT NULL,
            category_name TEXT,
            reason TEXT NOT NULL,
            batch_id TEXT NOT NULL,
            first_seen_at TEXT NOT NULL,
            PRIMARY KEY (source, external_id, line_no),
            FOREIGN KEY (source, external_id) REFERENCES documents(source, external_id)
        );",
    )?;

    // ==========================================================================
    // Load bookkeeping
    // ==========================================================================
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS source_watermarks (
            source TEXT PRIMARY KEY,
            watermark TEXT NOT NULL,
            batch_id TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS load_batches (
            batch_id TEXT PRIMARY KEY,
            source TEXT NOT NULL,
            window_start TEXT NOT NULL,
            window_end TEXT NOT NULL,
            attempt INTEGER NOT NULL DEFAULT 1,
            status TEXT NOT NULL,
            started_at TEXT NOT NULL,
            finished_at TEXT,
            extracted INTEGER NOT NULL DEFAULT 0,
            inserted INTEGER NOT NULL DEFAULT 0,
            updated INTEGER NOT NULL DEFAULT 0,
            unchanged INTEGER NOT NULL DEFAULT 0,
            unresolved INTEGER NOT NULL DEFAULT 0,
            rejected INTEGER NOT NULL DEFAULT 0,
            error_count INTEGER NOT NULL DEFAULT 0,
            error_message TEXT
        );

        CREATE TABLE IF NOT EXISTS events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id TEXT UNIQUE NOT NULL,
            timestamp TEXT NOT NULL,
            event_type TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            data TEXT NOT NULL,
            actor TEXT NOT NULL,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        );",
    )?;

    // ==========================================================================
    // Indexes
    // ==========================================================================
    conn.execute_batch(
        "CREATE INDEX IF NOT EXISTS idx_documents_occurred ON documents(source, occurred_at);
        CREATE INDEX IF NOT EXISTS idx_transactions_occurred ON transactions(occurred_at);
        CREATE INDEX IF NOT EXISTS idx_transactions_item ON transactions(item_id);
        CREATE INDEX IF NOT EXISTS idx_item_mappings_item ON item_mappings(item_id);
        CREATE INDEX IF NOT EXISTS idx_batches_source ON load_batches(source, started_at);
        CREATE INDEX IF NOT EXISTS idx_events_entity ON events(entity_type, entity_id);
        CREATE INDEX IF NOT EXISTS idx_events_timestamp ON events(timestamp);",
    )?;

    Ok(())
}

// ============================================================================
// WATERMARKS
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct Watermark {
    pub source: Source,
    pub watermark: DateTime<Utc>,
    pub batch_id: String,
    pub updated_at: DateTime<Utc>,
}

/// Last committed cursor for `source`, None before the first successful load
pub fn get_watermark(conn: &Connection, source: Source) -> Result<Option<DateTime<Utc>>> {
    let value: Option<String> = conn
        .query_row(
            "SELECT watermark FROM source_watermarks WHERE source = ?1",
            [source.code()],
            |row| row.get(0),
        )
        .optional()?;

    value.as_deref().map(parse_timestamp).transpose()
}

pub fn get_all_watermarks(conn: &Connection) -> Result<Vec<Watermark>> {
    let mut stmt = conn.prepare(
        "SELECT source, watermark, batch_id, updated_at FROM source_watermarks ORDER BY source",
    )?;

    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut watermarks = Vec::with_capacity(rows.len());
    for (source, watermark, batch_id, updated_at) in rows {
        let source = source.parse::<Source>().map_err(EtlError::Config)?;
        watermarks.push(Watermark {
            source,
            watermark: parse_timestamp(&watermark)?,
            batch_id,
            updated_at: parse_timestamp(&updated_at)?,
        });
    }

    Ok(watermarks)
}

// ============================================================================
// STATUS QUERIES
// ============================================================================

#[derive(Debug, Clone, Default, Serialize)]
pub struct SourceTotals {
    pub source: String,
    pub documents: i64,
    pub transactions: i64,
    pub unresolved: i64,
    pub first_occurred_at: Option<String>,
    pub last_occurred_at: Option<String>,
}

/// Per-source row counts, for `status` and the API
pub fn get_source_totals(conn: &Connection) -> Result<Vec<SourceTotals>> {
    let mut stmt = conn.prepare(
        "SELECT
            d.source,
            COUNT(*) AS documents,
            (SELECT COUNT(*) FROM transactions t WHERE t.source = d.source) AS transactions,
            (SELECT COUNT(*) FROM unresolved_lines u WHERE u.source = d.source) AS unresolved,
            MIN(d.occurred_at),
            MAX(d.occurred_at)
         FROM documents d
         GROUP BY d.source
         ORDER BY d.source",
    )?;

    let totals = stmt
        .query_map([], |row| {
            Ok(SourceTotals {
                source: row.get(0)?,
                documents: row.get(1)?,
                transactions: row.get(2)?,
                unresolved: row.get(3)?,
                first_occurred_at: row.get(4)?,
                last_occurred_at: row.get(5)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(totals)
}

pub fn count_transactions(conn: &Connection) -> Result<i64> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM transactions", [], |row| row.get(0))?;
    Ok(count)
}

/// Transactions whose item is missing from the catalog; always 0 in a healthy warehouse
pub fn count_orphaned_transactions(conn: &Connection) -> Result<i64> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM transactions t
         LEFT JOIN items i ON i.item_id = t.item_id
         WHERE i.item_id IS NULL",
        [],
        |row| row.get(0),
    )?;
    Ok(count)
}

#[derive(Debug, Clone, Serialize)]
pub struct UnresolvedLine {
    pub source: String,
    pub external_id: String,
    pub line_no: i64,
    pub occurred_at: String,
    pub external_item_id: Option<String>,
    pub product_name: Option<String>,
    pub quantity: f64,
    pub amount_cents: i64,
    pub reason: String,
}

/// Quarantined lines, oldest first
pub fn get_unresolved_lines(
    conn: &Connection,
    source: Option<Source>,
    limit: usize,
) -> Result<Vec<UnresolvedLine>> {
    let mut stmt = conn.prepare(
        "SELECT source, external_id, line_no, occurred_at, external_item_id, product_name,
                quantity, amount_cents, reason
         FROM unresolved_lines
         WHERE ?1 IS NULL OR source = ?1
         ORDER BY occurred_at, source, external_id, line_no
         LIMIT ?2",
    )?;

    let lines = stmt
        .query_map(
            params![source.map(|s| s.code()), limit as i64],
            |row| {
                Ok(UnresolvedLine {
                    source: row.get(0)?,
                    external_id: row.get(1)?,
                    line_no: row.get(2)?,
                    occurred_at: row.get(3)?,
                    external_item_id: row.get(4)?,
                    product_name: row.get(5)?,
                    quantity: row.get(6)?,
                    amount_cents: row.get(7)?,
                    reason: row.get(8)?,
                })
            },
        )?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(lines)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_setup_is_repeatable() {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        setup_database(&conn).unwrap();

        assert_eq!(count_transactions(&conn).unwrap(), 0);
        assert!(get_all_watermarks(&conn).unwrap().is_empty());
    }

    #[test]
    fn test_timestamp_format_sorts_lexicographically() {
        let early = Utc.with_ymd_and_hms(2024, 3, 9, 23, 59, 59).unwrap();
        let late = Utc.with_ymd_and_hms(2024, 3, 10, 0, 0, 0).unwrap();

        let early_s = format_timestamp(early);
        let late_s = format_timestamp(late);

        assert_eq!(early_s, "2024-03-09T23:59:59.000000Z");
        assert!(early_s < late_s);
        assert_eq!(parse_timestamp(&late_s).unwrap(), late);
    }

    #[test]
    fn test_transactions_require_known_item() {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();

        conn.execute(
            "INSERT INTO documents (source, external_id, kind, occurred_at, subtotal_cents,
                total_cents, line_count, content_hash, batch_id, loaded_at, updated_at)
             VALUES ('square', 'P1', 'sale', '2024-01-01T00:00:00.000000Z', 450, 450, 1,
                'h', 'b', '2024-01-01T00:00:00.000000Z', '2024-01-01T00:00:00.000000Z')",
            [],
        )
        .unwrap();

        let result = conn.execute(
            "INSERT INTO transactions (source, external_id, line_no, occurred_at, item_id,
                quantity, unit, amount_cents, content_hash, batch_id)
             VALUES ('square', 'P1', 1, '2024-01-01T00:00:00.000000Z', 999, 1, 'each', 450, 'h', 'b')",
            [],
        );

        assert!(result.is_err(), "foreign key on item_id must be enforced");
    }

    #[test]
    fn test_event_log() {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();

        let event = Event::new(
            "watermark_advanced",
            "source",
            "square",
            serde_json::json!({"to": "2024-01-02T00:00:00.000000Z"}),
            "loader",
        );

        insert_event(&conn, &event).unwrap();

        let events = get_events_for_entity(&conn, "source", "square").unwrap();

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "watermark_advanced");
        assert_eq!(events[0].actor, "loader");
    }
}
