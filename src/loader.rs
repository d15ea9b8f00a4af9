// 📥 Idempotent Loader - one SQLite transaction per batch
//
// Per document, keyed by (source, external_id):
//   new key          → insert header + lines
//   same content hash → unchanged, nothing written
//   different hash   → update header, replace lines
//
// The watermark moves and the batch is marked committed inside the same
// transaction, so a crash can never leave a moved watermark over missing data.

use crate::batch::{commit_batch, BatchCounts, LoadBatch};
use crate::db::{format_timestamp, get_watermark, insert_event, Event};
use crate::error::Result;
use crate::sku::{Resolution, SkuMap};
use crate::source::Source;
use crate::transform::{QuarantinedLine, SourceDocument, Transaction as LineTransaction, TransformOutput};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde::Serialize;
use std::collections::HashMap;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentOutcome {
    Inserted,
    Updated,
    Unchanged,
}

/// Load a resolved batch and commit it
///
/// `counts` arrives with `extracted` and `rejected` filled in by the pipeline;
/// the rest is counted here. On error nothing is written: the caller marks
/// the batch failed.
pub fn load_batch(
    conn: &mut Connection,
    batch: &LoadBatch,
    output: &TransformOutput,
    mut counts: BatchCounts,
) -> Result<BatchCounts> {
    let tx = conn.transaction()?;

    let mut lines_by_doc: HashMap<&str, (Vec<&LineTransaction>, Vec<&QuarantinedLine>)> = HashMap::new();
    for line in &output.transactions {
        lines_by_doc.entry(line.external_id.as_str()).or_default().0.push(line);
    }
    for line in &output.unresolved {
        lines_by_doc.entry(line.external_id.as_str()).or_default().1.push(line);
    }

    let now = format_timestamp(Utc::now());
    for document in &output.documents {
        let (resolved, unresolved) = lines_by_doc
            .remove(document.external_id())
            .unwrap_or_default();

        match upsert_document(&tx, batch, document, &resolved, &unresolved, &now)? {
            DocumentOutcome::Inserted => {
                counts.inserted += 1;
                counts.unresolved += unresolved.len();
            }
            DocumentOutcome::Updated => {
                counts.updated += 1;
                counts.unresolved += unresolved.len();
            }
            DocumentOutcome::Unchanged => counts.unchanged += 1,
        }
    }

    advance_watermark(&tx, batch)?;
    commit_batch(&tx, &batch.batch_id, &counts, counts.rejected)?;
    tx.commit()?;

    info!(
        source = %batch.source,
        batch_id = %batch.batch_id,
        inserted = counts.inserted,
        updated = counts.updated,
        unchanged = counts.unchanged,
        unresolved = counts.unresolved,
        rejected = counts.rejected,
        "Batch committed"
    );

    Ok(counts)
}

fn upsert_document(
    tx: &Transaction<'_>,
    batch: &LoadBatch,
    document: &SourceDocument,
    resolved: &[&LineTransaction],
    unresolved: &[&QuarantinedLine],
    now: &str,
) -> Result<DocumentOutcome> {
    let header = &document.header;
    let hash = document.compute_content_hash();

    let existing: Option<String> = tx
        .query_row(
            "SELECT content_hash FROM documents WHERE source = ?1 AND external_id = ?2",
            params![header.source.code(), header.external_id],
            |row| row.get(0),
        )
        .optional()?;

    let outcome = match existing {
        Some(stored) if stored == hash => return Ok(DocumentOutcome::Unchanged),
        Some(_) => {
            tx.execute(
                "UPDATE documents
                 SET kind = ?3, occurred_at = ?4, customer_id = ?5, location = ?6, reference = ?7,
                     subtotal_cents = ?8, shipping_cents = ?9, total_cents = ?10, line_count = ?11,
                     content_hash = ?12, batch_id = ?13, updated_at = ?14
                 WHERE source = ?1 AND external_id = ?2",
                params![
                    header.source.code(),
                    header.external_id,
                    header.kind.as_str(),
                    format_timestamp(header.occurred_at),
                    header.customer_id,
                    header.location,
                    header.reference,
                    header.subtotal_cents,
                    header.shipping_cents,
                    header.total_cents,
                    document.lines.len() as i64,
                    hash,
                    batch.batch_id,
                    now,
                ],
            )?;
            tx.execute(
                "DELETE FROM transactions WHERE source = ?1 AND external_id = ?2",
                params![header.source.code(), header.external_id],
            )?;
            DocumentOutcome::Updated
        }
        None => {
            tx.execute(
                "INSERT INTO documents (
                    source, external_id, kind, occurred_at, customer_id, location, reference,
                    subtotal_cents, shipping_cents, total_cents, line_count, content_hash,
                    batch_id, loaded_at, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?14)",
                params![
                    header.source.code(),
                    header.external_id,
                    header.kind.as_str(),
                    format_timestamp(header.occurred_at),
                    header.customer_id,
                    header.location,
                    header.reference,
                    header.subtotal_cents,
                    header.shipping_cents,
                    header.total_cents,
                    document.lines.len() as i64,
                    hash,
                    batch.batch_id,
                    now,
                ],
            )?;
            DocumentOutcome::Inserted
        }
    };

    for line in resolved {
        insert_transaction(tx, line, &hash, &batch.batch_id)?;
    }
    replace_unresolved(tx, header.source, &header.external_id, unresolved, &batch.batch_id, now)?;

    debug!(
        source = %header.source,
        external_id = %header.external_id,
        outcome = ?outcome,
        lines = document.lines.len(),
        "Document loaded"
    );

    Ok(outcome)
}

fn insert_transaction(tx: &Transaction<'_>, line: &LineTransaction, hash: &str, batch_id: &str) -> Result<()> {
    tx.execute(
        "INSERT INTO transactions (
            source, external_id, line_no, occurred_at, item_id, quantity, unit,
            amount_cents, category_name, content_hash, batch_id
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            line.source.code(),
            line.external_id,
            line.line_no,
            format_timestamp(line.occurred_at),
            line.item_id,
            line.quantity,
            line.unit.as_str(),
            line.amount_cents,
            line.category_name,
            hash,
            batch_id,
        ],
    )?;
    Ok(())
}

/// Quarantine `lines` for one document, keeping `first_seen_at` of lines
/// that were already waiting
fn replace_unresolved(
    tx: &Transaction<'_>,
    source: Source,
    external_id: &str,
    lines: &[&QuarantinedLine],
    batch_id: &str,
    now: &str,
) -> Result<()> {
    let keep: Vec<String> = lines.iter().map(|l| l.line.line_no.to_string()).collect();
    let keep_json = serde_json::to_string(&keep)?;

    tx.execute(
        "DELETE FROM unresolved_lines
         WHERE source = ?1 AND external_id = ?2
           AND CAST(line_no AS TEXT) NOT IN (SELECT value FROM json_each(?3))",
        params![source.code(), external_id, keep_json],
    )?;

    for quarantined in lines {
        let line = &quarantined.line;
        tx.execute(
            "INSERT INTO unresolved_lines (
                source, external_id, line_no, occurred_at, external_item_id, product_name,
                quantity, unit, amount_cents, category_name, reason, batch_id, first_seen_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            ON CONFLICT(source, external_id, line_no) DO UPDATE SET
                occurred_at = excluded.occurred_at,
                external_item_id = excluded.external_item_id,
                product_name = excluded.product_name,
                quantity = excluded.quantity,
                unit = excluded.unit,
                amount_cents = excluded.amount_cents,
                category_name = excluded.category_name,
                reason = excluded.reason,
                batch_id = excluded.batch_id",
            params![
                source.code(),
                external_id,
                line.line_no,
                format_timestamp(quarantined.occurred_at),
                line.external_item_id,
                line.product_name,
                line.quantity,
                line.unit.as_str(),
                line.amount_cents,
                line.category_name,
                quarantined.reason,
                batch_id,
                now,
            ],
        )?;
    }

    Ok(())
}

// ============================================================================
// WATERMARKS
// ============================================================================

/// Move the watermark to the batch's window end
///
/// Only forward, and only when the window starts at or before the stored
/// watermark: a backfill window further ahead would otherwise skip the gap
/// in between. Returns whether it moved.
fn advance_watermark(tx: &Transaction<'_>, batch: &LoadBatch) -> Result<bool> {
    let current = get_watermark(tx, batch.source)?;

    let advance = match current {
        None => true,
        Some(stored) => batch.window_end > stored && batch.window_start <= stored,
    };
    if !advance {
        debug!(
            source = %batch.source,
            window_end = %batch.window_end,
            "Watermark not moved"
        );
        return Ok(false);
    }

    tx.execute(
        "INSERT INTO source_watermarks (source, watermark, batch_id, updated_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(source) DO UPDATE SET
            watermark = excluded.watermark,
            batch_id = excluded.batch_id,
            updated_at = excluded.updated_at
         WHERE excluded.watermark > source_watermarks.watermark",
        params![
            batch.source.code(),
            format_timestamp(batch.window_end),
            batch.batch_id,
            format_timestamp(Utc::now()),
        ],
    )?;

    insert_event(
        tx,
        &Event::new(
            "watermark_advanced",
            "source",
            batch.source.code(),
            serde_json::json!({
                "from": current.map(format_timestamp),
                "to": format_timestamp(batch.window_end),
                "batch_id": batch.batch_id,
            }),
            "loader",
        ),
    )?;

    Ok(true)
}

// ============================================================================
// RETRY UNRESOLVED
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RetrySummary {
    pub examined: usize,
    pub resolved: usize,
    pub still_unresolved: usize,
}

struct PendingLine {
    source: String,
    external_id: String,
    line_no: i64,
    occurred_at: String,
    external_item_id: Option<String>,
    product_name: Option<String>,
    quantity: f64,
    unit: String,
    amount_cents: i64,
    category_name: Option<String>,
    batch_id: String,
    content_hash: String,
}

/// Re-resolve quarantined lines against `sku_map`; the ones that match now
/// move into `transactions`
pub fn retry_unresolved(conn: &mut Connection, sku_map: &SkuMap) -> Result<RetrySummary> {
    let tx = conn.transaction()?;

    let pending: Vec<PendingLine> = {
        let mut stmt = tx.prepare(
            "SELECT u.source, u.external_id, u.line_no, u.occurred_at, u.external_item_id,
                    u.product_name, u.quantity, u.unit, u.amount_cents, u.category_name,
                    u.batch_id, d.content_hash
             FROM unresolved_lines u
             JOIN documents d ON d.source = u.source AND d.external_id = u.external_id
             ORDER BY u.source, u.external_id, u.line_no",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(PendingLine {
                source: row.get(0)?,
                external_id: row.get(1)?,
                line_no: row.get(2)?,
                occurred_at: row.get(3)?,
                external_item_id: row.get(4)?,
                product_name: row.get(5)?,
                quantity: row.get(6)?,
                unit: row.get(7)?,
                amount_cents: row.get(8)?,
                category_name: row.get(9)?,
                batch_id: row.get(10)?,
                content_hash: row.get(11)?,
            })
        })?;
        rows.collect::<std::result::Result<Vec<_>, _>>()?
    };

    let mut summary = RetrySummary {
        examined: pending.len(),
        ..Default::default()
    };

    for line in &pending {
        let Ok(source) = line.source.parse::<Source>() else {
            summary.still_unresolved += 1;
            continue;
        };

        match sku_map.resolve(source, line.external_item_id.as_deref(), line.product_name.as_deref()) {
            Resolution::Resolved { item_id, .. } => {
                tx.execute(
                    "INSERT INTO transactions (
                        source, external_id, line_no, occurred_at, item_id, quantity, unit,
                        amount_cents, category_name, content_hash, batch_id
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                    params![
                        line.source,
                        line.external_id,
                        line.line_no,
                        line.occurred_at,
                        item_id,
                        line.quantity,
                        line.unit,
                        line.amount_cents,
                        line.category_name,
                        line.content_hash,
                        line.batch_id,
                    ],
                )?;
                tx.execute(
                    "DELETE FROM unresolved_lines WHERE source = ?1 AND external_id = ?2 AND line_no = ?3",
                    params![line.source, line.external_id, line.line_no],
                )?;
                summary.resolved += 1;
            }
            Resolution::Unresolved(reason) => {
                tx.execute(
                    "UPDATE unresolved_lines SET reason = ?4
                     WHERE source = ?1 AND external_id = ?2 AND line_no = ?3",
                    params![line.source, line.external_id, line.line_no, reason],
                )?;
                summary.still_unresolved += 1;
            }
        }
    }

    if summary.examined > 0 {
        insert_event(
            &tx,
            &Event::new(
                "unresolved_retried",
                "unresolved_lines",
                "all",
                serde_json::to_value(&summary)?,
                "loader",
            ),
        )?;
    }
    tx.commit()?;

    info!(
        examined = summary.examined,
        resolved = summary.resolved,
        still_unresolved = summary.still_unresolved,
        "Unresolved lines retried"
    );

    Ok(summary)
}
