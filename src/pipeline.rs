// 🚰 Pipeline - one source, one window, one load batch
//
//   extract → dedup → normalize → quality → resolve → reconcile → load
//
// Extraction is the only async step. The warehouse connection is locked for
// the synchronous steps only and never held across an `.await`.

use crate::batch::{fail_batch, start_batch, BatchCounts, LoadBatch};
use crate::config::SourceSettings;
use crate::connectors::{Connector, ExtractWindow, Extraction};
use crate::data_quality::DataQualityEngine;
use crate::db::get_watermark;
use crate::deduplication::DeduplicationEngine;
use crate::error::{EtlError, Result};
use crate::loader::load_batch;
use crate::reconciliation::{ReconciliationEngine, ReconciliationResult};
use crate::sku::SkuMap;
use crate::source::Source;
use crate::transform::{normalize, resolve};
use chrono::{DateTime, SubsecRound, Utc};
use rusqlite::Connection;
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub source: Source,
    /// None when the window was empty and nothing ran
    pub batch_id: Option<String>,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub attempt: u32,
    pub counts: BatchCounts,
    pub reconciliation: Option<ReconciliationResult>,
}

impl RunReport {
    pub fn skipped(&self) -> bool {
        self.batch_id.is_none()
    }
}

pub struct Pipeline {
    conn: Arc<Mutex<Connection>>,
    dedup: DeduplicationEngine,
    quality: DataQualityEngine,
    reconciler: ReconciliationEngine,
}

impl Pipeline {
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Pipeline {
            conn,
            dedup: DeduplicationEngine::new(),
            quality: DataQualityEngine::new(),
            reconciler: ReconciliationEngine::new(),
        }
    }

    pub fn connection(&self) -> Arc<Mutex<Connection>> {
        Arc::clone(&self.conn)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| EtlError::LockPoisoned)
    }

    /// `[watermark - overlap, now)`, or `[now - initial_lookback, now)` before
    /// the first committed batch
    pub fn next_window(&self, source: Source, settings: &SourceSettings, now: DateTime<Utc>) -> Result<ExtractWindow> {
        let conn = self.lock()?;
        let watermark = get_watermark(&conn, source)?;
        let start = match watermark {
            Some(watermark) => watermark - settings.overlap(),
            None => now - settings.initial_lookback(),
        };
        Ok(ExtractWindow::new(start, now))
    }

    /// Incremental run from the stored watermark up to now
    pub async fn run_source(
        &self,
        connector: &dyn Connector,
        settings: &SourceSettings,
        attempt: u32,
    ) -> Result<RunReport> {
        // window bounds are stored with microsecond precision
        let now = Utc::now().trunc_subsecs(6);
        let window = self.next_window(connector.source(), settings, now)?;
        self.run_window(connector, window, attempt).await
    }

    /// Run an explicit window (backfill)
    pub async fn run_window(
        &self,
        connector: &dyn Connector,
        window: ExtractWindow,
        attempt: u32,
    ) -> Result<RunReport> {
        let source = connector.source();
        let mut report = RunReport {
            source,
            batch_id: None,
            window_start: window.start,
            window_end: window.end,
            attempt,
            counts: BatchCounts::default(),
            reconciliation: None,
        };

        if window.is_empty() {
            info!(source = %source, window = %window, "Empty window, nothing to run");
            return Ok(report);
        }

        let batch = LoadBatch::new(source, window.start, window.end, attempt);
        {
            let conn = self.lock()?;
            start_batch(&conn, &batch)?;
        }
        report.batch_id = Some(batch.batch_id.clone());

        info!(
            source = %source,
            batch_id = %batch.batch_id,
            window = %window,
            attempt = attempt,
            "Batch started"
        );

        let extraction = match connector.extract(&window).await {
            Ok(extraction) => extraction,
            Err(err) => {
                self.mark_failed(&batch, &BatchCounts::default(), &err);
                return Err(err);
            }
        };

        let mut counts = BatchCounts {
            extracted: extraction.records.len(),
            ..Default::default()
        };

        match self.process(&batch, extraction, &mut counts, &mut report) {
            Ok(committed) => {
                report.counts = committed;
                Ok(report)
            }
            Err(err) => {
                self.mark_failed(&batch, &counts, &err);
                Err(err)
            }
        }
    }

    /// Everything after extraction; synchronous, under the connection lock
    fn process(
        &self,
        batch: &LoadBatch,
        extraction: Extraction,
        counts: &mut BatchCounts,
        report: &mut RunReport,
    ) -> Result<BatchCounts> {
        let source = batch.source;

        let deduped = self.dedup.deduplicate(extraction.records);
        if !deduped.duplicates.is_empty() {
            info!(
                source = %source,
                batch_id = %batch.batch_id,
                duplicates = deduped.duplicates.len(),
                "Collapsed records repeated across pages"
            );
        }
        let distinct = deduped.records.len();

        let mut documents = Vec::with_capacity(distinct);
        for record in &deduped.records {
            match normalize(record) {
                Ok(document) => documents.push(document),
                Err(err) => {
                    warn!(
                        source = %source,
                        external_id = %record.external_id,
                        error = %err,
                        "Record could not be normalized"
                    );
                    counts.rejected += 1;
                }
            }
        }

        let (accepted, rejected, quality) = self.quality.partition(documents);
        for report in &rejected {
            warn!(source = %source, external_id = %report.external_id, issues = %report.summary(), "Document rejected");
        }
        counts.rejected += quality.rejected;

        let reconciliation = self
            .reconciler
            .reconcile(source, extraction.expected_count, distinct, &accepted);
        report.reconciliation = Some(reconciliation.result.clone());
        if reconciliation.should_fail_batch() {
            return Err(EtlError::Reconciliation {
                origin: source,
                summary: reconciliation.summary(),
            });
        }
        if !reconciliation.is_balanced() {
            warn!(
                source = %source,
                batch_id = %batch.batch_id,
                summary = %reconciliation.summary(),
                "Reconciliation discrepancy"
            );
        }

        let mut conn = self.lock()?;
        let sku_map = SkuMap::from_db(&conn)?;
        if sku_map.is_empty() {
            warn!(source = %source, "Item catalog is empty; every line will be quarantined");
        }
        let output = resolve(accepted, &sku_map);

        load_batch(&mut conn, batch, &output, *counts)
    }

    fn mark_failed(&self, batch: &LoadBatch, counts: &BatchCounts, err: &EtlError) {
        warn!(
            source = %batch.source,
            batch_id = %batch.batch_id,
            error = %err,
            "Batch failed"
        );

        let result = self
            .lock()
            .and_then(|conn| fail_batch(&conn, &batch.batch_id, counts, &err.to_string()));
        if let Err(mark_err) = result {
            warn!(batch_id = %batch.batch_id, error = %mark_err, "Could not mark batch failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{get_recent_batches, BatchStatus};
    use crate::connectors::fake::FakeConnector;
    use crate::db::{count_transactions, setup_database};
    use crate::entities::{replace_reference_data, Item, ReferenceData};
    use chrono::{Duration, TimeZone};
    use serde_json::json;

    fn pipeline() -> Pipeline {
        let mut conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        let data = ReferenceData {
            items: vec![
                Item::new(200, "Latte").with_source_id(Source::Square, "SQ-LATTE"),
                Item::new(300, "Drip Coffee").with_source_id(Source::Square, "SQ-DRIP"),
            ],
            profiles: vec![],
            aliases: vec![],
        };
        replace_reference_data(&mut conn, &data).unwrap();
        Pipeline::new(Arc::new(Mutex::new(conn)))
    }

    fn payment(id: &str, sku: &str, cents: i64) -> serde_json::Value {
        json!({
            "id": id,
            "created_at": "2024-05-01T09:30:00Z",
            "total_money": {"amount": cents},
            "itemizations": [
                {"name": "x", "quantity": "1", "item_detail": {"sku": sku}, "total_money": {"amount": cents}}
            ]
        })
    }

    fn window() -> ExtractWindow {
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        ExtractWindow::new(start, start + Duration::days(1))
    }

    fn watermark(pipeline: &Pipeline) -> Option<DateTime<Utc>> {
        get_watermark(&pipeline.lock().unwrap(), Source::Square).unwrap()
    }

    #[tokio::test]
    async fn test_run_window_loads_and_moves_watermark() {
        let pipeline = pipeline();
        let connector = FakeConnector::new(Source::Square).returns(
            vec![
                payment("P1", "SQ-LATTE", 450),
                payment("P2", "SQ-DRIP", 300),
                payment("P1", "SQ-LATTE", 450),
            ],
            "id",
            None,
        );

        let report = pipeline.run_window(&connector, window(), 1).await.unwrap();

        assert_eq!(report.counts.extracted, 3);
        assert_eq!(report.counts.inserted, 2);
        assert_eq!(report.reconciliation, Some(ReconciliationResult::Balanced { documents: 2 }));
        assert_eq!(count_transactions(&pipeline.lock().unwrap()).unwrap(), 2);
        assert_eq!(watermark(&pipeline), Some(window().end));
    }

    #[tokio::test]
    async fn test_extraction_failure_fails_batch_and_keeps_watermark() {
        let pipeline = pipeline();
        let connector = FakeConnector::new(Source::Square)
            .fails(EtlError::HttpStatus { status: 503, url: "x".to_string() });

        assert!(pipeline.run_window(&connector, window(), 1).await.is_err());

        let batches = get_recent_batches(&pipeline.lock().unwrap(), None, 5).unwrap();
        assert_eq!(batches[0].status, BatchStatus::Failed);
        assert!(batches[0].error_message.as_deref().unwrap().contains("503"));
        assert_eq!(watermark(&pipeline), None);
    }

    #[tokio::test]
    async fn test_missing_records_fail_batch() {
        let pipeline = pipeline();
        let connector = FakeConnector::new(Source::Square).returns(vec![payment("P1", "SQ-LATTE", 450)], "id", Some(3));

        let err = pipeline.run_window(&connector, window(), 1).await.unwrap_err();

        assert!(matches!(err, EtlError::Reconciliation { .. }));
        assert_eq!(count_transactions(&pipeline.lock().unwrap()).unwrap(), 0);
        assert_eq!(watermark(&pipeline), None);
    }

    #[tokio::test]
    async fn test_bad_records_are_rejected_not_fatal() {
        let pipeline = pipeline();
        let connector = FakeConnector::new(Source::Square).returns(
            vec![payment("P1", "SQ-LATTE", 450), json!({"id": "P2", "created_at": "not a date"})],
            "id",
            None,
        );

        let report = pipeline.run_window(&connector, window(), 1).await.unwrap();

        assert_eq!(report.counts.inserted, 1);
        assert_eq!(report.counts.rejected, 1);
    }

    #[tokio::test]
    async fn test_run_source_uses_overlap_after_first_run() {
        let pipeline = pipeline();
        let settings = SourceSettings {
            overlap_minutes: 60,
            initial_lookback_days: 7,
            ..Default::default()
        };

        let connector = FakeConnector::new(Source::Square);
        let first = pipeline.run_source(&connector, &settings, 1).await.unwrap();
        let span = first.window_end - first.window_start;
        assert_eq!(span, Duration::days(7));

        let second = pipeline.run_source(&connector, &settings, 1).await.unwrap();
        assert_eq!(second.window_start, first.window_end - Duration::minutes(60));
        assert_eq!(connector.calls(), 2);
    }

    #[tokio::test]
    async fn test_empty_window_is_skipped() {
        let pipeline = pipeline();
        let connector = FakeConnector::new(Source::Square);
        let at = Utc::now();

        let report = pipeline
            .run_window(&connector, ExtractWindow::new(at, at), 1)
            .await
            .unwrap();

        assert!(report.skipped());
        assert_eq!(connector.calls(), 0);
    }
}
