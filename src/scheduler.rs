// ⏰ Scheduler - one cron-driven task per enabled source
//
// Each task sleeps until its next fire time, runs the pipeline with retry,
// and goes back to sleep. A shutdown signal stops every task between runs.

use crate::config::{SourceSettings, WarehouseConfig};
use crate::connectors::{build_connector, Connector, ExtractWindow};
use crate::error::{EtlError, Result};
use crate::pipeline::{Pipeline, RunReport};
use crate::retry::{retry_async, RetryPolicy};
use crate::source::Source;
use chrono::{DateTime, Utc};
use cron::Schedule;
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Parse a cron expression, prepending a seconds field to 5-field expressions
pub fn parse_cron(expr: &str) -> Result<Schedule> {
    let fields = expr.split_whitespace().count();
    let normalized = if fields == 5 {
        format!("0 {}", expr.trim())
    } else {
        expr.trim().to_string()
    };

    Schedule::from_str(&normalized).map_err(|err| EtlError::Schedule {
        expression: expr.to_string(),
        reason: err.to_string(),
    })
}

/// First fire time strictly after `after`
pub fn next_fire(schedule: &Schedule, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    schedule.after(&after).next()
}

/// Run one source, retrying retryable failures with backoff
///
/// Every attempt is its own load batch with an increasing attempt number.
/// HTTP requests are retried by the transport, which reports a spent request
/// as `RetriesExhausted`; only failures it never saw (a busy warehouse, a
/// connector without a transport) reach this level still retryable.
pub async fn run_with_retry(
    pipeline: &Pipeline,
    connector: &dyn Connector,
    settings: &SourceSettings,
    policy: &RetryPolicy,
) -> Result<RunReport> {
    let attempts = AtomicU32::new(0);
    let attempts = &attempts;
    let operation = format!("{} run", connector.source());

    retry_async(policy, &operation, move || {
        let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
        pipeline.run_source(connector, settings, attempt)
    })
    .await
}

/// Backfill an explicit window with the same retry behaviour
pub async fn backfill_with_retry(
    pipeline: &Pipeline,
    connector: &dyn Connector,
    window: ExtractWindow,
    policy: &RetryPolicy,
) -> Result<RunReport> {
    let attempts = AtomicU32::new(0);
    let attempts = &attempts;
    let operation = format!("{} backfill", connector.source());

    retry_async(policy, &operation, move || {
        let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
        pipeline.run_window(connector, window, attempt)
    })
    .await
}

pub struct SourceJob {
    pub connector: Arc<dyn Connector>,
    pub settings: SourceSettings,
    pub schedule: Schedule,
}

impl SourceJob {
    pub fn source(&self) -> Source {
        self.connector.source()
    }
}

pub fn spawn_source_task(
    pipeline: Arc<Pipeline>,
    job: SourceJob,
    policy: RetryPolicy,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let source = job.source();

        loop {
            if *shutdown.borrow() {
                break;
            }

            let now = Utc::now();
            let Some(next) = next_fire(&job.schedule, now) else {
                warn!(source = %source, "Schedule has no future fire times, stopping");
                break;
            };
            let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
            info!(source = %source, next_run = %next, "Waiting for next run");

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = shutdown.changed() => break,
            }

            match run_with_retry(&pipeline, job.connector.as_ref(), &job.settings, &policy).await {
                Ok(report) if report.skipped() => {}
                Ok(report) => info!(
                    source = %source,
                    batch_id = report.batch_id.as_deref().unwrap_or_default(),
                    attempt = report.attempt,
                    inserted = report.counts.inserted,
                    updated = report.counts.updated,
                    unresolved = report.counts.unresolved,
                    "Scheduled run finished"
                ),
                Err(err) => error!(source = %source, error = %err, "Scheduled run failed"),
            }
        }

        info!(source = %source, "Scheduler task stopped");
    })
}

/// Spawn a task per enabled source and wait for all of them to stop
pub async fn run_scheduler(
    pipeline: Arc<Pipeline>,
    config: &WarehouseConfig,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let sources = config.sources.enabled();
    if sources.is_empty() {
        return Err(EtlError::Config("no sources are enabled".to_string()));
    }

    let mut handles = Vec::with_capacity(sources.len());
    for source in sources {
        let settings = config.sources.settings(source).clone();
        let job = SourceJob {
            connector: build_connector(source, config)?,
            schedule: parse_cron(&settings.schedule)?,
            settings,
        };
        info!(source = %source, schedule = %job.settings.schedule, "Scheduling source");
        handles.push(spawn_source_task(
            Arc::clone(&pipeline),
            job,
            config.retry.clone(),
            shutdown.clone(),
        ));
    }

    for handle in handles {
        if let Err(err) = handle.await {
            error!(error = %err, "Scheduler task panicked");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{get_recent_batches, BatchStatus};
    use crate::connectors::fake::FakeConnector;
    use crate::db::setup_database;
    use chrono::{TimeZone, Timelike};
    use rusqlite::Connection;
    use std::sync::Mutex;

    fn pipeline() -> Pipeline {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        Pipeline::new(Arc::new(Mutex::new(conn)))
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
        }
    }

    #[test]
    fn test_parse_cron_five_field() {
        let schedule = parse_cron("30 5 * * *").unwrap();
        let from = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();

        let next = next_fire(&schedule, from).unwrap();

        assert_eq!(next, Utc.with_ymd_and_hms(2024, 5, 2, 5, 30, 0).unwrap());
    }

    #[test]
    fn test_parse_cron_six_field() {
        let schedule = parse_cron("0 */15 * * * *").unwrap();
        let next = schedule.upcoming(Utc).next().unwrap();

        assert_eq!(next.minute() % 15, 0);
        assert_eq!(next.second(), 0);
    }

    #[test]
    fn test_parse_cron_invalid() {
        let err = parse_cron("every morning").unwrap_err();
        assert!(matches!(err, EtlError::Schedule { ref expression, .. } if expression == "every morning"));
    }

    #[tokio::test]
    async fn test_retryable_failure_is_retried_as_new_batch() {
        let pipeline = pipeline();
        let connector = FakeConnector::new(Source::Shopify)
            .fails(EtlError::Network("connection reset".to_string()));

        let report = run_with_retry(&pipeline, &connector, &SourceSettings::default(), &fast_policy())
            .await
            .unwrap();

        assert_eq!(report.attempt, 2);
        assert_eq!(connector.calls(), 2);

        let batches = get_recent_batches(&pipeline.connection().lock().unwrap(), None, 10).unwrap();
        let failed = batches.iter().filter(|b| b.status == BatchStatus::Failed).count();
        let committed = batches.iter().filter(|b| b.status == BatchStatus::Committed).count();
        assert_eq!((failed, committed), (1, 1));
    }

    #[tokio::test]
    async fn test_non_retryable_failure_stops_immediately() {
        let pipeline = pipeline();
        let connector = FakeConnector::new(Source::Quickbooks)
            .fails(EtlError::HttpStatus { status: 401, url: "x".to_string() });

        let err = run_with_retry(&pipeline, &connector, &SourceSettings::default(), &fast_policy())
            .await
            .unwrap_err();

        assert!(matches!(err, EtlError::HttpStatus { status: 401, .. }));
        assert_eq!(connector.calls(), 1);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let pipeline = pipeline();
        let connector = FakeConnector::new(Source::Cropster)
            .fails(EtlError::HttpStatus { status: 502, url: "x".to_string() })
            .fails(EtlError::HttpStatus { status: 502, url: "x".to_string() })
            .fails(EtlError::HttpStatus { status: 502, url: "x".to_string() });

        let result = run_with_retry(&pipeline, &connector, &SourceSettings::default(), &fast_policy()).await;

        assert!(result.is_err());
        assert_eq!(connector.calls(), 3);
    }

    #[tokio::test]
    async fn test_backfill_keeps_requested_window() {
        let pipeline = pipeline();
        let connector = FakeConnector::new(Source::Square)
            .fails(EtlError::RateLimited { url: "x".to_string(), retry_after: None });
        let start = Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap();
        let window = ExtractWindow::new(start, start + chrono::Duration::days(31));

        let report = backfill_with_retry(&pipeline, &connector, window, &fast_policy())
            .await
            .unwrap();

        assert_eq!(report.window_start, start);
        assert_eq!(report.attempt, 2);
        let windows = connector.windows.lock().unwrap();
        assert!(windows.iter().all(|w| *w == window));
    }

    #[tokio::test]
    async fn test_shutdown_stops_task() {
        let (tx, rx) = watch::channel(false);
        let job = SourceJob {
            connector: Arc::new(FakeConnector::new(Source::Square)),
            settings: SourceSettings::default(),
            schedule: parse_cron("0 0 1 1 *").unwrap(),
        };

        let handle = spawn_source_task(Arc::new(pipeline()), job, fast_policy(), rx);
        tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("task should stop on shutdown")
            .unwrap();
    }
}
