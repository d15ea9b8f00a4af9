// ☕ Roastery Warehouse - Core Library
// Exposes all modules for use in the CLI, the status server, and tests

pub mod batch;
pub mod config;
pub mod connectors;
pub mod data_quality;
pub mod db;
pub mod deduplication;
pub mod entities;
pub mod error;
pub mod loader;
pub mod logging;
pub mod pipeline;
pub mod reconciliation;
pub mod retry;
pub mod scheduler;
pub mod sku;
pub mod source;
pub mod transform;

// Re-export commonly used types
pub use batch::{
    fail_abandoned_batches, get_batch, get_recent_batches, BatchCounts, BatchStatus, LoadBatch,
};
pub use config::{SourceSettings, WarehouseConfig};
pub use connectors::{build_connector, Connector, ExtractWindow, Extraction, RawRecord};
pub use data_quality::{BatchSummary, DataQualityEngine, QualityReport, Severity};
pub use db::{
    get_all_watermarks, get_events_for_entity, get_source_totals, get_unresolved_lines,
    get_watermark, insert_event, open_database, setup_database, Event, SourceTotals,
    UnresolvedLine, Watermark,
};
pub use deduplication::{DedupOutcome, DeduplicationEngine, DuplicateMatch};
pub use entities::{replace_reference_data, CoffeeProfile, Item, ItemAlias, ItemForm, ReferenceData};
pub use error::{EtlError, Result};
pub use loader::{load_batch, retry_unresolved, RetrySummary};
pub use logging::{init_logging, LogConfig};
pub use pipeline::{Pipeline, RunReport};
pub use reconciliation::{ReconciliationEngine, ReconciliationReport, ReconciliationResult};
pub use retry::RetryPolicy;
pub use scheduler::{parse_cron, run_scheduler, run_with_retry};
pub use sku::{Resolution, SkuMap};
pub use source::{RecordKind, Source};
pub use transform::{SourceDocument, Transaction, TransformOutput};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
