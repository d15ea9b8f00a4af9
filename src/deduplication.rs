// 🔍 Deduplication Engine - collapse records seen twice in one extraction
//
// Offset and cursor pagination can hand back the same record on two pages
// when the source changes mid-walk. The natural key is (source, external_id);
// the last occurrence wins because it is the most recent read.

use crate::connectors::RawRecord;
use crate::source::Source;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ============================================================================
// DUPLICATE MATCH RESULT
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DuplicateMatch {
    pub source: Source,
    pub external_id: String,
    /// Position of the occurrence that was dropped
    pub dropped_index: usize,
    /// Position of the occurrence that was kept
    pub kept_index: usize,
    /// Same payload both times (pure page overlap) vs. changed in between
    pub identical: bool,
}

#[derive(Debug, Clone, Default)]
pub struct DedupOutcome {
    pub records: Vec<RawRecord>,
    pub duplicates: Vec<DuplicateMatch>,
}

// ============================================================================
// DEDUPLICATION ENGINE
// ============================================================================

#[derive(Debug, Default)]
pub struct DeduplicationEngine;

impl DeduplicationEngine {
    pub fn new() -> Self {
        DeduplicationEngine
    }

    /// Keep the last occurrence of each natural key, in first-seen order
    pub fn deduplicate(&self, records: Vec<RawRecord>) -> DedupOutcome {
        let mut slots: HashMap<(Source, String), usize> = HashMap::new();
        let mut kept: Vec<(usize, RawRecord)> = Vec::with_capacity(records.len());
        let mut duplicates = Vec::new();

        for (index, record) in records.into_iter().enumerate() {
            let key = (record.source, record.external_id.clone());
            match slots.get(&key) {
                Some(&slot) => {
                    let (previous_index, previous) = &kept[slot];
                    duplicates.push(DuplicateMatch {
                        source: record.source,
                        external_id: record.external_id.clone(),
                        dropped_index: *previous_index,
                        kept_index: index,
                        identical: previous.payload == record.payload,
                    });
                    kept[slot] = (index, record);
                }
                None => {
                    slots.insert(key, kept.len());
                    kept.push((index, record));
                }
            }
        }

        DedupOutcome {
            records: kept.into_iter().map(|(_, record)| record).collect(),
            duplicates,
        }
    }
}
