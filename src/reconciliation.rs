// ⚖️ Reconciliation Engine - did we get everything, and do the documents add up?
//
// Two checks per extraction:
//   expected_count (reported by the source) <= distinct records extracted
//   total_cents == sum(line amounts) + shipping_cents, per document
//
// Missing records fail the batch so the watermark stays put and the window is
// re-read next run. Amount differences (tax, discounts, tips) are recorded only.

use crate::source::Source;
use crate::transform::SourceDocument;
use serde::{Deserialize, Serialize};

// ============================================================================
// RECONCILIATION RESULT
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ReconciliationResult {
    /// Counts match and every document adds up
    Balanced { documents: usize },

    /// Only amount differences, each below the major threshold
    MinorDiscrepancy {
        difference_cents: i64,
        tolerance_cents: i64,
    },

    /// Records missing, or an amount difference at or above the threshold
    MajorDiscrepancy {
        difference_cents: i64,
        missing_records: usize,
    },
}

impl ReconciliationResult {
    pub fn is_balanced(&self) -> bool {
        matches!(self, ReconciliationResult::Balanced { .. })
    }

    pub fn has_discrepancy(&self) -> bool {
        !self.is_balanced()
    }

    /// Sum of absolute per-document amount differences
    pub fn difference_cents(&self) -> i64 {
        match self {
            ReconciliationResult::Balanced { .. } => 0,
            ReconciliationResult::MinorDiscrepancy { difference_cents, .. } => *difference_cents,
            ReconciliationResult::MajorDiscrepancy { difference_cents, .. } => *difference_cents,
        }
    }
}

// ============================================================================
// RECONCILIATION REPORT
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Discrepancy {
    pub external_id: Option<String>,
    pub description: String,
    pub amount_cents: i64,
    pub category: DiscrepancyCategory,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DiscrepancyCategory {
    MissingRecords,
    AmountMismatch,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationReport {
    pub source: Source,
    pub expected_count: Option<usize>,
    pub extracted_count: usize,
    pub missing_records: usize,
    pub result: ReconciliationResult,
    pub discrepancies: Vec<Discrepancy>,
    pub reconciled_at: chrono::DateTime<chrono::Utc>,
}

impl ReconciliationReport {
    pub fn is_balanced(&self) -> bool {
        self.result.is_balanced()
    }

    /// Records the source promised but never returned
    pub fn should_fail_batch(&self) -> bool {
        self.missing_records > 0
    }

    pub fn summary(&self) -> String {
        let expected = self
            .expected_count
            .map(|count| count.to_string())
            .unwrap_or_else(|| "n/a".to_string());
        format!(
            "{}: expected {}, extracted {}, missing {}, {} amount mismatches totalling {} cents",
            self.source,
            expected,
            self.extracted_count,
            self.missing_records,
            self.discrepancies
                .iter()
                .filter(|d| d.category == DiscrepancyCategory::AmountMismatch)
                .count(),
            self.result.difference_cents()
        )
    }
}

// ============================================================================
// RECONCILIATION ENGINE
// ============================================================================

pub struct ReconciliationEngine {
    /// Per-document difference at which a mismatch becomes major (default: $10.00)
    pub major_discrepancy_threshold_cents: i64,
}

impl Default for ReconciliationEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ReconciliationEngine {
    pub fn new() -> Self {
        ReconciliationEngine {
            major_discrepancy_threshold_cents: 1000,
        }
    }

    pub fn reconcile(
        &self,
        source: Source,
        expected_count: Option<usize>,
        extracted_count: usize,
        documents: &[SourceDocument],
    ) -> ReconciliationReport {
        let mut discrepancies = Vec::new();

        let missing_records = expected_count
            .map(|expected| expected.saturating_sub(extracted_count))
            .unwrap_or(0);
        if missing_records > 0 {
            discrepancies.push(Discrepancy {
                external_id: None,
                description: format!(
                    "source reported {} records but {} were extracted",
                    expected_count.unwrap_or_default(),
                    extracted_count
                ),
                amount_cents: 0,
                category: DiscrepancyCategory::MissingRecords,
            });
        }

        let mut difference_cents = 0i64;
        let mut has_major_amount = false;
        for document in documents {
            let computed = document.line_total_cents() + document.header.shipping_cents;
            let difference = document.header.total_cents - computed;
            if difference == 0 {
                continue;
            }

            difference_cents += difference.abs();
            has_major_amount |= difference.abs() >= self.major_discrepancy_threshold_cents;
            discrepancies.push(Discrepancy {
                external_id: Some(document.header.external_id.clone()),
                description: format!(
                    "total {} cents, lines + shipping {} cents",
                    document.header.total_cents, computed
                ),
                amount_cents: difference,
                category: DiscrepancyCategory::AmountMismatch,
            });
        }

        let result = if missing_records > 0 || has_major_amount {
            ReconciliationResult::MajorDiscrepancy {
                difference_cents,
                missing_records,
            }
        } else if difference_cents > 0 {
            ReconciliationResult::MinorDiscrepancy {
                difference_cents,
                tolerance_cents: self.major_discrepancy_threshold_cents,
            }
        } else {
            ReconciliationResult::Balanced {
                documents: documents.len(),
            }
        };

        ReconciliationReport {
            source,
            expected_count,
            extracted_count,
            missing_records,
            result,
            discrepancies,
            reconciled_at: chrono::Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::RecordKind;
    use crate::transform::{DocumentHeader, DocumentLine, Unit};
    use chrono::Utc;

    fn order(external_id: &str, line_amounts: &[i64], shipping_cents: i64, total_cents: i64) -> SourceDocument {
        SourceDocument {
            header: DocumentHeader {
                source: Source::Shopify,
                external_id: external_id.to_string(),
                kind: RecordKind::Order,
                occurred_at: Utc::now(),
                customer_id: None,
                location: None,
                reference: None,
                subtotal_cents: line_amounts.iter().sum(),
                shipping_cents,
                total_cents,
            },
            lines: line_amounts
                .iter()
                .enumerate()
                .map(|(i, amount)| DocumentLine {
                    line_no: i as u32 + 1,
                    external_item_id: Some("SH-1".to_string()),
                    product_name: None,
                    category_name: None,
                    quantity: 1.0,
                    unit: Unit::Each,
                    amount_cents: *amount,
                })
                .collect(),
        }
    }

    #[test]
    fn test_balanced() {
        let docs = vec![order("1", &[1650, 1650], 795, 4095), order("2", &[1400], 0, 1400)];

        let report = ReconciliationEngine::new().reconcile(Source::Shopify, Some(2), 2, &docs);

        assert!(report.is_balanced());
        assert!(!report.should_fail_batch());
        assert_eq!(report.result, ReconciliationResult::Balanced { documents: 2 });
    }

    #[test]
    fn test_minor_amount_difference_is_recorded_only() {
        // 35 cents of tax on top of the lines
        let docs = vec![order("1", &[450], 0, 485)];

        let report = ReconciliationEngine::new().reconcile(Source::Shopify, None, 1, &docs);

        assert!(matches!(
            report.result,
            ReconciliationResult::MinorDiscrepancy { difference_cents: 35, .. }
        ));
        assert!(!report.should_fail_batch());
        assert_eq!(report.discrepancies[0].external_id.as_deref(), Some("1"));
    }

    #[test]
    fn test_large_amount_difference_is_major_but_does_not_fail() {
        let docs = vec![order("1", &[450], 0, 5450)];

        let report = ReconciliationEngine::new().reconcile(Source::Shopify, Some(1), 1, &docs);

        assert!(matches!(report.result, ReconciliationResult::MajorDiscrepancy { missing_records: 0, .. }));
        assert!(!report.should_fail_batch());
    }

    #[test]
    fn test_missing_records_fail_the_batch() {
        let docs = vec![order("1", &[450], 0, 450)];

        let report = ReconciliationEngine::new().reconcile(Source::Quickbooks, Some(30), 25, &docs);

        assert_eq!(report.missing_records, 5);
        assert!(report.should_fail_batch());
        assert!(report.summary().contains("missing 5"));
    }

    #[test]
    fn test_extra_records_are_not_missing() {
        let report = ReconciliationEngine::new().reconcile(Source::Shopify, Some(2), 3, &[]);

        assert_eq!(report.missing_records, 0);
        assert!(report.is_balanced());
    }
}
