// ✅ Data Quality Engine - per-document checks before anything is loaded
//
// Critical issues reject the document (counted as `rejected` on the batch).
// Warnings and info are logged and the document still loads.

use crate::source::RecordKind;
use crate::transform::SourceDocument;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

// ============================================================================
// VALIDATION RESULT
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult {
    pub passed: bool,
    pub rule_name: String,
    pub field: String,
    pub message: String,
    pub severity: Severity,
}

impl ValidationResult {
    pub fn pass(rule_name: &str, field: &str, message: &str) -> Self {
        ValidationResult {
            passed: true,
            rule_name: rule_name.to_string(),
            field: field.to_string(),
            message: message.to_string(),
            severity: Severity::Info,
        }
    }

    pub fn fail(rule_name: &str, field: &str, message: &str, severity: Severity) -> Self {
        ValidationResult {
            passed: false,
            rule_name: rule_name.to_string(),
            field: field.to_string(),
            message: message.to_string(),
            severity,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Critical, // Document cannot be loaded
    Warning,  // Loads, but someone should look
    Info,
}

// ============================================================================
// QUALITY REPORT
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityReport {
    pub external_id: String,
    pub validations: Vec<ValidationResult>,
}

impl QualityReport {
    pub fn issues(&self) -> impl Iterator<Item = &ValidationResult> {
        self.validations.iter().filter(|v| !v.passed)
    }

    pub fn has_critical_issues(&self) -> bool {
        self.issues().any(|v| v.severity == Severity::Critical)
    }

    pub fn warning_count(&self) -> usize {
        self.issues().filter(|v| v.severity == Severity::Warning).count()
    }

    pub fn summary(&self) -> String {
        let messages: Vec<&str> = self.issues().map(|v| v.message.as_str()).collect();
        if messages.is_empty() {
            "ok".to_string()
        } else {
            messages.join("; ")
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchSummary {
    pub total_documents: usize,
    pub accepted: usize,
    pub rejected: usize,
    pub warnings: usize,
}

// ============================================================================
// DATA QUALITY ENGINE
// ============================================================================

#[derive(Debug, Default)]
pub struct DataQualityEngine;

impl DataQualityEngine {
    pub fn new() -> Self {
        DataQualityEngine
    }

    pub fn validate(&self, document: &SourceDocument) -> QualityReport {
        let mut validations = vec![
            self.validate_external_id(&document.header.external_id),
            self.validate_has_lines(document),
        ];

        for line in &document.lines {
            validations.push(self.validate_quantity(line.line_no, line.quantity));
        }

        if document.header.kind == RecordKind::Sale {
            validations.push(self.validate_sale_total(document.header.total_cents));
        }

        QualityReport {
            external_id: document.header.external_id.clone(),
            validations,
        }
    }

    /// Split documents into loadable ones and the reports of rejected ones
    pub fn partition(
        &self,
        documents: Vec<SourceDocument>,
    ) -> (Vec<SourceDocument>, Vec<QualityReport>, BatchSummary) {
        let mut accepted = Vec::with_capacity(documents.len());
        let mut rejected = Vec::new();
        let mut summary = BatchSummary {
            total_documents: documents.len(),
            ..Default::default()
        };

        for document in documents {
            let report = self.validate(&document);
            summary.warnings += report.warning_count();

            if report.has_critical_issues() {
                warn!(
                    source = %document.header.source,
                    external_id = %document.header.external_id,
                    issues = %report.summary(),
                    "Document rejected"
                );
                rejected.push(report);
            } else {
                if report.warning_count() > 0 {
                    debug!(
                        source = %document.header.source,
                        external_id = %document.header.external_id,
                        issues = %report.summary(),
                        "Document loaded with warnings"
                    );
                }
                accepted.push(document);
            }
        }

        summary.accepted = accepted.len();
        summary.rejected = rejected.len();
        (accepted, rejected, summary)
    }

    // ========================================================================
    // VALIDATION RULES
    // ========================================================================

    fn validate_external_id(&self, external_id: &str) -> ValidationResult {
        if external_id.trim().is_empty() {
            return ValidationResult::fail(
                "external_id_empty",
                "external_id",
                "External id is empty",
                Severity::Critical,
            );
        }

        ValidationResult::pass("external_id_present", "external_id", "External id present")
    }

    fn validate_has_lines(&self, document: &SourceDocument) -> ValidationResult {
        if document.lines.is_empty() {
            return ValidationResult::fail(
                "lines_empty",
                "lines",
                "Document has no lines",
                Severity::Warning,
            );
        }

        ValidationResult::pass("lines_present", "lines", "Document has lines")
    }

    fn validate_quantity(&self, line_no: u32, quantity: f64) -> ValidationResult {
        if !quantity.is_finite() {
            return ValidationResult::fail(
                "quantity_invalid",
                "quantity",
                &format!("Line {} quantity is not a number", line_no),
                Severity::Critical,
            );
        }

        if quantity == 0.0 {
            return ValidationResult::fail(
                "quantity_zero",
                "quantity",
                &format!("Line {} quantity is zero", line_no),
                Severity::Warning,
            );
        }

        if quantity < 0.0 {
            return ValidationResult::fail(
                "quantity_negative",
                "quantity",
                &format!("Line {} quantity is negative (return?)", line_no),
                Severity::Warning,
            );
        }

        ValidationResult::pass("quantity_valid", "quantity", "Quantity is valid")
    }

    fn validate_sale_total(&self, total_cents: i64) -> ValidationResult {
        if total_cents == 0 {
            return ValidationResult::fail(
                "sale_total_zero",
                "total_cents",
                "Sale total is zero",
                Severity::Warning,
            );
        }

        ValidationResult::pass("sale_total_present", "total_cents", "Sale total present")
    }
}
