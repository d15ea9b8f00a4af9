// 🔄 Transform Layer - every source's payload → one document/line shape
//
// Normalizers are per source (like one parser per bank); resolution against
// the SKU map is shared. A normalizer never guesses an item: it only copies
// identifiers and names out of the payload.

pub mod cropster;
pub mod quickbooks;
pub mod shopify;
pub mod square;

pub use cropster::CropsterNormalizer;
pub use quickbooks::QuickbooksNormalizer;
pub use shopify::ShopifyNormalizer;
pub use square::SquareNormalizer;

use crate::connectors::RawRecord;
use crate::error::{EtlError, Result};
use crate::sku::{Resolution, SkuMap};
use crate::source::{RecordKind, Source};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// COMMON SHAPE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Unit {
    Each,
    Kg,
}

impl Unit {
    pub fn as_str(&self) -> &'static str {
        match self {
            Unit::Each => "each",
            Unit::Kg => "kg",
        }
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Unit {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "each" => Ok(Unit::Each),
            "kg" => Ok(Unit::Kg),
            other => Err(format!("Unknown unit: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentHeader {
    pub source: Source,
    pub external_id: String,
    pub kind: RecordKind,
    pub occurred_at: DateTime<Utc>,
    pub customer_id: Option<String>,
    pub location: Option<String>,
    /// Human-facing number (QuickBooks DocNumber)
    pub reference: Option<String>,
    pub subtotal_cents: i64,
    pub shipping_cents: i64,
    pub total_cents: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentLine {
    /// 1-based position, stable across re-extractions of the same document
    pub line_no: u32,
    pub external_item_id: Option<String>,
    pub product_name: Option<String>,
    pub category_name: Option<String>,
    pub quantity: f64,
    pub unit: Unit,
    pub amount_cents: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceDocument {
    pub header: DocumentHeader,
    pub lines: Vec<DocumentLine>,
}

impl SourceDocument {
    pub fn source(&self) -> Source {
        self.header.source
    }

    pub fn external_id(&self) -> &str {
        &self.header.external_id
    }

    pub fn line_total_cents(&self) -> i64 {
        self.lines.iter().map(|line| line.amount_cents).sum()
    }

    /// SHA-256 over the normalized document; equal hash means nothing to update
    pub fn compute_content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        // serde_json keeps struct field order, so the encoding is stable
        let encoded = serde_json::to_string(self).unwrap_or_default();
        hasher.update(encoded.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

// ============================================================================
// NORMALIZERS
// ============================================================================

pub trait DocumentNormalizer: Send + Sync {
    fn source(&self) -> Source;

    /// Turn one raw API record into a document
    fn normalize(&self, record: &RawRecord) -> Result<SourceDocument>;
}

/// Normalizer for each source
pub fn get_normalizer(source: Source) -> Box<dyn DocumentNormalizer> {
    match source {
        Source::Square => Box::new(SquareNormalizer),
        Source::Quickbooks => Box::new(QuickbooksNormalizer),
        Source::Shopify => Box::new(ShopifyNormalizer),
        Source::Cropster => Box::new(CropsterNormalizer),
    }
}

/// Normalize one record with its source's normalizer
pub fn normalize(record: &RawRecord) -> Result<SourceDocument> {
    get_normalizer(record.source).normalize(record)
}

// ============================================================================
// RESOLUTION
// ============================================================================

/// A document line bound to exactly one canonical item
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Transaction {
    pub source: Source,
    pub external_id: String,
    pub line_no: u32,
    pub occurred_at: DateTime<Utc>,
    pub item_id: i64,
    pub quantity: f64,
    pub unit: Unit,
    pub amount_cents: i64,
    pub category_name: Option<String>,
}

/// A document line no item matched; kept aside until the catalog catches up
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuarantinedLine {
    pub source: Source,
    pub external_id: String,
    pub occurred_at: DateTime<Utc>,
    pub line: DocumentLine,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct TransformOutput {
    pub documents: Vec<SourceDocument>,
    pub transactions: Vec<Transaction>,
    pub unresolved: Vec<QuarantinedLine>,
}

impl TransformOutput {
    pub fn line_count(&self) -> usize {
        self.transactions.len() + self.unresolved.len()
    }
}

/// Bind every line to an item or quarantine it
pub fn resolve(documents: Vec<SourceDocument>, sku_map: &SkuMap) -> TransformOutput {
    let mut output = TransformOutput::default();

    for document in &documents {
        let header = &document.header;
        for line in &document.lines {
            match sku_map.resolve(
                header.source,
                line.external_item_id.as_deref(),
                line.product_name.as_deref(),
            ) {
                Resolution::Resolved { item_id, .. } => output.transactions.push(Transaction {
                    source: header.source,
                    external_id: header.external_id.clone(),
                    line_no: line.line_no,
                    occurred_at: header.occurred_at,
                    item_id,
                    quantity: line.quantity,
                    unit: line.unit,
                    amount_cents: line.amount_cents,
                    category_name: line.category_name.clone(),
                }),
                Resolution::Unresolved(reason) => output.unresolved.push(QuarantinedLine {
                    source: header.source,
                    external_id: header.external_id.clone(),
                    occurred_at: header.occurred_at,
                    line: line.clone(),
                    reason,
                }),
            }
        }
    }

    output.documents = documents;
    output
}

// ============================================================================
// FIELD HELPERS
// ============================================================================

/// Parse a decimal money amount into integer cents without going through f64
///
/// Accepts "12", "12.5", "-3.75", "1,234.00" and JSON numbers. Digits past
/// the cent are rounded half away from zero.
pub fn parse_cents(raw: &str) -> Option<i64> {
    let cleaned: String = raw.trim().chars().filter(|c| *c != ',' && *c != '$').collect();
    let (negative, digits) = match cleaned.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, cleaned.strip_prefix('+').unwrap_or(cleaned.as_str())),
    };

    let (whole, fraction) = match digits.split_once('.') {
        Some((whole, fraction)) => (whole, fraction),
        None => (digits, ""),
    };
    if whole.is_empty() && fraction.is_empty() {
        return None;
    }
    if !whole.chars().all(|c| c.is_ascii_digit()) || !fraction.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }

    let whole_value: i64 = if whole.is_empty() { 0 } else { whole.parse().ok()? };
    let mut fraction_digits = fraction.bytes().map(|b| i64::from(b - b'0'));
    let tenths = fraction_digits.next().unwrap_or(0);
    let hundredths = fraction_digits.next().unwrap_or(0);
    let round_up = fraction_digits.next().is_some_and(|digit| digit >= 5);

    let cents = whole_value
        .checked_mul(100)?
        .checked_add(tenths * 10 + hundredths + i64::from(round_up))?;

    Some(if negative { -cents } else { cents })
}

/// Money from a JSON string or number
pub(crate) fn value_cents(value: &Value) -> Option<i64> {
    match value {
        Value::String(s) => parse_cents(s),
        Value::Number(n) => number_cents(n),
        _ => None,
    }
}

fn number_cents(n: &serde_json::Number) -> Option<i64> {
    if let Some(whole) = n.as_i64() {
        return whole.checked_mul(100);
    }

    let text = n.to_string();
    if !text.contains(['e', 'E']) {
        return parse_cents(&text);
    }

    // exponent form has no exact decimal digits to read; round the float
    let cents = (n.as_f64()? * 100.0).round();
    (cents.is_finite() && cents.abs() < i64::MAX as f64).then_some(cents as i64)
}

/// Quantity from a JSON string or number
pub(crate) fn value_f64(value: &Value) -> Option<f64> {
    match value {
        Value::String(s) => s.trim().parse().ok(),
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

/// Non-empty string, accepting numeric ids
pub(crate) fn value_string(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// RFC 3339 timestamp, or a bare date taken as midnight UTC
pub(crate) fn parse_occurred_at(source: Source, raw: Option<&Value>) -> Result<DateTime<Utc>> {
    let text = raw
        .and_then(Value::as_str)
        .ok_or_else(|| EtlError::decode(source, "record without a timestamp"))?;

    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Ok(ts.with_timezone(&Utc));
    }
    if let Ok(date) = NaiveDate::parse_from_str(text, "%Y-%m-%d") {
        if let Some(midnight) = date.and_hms_opt(0, 0, 0) {
            return Ok(midnight.and_utc());
        }
    }

    Err(EtlError::decode(source, format!("unparseable timestamp '{}'", text)))
}
