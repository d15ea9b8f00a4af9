// 🔥 Cropster roast → roast document, one line in kilograms

use super::{parse_occurred_at, value_f64, value_string, DocumentHeader, DocumentLine, DocumentNormalizer, SourceDocument, Unit};
use crate::connectors::RawRecord;
use crate::error::{EtlError, Result};
use crate::source::{RecordKind, Source};
use serde_json::Value;

pub struct CropsterNormalizer;

const KG_PER_LB: f64 = 0.453_592_37;

/// Convert a weight to kilograms
pub fn to_kg(amount: f64, unit: &str) -> Option<f64> {
    let factor = match unit.trim().to_lowercase().as_str() {
        "kg" | "kgs" | "kilogram" | "kilograms" => 1.0,
        "g" | "gram" | "grams" => 0.001,
        "lb" | "lbs" | "pound" | "pounds" => KG_PER_LB,
        "oz" | "ounce" | "ounces" => KG_PER_LB / 16.0,
        _ => return None,
    };
    Some(amount * factor)
}

/// JSON:API puts fields under `attributes`; flat payloads are accepted too
fn field<'a>(roast: &'a Value, name: &str) -> Option<&'a Value> {
    roast
        .get("attributes")
        .and_then(|attributes| attributes.get(name))
        .or_else(|| roast.get(name))
}

impl DocumentNormalizer for CropsterNormalizer {
    fn source(&self) -> Source {
        Source::Cropster
    }

    fn normalize(&self, record: &RawRecord) -> Result<SourceDocument> {
        let roast = &record.payload;
        let occurred_at = parse_occurred_at(Source::Cropster, field(roast, "roastDate"))?;

        let weight = field(roast, "endWeight").ok_or_else(|| {
            EtlError::decode(Source::Cropster, format!("roast {} without endWeight", record.external_id))
        })?;
        let amount = weight.get("amount").and_then(value_f64).unwrap_or(f64::NAN);
        let unit = weight.get("unit").and_then(Value::as_str).unwrap_or("kg");
        let quantity = to_kg(amount, unit).ok_or_else(|| {
            EtlError::decode(
                Source::Cropster,
                format!("roast {}: unknown weight unit '{}'", record.external_id, unit),
            )
        })?;

        let line = DocumentLine {
            line_no: 1,
            external_item_id: value_string(field(roast, "productId")),
            product_name: value_string(field(roast, "productName")),
            category_name: value_string(field(roast, "profileName")),
            quantity,
            unit: Unit::Kg,
            amount_cents: 0,
        };

        Ok(SourceDocument {
            header: DocumentHeader {
                source: Source::Cropster,
                external_id: record.external_id.clone(),
                kind: RecordKind::Roast,
                occurred_at,
                customer_id: None,
                location: value_string(field(roast, "machine")),
                reference: value_string(field(roast, "lotNumber")),
                subtotal_cents: 0,
                shipping_cents: 0,
                total_cents: 0,
            },
            lines: vec![line],
        })
    }
}
