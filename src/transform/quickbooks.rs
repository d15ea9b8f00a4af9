// 📒 QuickBooks invoice → invoice document
//
// Only `Line` entries with an `Id` and a SalesItemLineDetail are sales
// lines; subtotal and discount lines carry no Id. The built-in shipping item
// becomes the document's shipping amount instead of a line.

use super::{parse_occurred_at, value_cents, value_f64, value_string, DocumentHeader, DocumentLine, DocumentNormalizer, SourceDocument, Unit};
use crate::connectors::RawRecord;
use crate::error::{EtlError, Result};
use crate::source::{RecordKind, Source};
use serde_json::Value;

pub struct QuickbooksNormalizer;

const SHIPPING_ITEM_ID: &str = "SHIPPING_ITEM_ID";

impl DocumentNormalizer for QuickbooksNormalizer {
    fn source(&self) -> Source {
        Source::Quickbooks
    }

    fn normalize(&self, record: &RawRecord) -> Result<SourceDocument> {
        let invoice = &record.payload;
        let occurred_at = parse_occurred_at(Source::Quickbooks, invoice.get("TxnDate"))?;

        let mut lines = Vec::new();
        let mut shipping_cents = 0;

        let entries = invoice
            .get("Line")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();

        for entry in entries {
            let Some(detail) = entry.get("SalesItemLineDetail") else {
                continue;
            };
            if entry.get("Id").is_none() {
                continue;
            }

            let quantity = detail.get("Qty").and_then(value_f64).unwrap_or(1.0);
            let amount_cents = match entry.get("Amount").and_then(value_cents) {
                Some(amount) => amount,
                None => {
                    let unit_price = detail.get("UnitPrice").and_then(value_cents).ok_or_else(|| {
                        EtlError::decode(
                            Source::Quickbooks,
                            format!("invoice {}: line without Amount or UnitPrice", record.external_id),
                        )
                    })?;
                    (unit_price as f64 * quantity).round() as i64
                }
            };

            let item_id = value_string(detail.pointer("/ItemRef/value"));
            if item_id.as_deref() == Some(SHIPPING_ITEM_ID) {
                shipping_cents += amount_cents;
                continue;
            }

            lines.push(DocumentLine {
                line_no: lines.len() as u32 + 1,
                external_item_id: item_id,
                product_name: value_string(detail.pointer("/ItemRef/name")),
                category_name: None,
                quantity,
                unit: Unit::Each,
                amount_cents,
            });
        }

        let subtotal_cents: i64 = lines.iter().map(|line| line.amount_cents).sum();
        let total_cents = invoice
            .get("TotalAmt")
            .and_then(value_cents)
            .unwrap_or(subtotal_cents + shipping_cents);

        Ok(SourceDocument {
            header: DocumentHeader {
                source: Source::Quickbooks,
                external_id: record.external_id.clone(),
                kind: RecordKind::Invoice,
                occurred_at,
                customer_id: value_string(invoice.pointer("/CustomerRef/value")),
                location: None,
                reference: value_string(invoice.get("DocNumber")),
                subtotal_cents,
                shipping_cents,
                total_cents,
            },
            lines,
        })
    }
}
