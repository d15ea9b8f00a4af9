// 🛍️ Shopify order → order document

use super::{parse_occurred_at, value_cents, value_f64, value_string, DocumentHeader, DocumentLine, DocumentNormalizer, SourceDocument, Unit};
use crate::connectors::RawRecord;
use crate::error::{EtlError, Result};
use crate::source::{RecordKind, Source};
use serde_json::Value;

pub struct ShopifyNormalizer;

/// "Title Variant", skipping Shopify's placeholder variant name
fn line_name(line_item: &Value) -> Option<String> {
    let title = value_string(line_item.get("title"))?;
    match value_string(line_item.get("variant_title")) {
        Some(variant) if variant != "Default Title" => Some(format!("{} {}", title, variant)),
        _ => Some(title),
    }
}

impl DocumentNormalizer for ShopifyNormalizer {
    fn source(&self) -> Source {
        Source::Shopify
    }

    fn normalize(&self, record: &RawRecord) -> Result<SourceDocument> {
        let order = &record.payload;
        let occurred_at = parse_occurred_at(Source::Shopify, order.get("created_at"))?;

        let line_items = order
            .get("line_items")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();

        let mut lines = Vec::with_capacity(line_items.len());
        for (index, line_item) in line_items.iter().enumerate() {
            let quantity = line_item.get("quantity").and_then(value_f64).unwrap_or(0.0);
            let price_cents = line_item.get("price").and_then(value_cents).ok_or_else(|| {
                EtlError::decode(
                    Source::Shopify,
                    format!("order {} line {}: missing or invalid price", record.external_id, index + 1),
                )
            })?;

            // quantities are whole units, so the product stays exact
            let amount_cents = (quantity.round() as i64) * price_cents;

            lines.push(DocumentLine {
                line_no: index as u32 + 1,
                external_item_id: value_string(line_item.get("sku"))
                    .or_else(|| value_string(line_item.get("variant_id"))),
                product_name: line_name(line_item),
                category_name: value_string(line_item.get("product_type")),
                quantity,
                unit: Unit::Each,
                amount_cents,
            });
        }

        let subtotal_cents: i64 = lines.iter().map(|line| line.amount_cents).sum();
        let shipping_cents = order
            .get("shipping_lines")
            .and_then(Value::as_array)
            .and_then(|shipping| shipping.first())
            .and_then(|first| first.get("price"))
            .and_then(value_cents)
            .unwrap_or(0);

        // Shopify's own figure, so reconciliation compares against the source
        let total_cents = match order.get("total_price").filter(|v| !v.is_null()) {
            Some(reported) => value_cents(reported).ok_or_else(|| {
                EtlError::decode(
                    Source::Shopify,
                    format!("order {}: invalid total_price {}", record.external_id, reported),
                )
            })?,
            None => subtotal_cents + shipping_cents,
        };

        Ok(SourceDocument {
            header: DocumentHeader {
                source: Source::Shopify,
                external_id: record.external_id.clone(),
                kind: RecordKind::Order,
                occurred_at,
                customer_id: value_string(order.pointer("/customer/id")),
                location: None,
                reference: value_string(order.get("name")),
                subtotal_cents,
                shipping_cents,
                total_cents,
            },
            lines,
        })
    }
}
