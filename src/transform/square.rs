// 🟦 Square payment → sale document
// Money is already in cents; quantities arrive as decimal strings.

use super::{parse_occurred_at, value_f64, value_string, DocumentHeader, DocumentLine, DocumentNormalizer, SourceDocument, Unit};
use crate::connectors::RawRecord;
use crate::error::{EtlError, Result};
use crate::source::{RecordKind, Source};
use serde_json::Value;

pub struct SquareNormalizer;

fn money_cents(value: Option<&Value>) -> Option<i64> {
    value?.get("amount")?.as_i64()
}

impl DocumentNormalizer for SquareNormalizer {
    fn source(&self) -> Source {
        Source::Square
    }

    fn normalize(&self, record: &RawRecord) -> Result<SourceDocument> {
        let payment = &record.payload;
        let occurred_at = parse_occurred_at(Source::Square, payment.get("created_at"))?;

        let itemizations: &[Value] = match payment.get("itemizations") {
            Some(Value::Array(items)) => items.as_slice(),
            None | Some(Value::Null) => &[],
            Some(_) => {
                return Err(EtlError::decode(
                    Source::Square,
                    format!("payment {}: 'itemizations' is not an array", record.external_id),
                ))
            }
        };

        let mut lines = Vec::with_capacity(itemizations.len());
        for (index, itemization) in itemizations.iter().enumerate() {
            let detail = itemization.get("item_detail");
            let quantity = itemization.get("quantity").and_then(value_f64).unwrap_or(1.0);
            let amount_cents = money_cents(itemization.get("total_money")).ok_or_else(|| {
                EtlError::decode(
                    Source::Square,
                    format!("payment {} line {}: missing total_money.amount", record.external_id, index + 1),
                )
            })?;

            lines.push(DocumentLine {
                line_no: index as u32 + 1,
                external_item_id: value_string(detail.and_then(|d| d.get("sku"))),
                product_name: value_string(itemization.get("name")),
                category_name: value_string(detail.and_then(|d| d.get("category_name"))),
                quantity,
                unit: Unit::Each,
                amount_cents,
            });
        }

        let subtotal_cents: i64 = lines.iter().map(|line| line.amount_cents).sum();
        let total_cents = money_cents(payment.get("total_money")).unwrap_or(subtotal_cents);

        Ok(SourceDocument {
            header: DocumentHeader {
                source: Source::Square,
                external_id: record.external_id.clone(),
                kind: RecordKind::Sale,
                occurred_at,
                customer_id: None,
                location: value_string(payment.pointer("/device/name")),
                reference: None,
                subtotal_cents,
                shipping_cents: 0,
                total_cents,
            },
            lines,
        })
    }
}
