// 📒 QuickBooks Online - invoices via the query endpoint, STARTPOSITION paging

use super::{ApiRequest, Connector, ExtractWindow, Extraction, PageGuard, RawRecord, Transport};
use crate::error::{EtlError, Result};
use crate::source::Source;
use async_trait::async_trait;
use chrono::SecondsFormat;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct QuickbooksConnector {
    transport: Arc<dyn Transport>,
    realm_id: String,
    minor_version: u32,
    page_size: usize,
    max_pages: usize,
}

impl QuickbooksConnector {
    pub fn new(
        transport: Arc<dyn Transport>,
        realm_id: &str,
        minor_version: u32,
        page_size: usize,
        max_pages: usize,
    ) -> Self {
        QuickbooksConnector {
            transport,
            realm_id: realm_id.to_string(),
            minor_version,
            // MAXRESULTS is capped at 1000
            page_size: page_size.clamp(1, 1000),
            max_pages,
        }
    }

    fn filter(window: &ExtractWindow) -> String {
        format!(
            "where MetaData.LastUpdatedTime >= '{}' and MetaData.LastUpdatedTime < '{}'",
            window.start.to_rfc3339_opts(SecondsFormat::Secs, false),
            window.end.to_rfc3339_opts(SecondsFormat::Secs, false),
        )
    }

    async fn query(&self, statement: String) -> Result<Value> {
        let request = ApiRequest::new(format!("/v3/company/{}/query", self.realm_id))
            .param("query", statement)
            .param("minorversion", self.minor_version);

        let response = self.transport.get(&request).await?;
        match response.body.get("QueryResponse") {
            Some(query_response) => Ok(query_response.clone()),
            None => Err(EtlError::decode(Source::Quickbooks, "response without 'QueryResponse'")),
        }
    }
}

/// `totalCount` of a count query; QuickBooks answers an empty match with `{}`
pub(crate) fn invoice_count(query_response: &Value) -> Result<usize> {
    match query_response.get("totalCount") {
        Some(count) => count.as_u64().map(|count| count as usize).ok_or_else(|| {
            EtlError::decode(
                Source::Quickbooks,
                format!("'totalCount' is not a count: {}", count),
            )
        }),
        None if query_response.as_object().is_some_and(|fields| fields.is_empty()) => Ok(0),
        None => Err(EtlError::decode(
            Source::Quickbooks,
            "count response without 'totalCount'",
        )),
    }
}

/// Pages needed for `total` rows; rounding down would drop the last partial page
pub(crate) fn page_count(total: usize, page_size: usize) -> usize {
    total.div_ceil(page_size.max(1))
}

#[async_trait]
impl Connector for QuickbooksConnector {
    fn source(&self) -> Source {
        Source::Quickbooks
    }

    async fn extract(&self, window: &ExtractWindow) -> Result<Extraction> {
        let filter = Self::filter(window);

        let counted = self
            .query(format!("select count(*) from Invoice {}", filter))
            .await?;
        let total = invoice_count(&counted)?;

        let pages = page_count(total, self.page_size);
        let mut guard = PageGuard::new(Source::Quickbooks, self.max_pages);
        let mut records = Vec::with_capacity(total);

        for page in 0..pages {
            guard.next_page()?;

            let start_position = page * self.page_size + 1;
            let response = self
                .query(format!(
                    "select * from Invoice {} ORDERBY Id STARTPOSITION {} MAXRESULTS {}",
                    filter, start_position, self.page_size
                ))
                .await?;

            // an empty page has no Invoice key at all
            let invoices: &[Value] = match response.get("Invoice") {
                Some(Value::Array(invoices)) => invoices.as_slice(),
                Some(_) => {
                    return Err(EtlError::decode(Source::Quickbooks, "'Invoice' is not an array"))
                }
                None => &[],
            };

            for invoice in invoices {
                records.push(RawRecord::from_payload(Source::Quickbooks, invoice.clone(), "Id")?);
            }

            debug!(start_position = start_position, invoices = invoices.len(), "QuickBooks page");

            if invoices.is_empty() {
                warn!(
                    start_position = start_position,
                    total = total,
                    "QuickBooks returned an empty page before the reported total"
                );
                break;
            }
        }

        info!(
            source = "quickbooks",
            records = records.len(),
            expected = total,
            pages = guard.pages(),
            "Extraction complete"
        );

        Ok(Extraction {
            records,
            expected_count: Some(total),
            pages: guard.pages(),
        })
    }
}
