// 🛍️ Shopify - orders, counted first, then walked with page_info cursors

use super::{next_cursor, ApiRequest, Connector, ExtractWindow, Extraction, PageGuard, RawRecord, Transport};
use crate::error::{EtlError, Result};
use crate::source::Source;
use async_trait::async_trait;
use chrono::SecondsFormat;
use std::sync::Arc;
use tracing::{debug, info};

pub struct ShopifyConnector {
    transport: Arc<dyn Transport>,
    api_version: String,
    page_size: usize,
    max_pages: usize,
}

impl ShopifyConnector {
    pub fn new(transport: Arc<dyn Transport>, api_version: &str, page_size: usize, max_pages: usize) -> Self {
        ShopifyConnector {
            transport,
            api_version: api_version.to_string(),
            // Shopify caps limit at 250
            page_size: page_size.clamp(1, 250),
            max_pages,
        }
    }

    fn path(&self, resource: &str) -> String {
        format!("/admin/api/{}/{}", self.api_version, resource)
    }

    fn with_window(&self, request: ApiRequest, window: &ExtractWindow) -> ApiRequest {
        request
            .param("status", "any")
            .param("updated_at_min", window.start.to_rfc3339_opts(SecondsFormat::Secs, true))
            .param("updated_at_max", window.end.to_rfc3339_opts(SecondsFormat::Secs, true))
    }

    async fn count(&self, window: &ExtractWindow) -> Result<usize> {
        let request = self.with_window(ApiRequest::new(self.path("orders/count.json")), window);
        let response = self.transport.get(&request).await?;

        response
            .body
            .get("count")
            .and_then(|count| count.as_u64())
            .map(|count| count as usize)
            .ok_or_else(|| EtlError::decode(Source::Shopify, "count response without 'count'"))
    }
}

#[async_trait]
impl Connector for ShopifyConnector {
    fn source(&self) -> Source {
        Source::Shopify
    }

    async fn extract(&self, window: &ExtractWindow) -> Result<Extraction> {
        let expected = self.count(window).await?;
        let mut guard = PageGuard::new(Source::Shopify, self.max_pages);
        let mut records = Vec::with_capacity(expected);
        let mut page_info: Option<String> = None;

        if expected > 0 {
            loop {
                guard.next_page()?;

                // page_info carries the filters; Shopify rejects them alongside it
                let request = match &page_info {
                    Some(cursor) => ApiRequest::new(self.path("orders.json"))
                        .param("limit", self.page_size)
                        .param("page_info", cursor),
                    None => self
                        .with_window(ApiRequest::new(self.path("orders.json")), window)
                        .param("limit", self.page_size),
                };

                let response = self.transport.get(&request).await?;
                let orders = response
                    .body
                    .get("orders")
                    .and_then(|orders| orders.as_array())
                    .ok_or_else(|| EtlError::decode(Source::Shopify, "page without 'orders' array"))?;

                for order in orders {
                    records.push(RawRecord::from_payload(Source::Shopify, order.clone(), "id")?);
                }

                debug!(page = guard.pages(), orders = orders.len(), "Shopify page");

                page_info = next_cursor(&response, "page_info");
                if page_info.is_none() {
                    break;
                }
            }
        }

        info!(
            source = "shopify",
            records = records.len(),
            expected = expected,
            pages = guard.pages(),
            "Extraction complete"
        );

        Ok(Extraction {
            records,
            expected_count: Some(expected),
            pages: guard.pages(),
        })
    }
}
