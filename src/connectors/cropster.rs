// 🔥 Cropster - roast batches from the JSON:API roasts endpoint

use super::{ApiRequest, Connector, ExtractWindow, Extraction, PageGuard, RawRecord, Transport};
use crate::error::{EtlError, Result};
use crate::source::Source;
use async_trait::async_trait;
use chrono::SecondsFormat;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info};

pub struct CropsterConnector {
    transport: Arc<dyn Transport>,
    group: String,
    page_size: usize,
    max_pages: usize,
}

impl CropsterConnector {
    pub fn new(transport: Arc<dyn Transport>, group: &str, page_size: usize, max_pages: usize) -> Self {
        CropsterConnector {
            transport,
            group: group.to_string(),
            page_size: page_size.max(1),
            max_pages,
        }
    }
}

#[async_trait]
impl Connector for CropsterConnector {
    fn source(&self) -> Source {
        Source::Cropster
    }

    async fn extract(&self, window: &ExtractWindow) -> Result<Extraction> {
        let mut guard = PageGuard::new(Source::Cropster, self.max_pages);
        let mut records = Vec::new();
        let mut expected = None;
        let mut page_number = 1usize;

        loop {
            guard.next_page()?;

            let request = ApiRequest::new("/api/v2/roasts")
                .param("filter[group]", &self.group)
                .param("filter[roastDate][gte]", window.start.to_rfc3339_opts(SecondsFormat::Secs, true))
                .param("filter[roastDate][lt]", window.end.to_rfc3339_opts(SecondsFormat::Secs, true))
                .param("page[number]", page_number)
                .param("page[size]", self.page_size);

            let response = self.transport.get(&request).await?;
            let roasts = response
                .body
                .get("data")
                .and_then(Value::as_array)
                .ok_or_else(|| EtlError::decode(Source::Cropster, "document without 'data' array"))?;

            for roast in roasts {
                records.push(RawRecord::from_payload(Source::Cropster, roast.clone(), "id")?);
            }

            if expected.is_none() {
                expected = response
                    .body
                    .pointer("/meta/total")
                    .and_then(Value::as_u64)
                    .map(|total| total as usize);
            }

            debug!(page = page_number, roasts = roasts.len(), "Cropster page");

            let has_next = response
                .body
                .pointer("/links/next")
                .is_some_and(|next| !next.is_null());
            if !has_next || roasts.is_empty() {
                break;
            }
            page_number += 1;
        }

        info!(
            source = "cropster",
            records = records.len(),
            pages = guard.pages(),
            "Extraction complete"
        );

        Ok(Extraction {
            records,
            expected_count: expected,
            pages: guard.pages(),
        })
    }
}
