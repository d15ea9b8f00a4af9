// 🟦 Square - V1 payments, paginated with a batch_token in the Link header

use super::{next_cursor, ApiRequest, Connector, ExtractWindow, Extraction, PageGuard, RawRecord, Transport};
use crate::error::{EtlError, Result};
use crate::source::Source;
use async_trait::async_trait;
use chrono::SecondsFormat;
use std::sync::Arc;
use tracing::{debug, info};

pub struct SquareConnector {
    transport: Arc<dyn Transport>,
    location_id: String,
    page_size: usize,
    max_pages: usize,
}

impl SquareConnector {
    pub fn new(transport: Arc<dyn Transport>, location_id: &str, page_size: usize, max_pages: usize) -> Self {
        SquareConnector {
            transport,
            location_id: location_id.to_string(),
            page_size,
            max_pages,
        }
    }
}

#[async_trait]
impl Connector for SquareConnector {
    fn source(&self) -> Source {
        Source::Square
    }

    async fn extract(&self, window: &ExtractWindow) -> Result<Extraction> {
        let path = format!("/v1/{}/payments", self.location_id);
        let mut guard = PageGuard::new(Source::Square, self.max_pages);
        let mut records = Vec::new();
        let mut batch_token: Option<String> = None;

        loop {
            guard.next_page()?;

            let mut request = ApiRequest::new(path.as_str())
                .param("begin_time", window.start.to_rfc3339_opts(SecondsFormat::Secs, true))
                .param("end_time", window.end.to_rfc3339_opts(SecondsFormat::Secs, true))
                .param("limit", self.page_size);
            if let Some(token) = &batch_token {
                request = request.param("batch_token", token);
            }

            let response = self.transport.get(&request).await?;
            let payments = response
                .body
                .as_array()
                .ok_or_else(|| EtlError::decode(Source::Square, "payments page is not an array"))?;

            for payment in payments {
                records.push(RawRecord::from_payload(Source::Square, payment.clone(), "id")?);
            }

            debug!(page = guard.pages(), payments = payments.len(), "Square page");

            batch_token = next_cursor(&response, "batch_token");
            if batch_token.is_none() {
                break;
            }
        }

        info!(
            source = "square",
            records = records.len(),
            pages = guard.pages(),
            "Extraction complete"
        );

        Ok(Extraction {
            records,
            expected_count: None,
            pages: guard.pages(),
        })
    }
}
