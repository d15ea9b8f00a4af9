// 🔌 Source Connectors - pull raw records for a time window from each API
//
// A connector knows one API's pagination scheme. It never transforms: it
// returns the JSON records exactly as the source sent them, tagged with the
// source's own record id.

pub mod cropster;
pub mod http;
pub mod quickbooks;
pub mod shopify;
pub mod square;

pub use cropster::CropsterConnector;
pub use http::{Auth, HttpTransport};
pub use quickbooks::QuickbooksConnector;
pub use shopify::ShopifyConnector;
pub use square::SquareConnector;

use crate::config::WarehouseConfig;
use crate::error::{EtlError, Result};
use crate::source::Source;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;

// ============================================================================
// WINDOW & RECORDS
// ============================================================================

/// Half-open extraction window `[start, end)`, UTC
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtractWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl ExtractWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        ExtractWindow { start, end }
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        self.start <= ts && ts < self.end
    }
}

impl std::fmt::Display for ExtractWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.start.to_rfc3339(), self.end.to_rfc3339())
    }
}

/// One record as returned by the source API
#[derive(Debug, Clone, PartialEq)]
pub struct RawRecord {
    pub source: Source,
    pub external_id: String,
    pub payload: Value,
}

impl RawRecord {
    /// Take the id from `payload[id_field]`, accepting strings and numbers
    pub fn from_payload(source: Source, payload: Value, id_field: &str) -> Result<Self> {
        let external_id = match payload.get(id_field) {
            Some(Value::String(id)) if !id.trim().is_empty() => id.trim().to_string(),
            Some(Value::Number(id)) => id.to_string(),
            _ => {
                return Err(EtlError::decode(
                    source,
                    format!("record without '{}'", id_field),
                ))
            }
        };

        Ok(RawRecord {
            source,
            external_id,
            payload,
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct Extraction {
    pub records: Vec<RawRecord>,
    /// Count the source reported up front, when it reports one
    pub expected_count: Option<usize>,
    pub pages: usize,
}

// ============================================================================
// TRAITS
// ============================================================================

#[async_trait]
pub trait Connector: Send + Sync {
    fn source(&self) -> Source;

    /// Every record created or updated inside `window`, following pagination to the end
    async fn extract(&self, window: &ExtractWindow) -> Result<Extraction>;
}

/// GET relative to the transport's base URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiRequest {
    pub path: String,
    pub query: Vec<(String, String)>,
}

impl ApiRequest {
    pub fn new(path: impl Into<String>) -> Self {
        ApiRequest {
            path: path.into(),
            query: Vec::new(),
        }
    }

    pub fn param(mut self, key: &str, value: impl ToString) -> Self {
        self.query.push((key.to_string(), value.to_string()));
        self
    }

    pub fn get_param(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone, Default)]
pub struct ApiResponse {
    pub body: Value,
    /// Raw `Link` header, used by cursor-paginated APIs
    pub link: Option<String>,
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn get(&self, request: &ApiRequest) -> Result<ApiResponse>;
}

// ============================================================================
// PAGINATION HELPERS
// ============================================================================

/// Counts pages and stops runaway pagination
#[derive(Debug)]
pub(crate) struct PageGuard {
    source: Source,
    max_pages: usize,
    pages: usize,
}

impl PageGuard {
    pub(crate) fn new(source: Source, max_pages: usize) -> Self {
        PageGuard {
            source,
            max_pages: max_pages.max(1),
            pages: 0,
        }
    }

    /// Call before fetching each page
    pub(crate) fn next_page(&mut self) -> Result<()> {
        if self.pages >= self.max_pages {
            return Err(EtlError::PageLimit {
                origin: self.source,
                max_pages: self.max_pages,
            });
        }
        self.pages += 1;
        Ok(())
    }

    pub(crate) fn pages(&self) -> usize {
        self.pages
    }
}

/// URL of the `rel="next"` entry of a `Link` header
///
/// Handles both `rel="next"` and the single-quoted `rel='next'` Square sends.
pub fn next_link(header: &str) -> Option<String> {
    header.split(',').find_map(|part| {
        let (url_part, params) = part.split_once(';')?;
        let is_next = params.split(';').any(|param| {
            let param = param.trim().to_lowercase();
            let value = param.strip_prefix("rel=").map(|v| v.trim_matches(|c| c == '"' || c == '\''));
            value == Some("next")
        });
        if !is_next {
            return None;
        }
        let url = url_part.trim().trim_start_matches('<').trim_end_matches('>');
        Some(url.to_string())
    })
}

/// Value of query parameter `name` in `url`
pub fn query_param(url: &str, name: &str) -> Option<String> {
    let parsed = reqwest::Url::parse(url).ok()?;
    let value = parsed
        .query_pairs()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned());
    value
}

/// Cursor parameter of the next page, or None on the last page
pub(crate) fn next_cursor(response: &ApiResponse, param: &str) -> Option<String> {
    response
        .link
        .as_deref()
        .and_then(next_link)
        .and_then(|url| query_param(&url, param))
        .filter(|cursor| !cursor.is_empty())
}

// ============================================================================
// FACTORY
// ============================================================================

/// Build the HTTP-backed connector for `source` from configuration
pub fn build_connector(source: Source, config: &WarehouseConfig) -> Result<Arc<dyn Connector>> {
    let base_url = config.sources.base_url(source).ok_or_else(|| {
        EtlError::Config(format!("sources.{}.base_url is required", source))
    })?;
    let page_size = config.sources.page_size(source);
    let max_pages = config.http.max_pages;

    let connector: Arc<dyn Connector> = match source {
        Source::Square => {
            let square = &config.sources.square;
            let transport = HttpTransport::new(
                &base_url,
                Auth::Bearer(square.access_token.clone()),
                &config.http,
                config.retry.clone(),
            )?;
            Arc::new(SquareConnector::new(
                Arc::new(transport),
                &square.location_id,
                page_size,
                max_pages,
            ))
        }
        Source::Quickbooks => {
            let qb = &config.sources.quickbooks;
            let transport = HttpTransport::new(
                &base_url,
                Auth::Bearer(qb.access_token.clone()),
                &config.http,
                config.retry.clone(),
            )?;
            Arc::new(QuickbooksConnector::new(
                Arc::new(transport),
                &qb.realm_id,
                qb.minor_version,
                page_size,
                max_pages,
            ))
        }
        Source::Shopify => {
            let shopify = &config.sources.shopify;
            let transport = HttpTransport::new(
                &base_url,
                Auth::Basic {
                    username: shopify.api_key.clone(),
                    password: shopify.password.clone(),
                },
                &config.http,
                config.retry.clone(),
            )?;
            Arc::new(ShopifyConnector::new(
                Arc::new(transport),
                &shopify.api_version,
                page_size,
                max_pages,
            ))
        }
        Source::Cropster => {
            let cropster = &config.sources.cropster;
            let transport = HttpTransport::new(
                &base_url,
                Auth::Basic {
                    username: cropster.api_key.clone(),
                    password: cropster.api_secret.clone(),
                },
                &config.http,
                config.retry.clone(),
            )?;
            Arc::new(CropsterConnector::new(
                Arc::new(transport),
                &cropster.group,
                page_size,
                max_pages,
            ))
        }
    };

    Ok(connector)
}

// ============================================================================
// TEST SUPPORT
// ============================================================================

#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays canned responses and records every request
    #[derive(Default)]
    pub(crate) struct FakeTransport {
        responses: Mutex<VecDeque<Result<ApiResponse>>>,
        pub(crate) requests: Mutex<Vec<ApiRequest>>,
    }

    impl FakeTransport {
        pub(crate) fn new() -> Self {
            Self::default()
        }

        pub(crate) fn respond(self, body: Value) -> Self {
            self.respond_with_link(body, None)
        }

        pub(crate) fn respond_with_link(self, body: Value, link: Option<&str>) -> Self {
            self.responses
                .lock()
                .unwrap()
                .push_back(Ok(ApiResponse {
                    body,
                    link: link.map(str::to_string),
                }));
            self
        }

        pub(crate) fn fail(self, err: EtlError) -> Self {
            self.responses.lock().unwrap().push_back(Err(err));
            self
        }

        pub(crate) fn requests(&self) -> Vec<ApiRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Transport for FakeTransport {
        async fn get(&self, request: &ApiRequest) -> Result<ApiResponse> {
            self.requests.lock().unwrap().push(request.clone());
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(EtlError::Network("no canned response left".to_string())))
        }
    }

    /// Replays canned extractions; records the windows it was asked for
    pub(crate) struct FakeConnector {
        source: Source,
        extractions: Mutex<VecDeque<Result<Extraction>>>,
        pub(crate) windows: Mutex<Vec<ExtractWindow>>,
    }

    impl FakeConnector {
        pub(crate) fn new(source: Source) -> Self {
            FakeConnector {
                source,
                extractions: Mutex::new(VecDeque::new()),
                windows: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn returns(self, payloads: Vec<Value>, id_field: &str, expected_count: Option<usize>) -> Self {
            let records = payloads
                .into_iter()
                .map(|payload| RawRecord::from_payload(self.source, payload, id_field).unwrap())
                .collect();
            self.extractions.lock().unwrap().push_back(Ok(Extraction {
                records,
                expected_count,
                pages: 1,
            }));
            self
        }

        pub(crate) fn fails(self, err: EtlError) -> Self {
            self.extractions.lock().unwrap().push_back(Err(err));
            self
        }

        pub(crate) fn calls(&self) -> usize {
            self.windows.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Connector for FakeConnector {
        fn source(&self) -> Source {
            self.source
        }

        async fn extract(&self, window: &ExtractWindow) -> Result<Extraction> {
            self.windows.lock().unwrap().push(*window);
            self.extractions
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(Extraction::default()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn test_next_link_shopify_style() {
        let header = "<https://shop.example/admin/api/2024-01/orders.json?limit=50&page_info=abc>; rel=\"previous\", \
                      <https://shop.example/admin/api/2024-01/orders.json?limit=50&page_info=def>; rel=\"next\"";

        let next = next_link(header).unwrap();
        assert_eq!(query_param(&next, "page_info").as_deref(), Some("def"));
    }

    #[test]
    fn test_next_link_square_style() {
        let header = "<https://connect.squareup.com/v1/LOC/payments?batch_token=tok123>;rel='next'";

        let next = next_link(header).unwrap();
        assert_eq!(query_param(&next, "batch_token").as_deref(), Some("tok123"));
    }

    #[test]
    fn test_next_link_absent() {
        assert_eq!(
            next_link("<https://shop.example/orders.json?page_info=abc>; rel=\"previous\""),
            None
        );
    }

    #[test]
    fn test_raw_record_accepts_numeric_ids() {
        let record = RawRecord::from_payload(Source::Shopify, json!({"id": 450789469}), "id").unwrap();
        assert_eq!(record.external_id, "450789469");

        assert!(RawRecord::from_payload(Source::Shopify, json!({"id": ""}), "id").is_err());
        assert!(RawRecord::from_payload(Source::Shopify, json!({}), "id").is_err());
    }

    #[test]
    fn test_window_is_half_open() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
        let window = ExtractWindow::new(start, end);

        assert!(window.contains(start));
        assert!(!window.contains(end));
        assert!(!window.is_empty());
        assert!(ExtractWindow::new(end, end).is_empty());
    }

    #[test]
    fn test_page_guard_limits_pages() {
        let mut guard = PageGuard::new(Source::Cropster, 2);

        assert!(guard.next_page().is_ok());
        assert!(guard.next_page().is_ok());
        assert!(matches!(
            guard.next_page(),
            Err(EtlError::PageLimit { max_pages: 2, .. })
        ));
        assert_eq!(guard.pages(), 2);
    }

    #[test]
    fn test_build_connector_requires_shopify_host() {
        let config = WarehouseConfig::default();

        assert!(build_connector(Source::Shopify, &config).is_err());
        assert_eq!(
            build_connector(Source::Square, &config).unwrap().source(),
            Source::Square
        );
    }
}
