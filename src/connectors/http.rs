// 🌐 HTTP Transport - reqwest client with auth, timeout, and retry/backoff

use super::{ApiRequest, ApiResponse, Transport};
use crate::config::HttpConfig;
use crate::error::{EtlError, Result};
use crate::retry::{retry_async, RetryPolicy};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, LINK, RETRY_AFTER};
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

#[derive(Clone)]
pub enum Auth {
    None,
    Bearer(String),
    Basic { username: String, password: String },
    /// API key sent in a named header
    Header { name: String, value: String },
}

impl std::fmt::Debug for Auth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // never print credentials
        let kind = match self {
            Auth::None => "None",
            Auth::Bearer(_) => "Bearer(***)",
            Auth::Basic { .. } => "Basic(***)",
            Auth::Header { .. } => "Header(***)",
        };
        f.write_str(kind)
    }
}

#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    base_url: String,
    auth: Auth,
    retry: RetryPolicy,
}

impl HttpTransport {
    pub fn new(base_url: &str, auth: Auth, http: &HttpConfig, retry: RetryPolicy) -> Result<Self> {
        let client = Client::builder()
            .timeout(http.timeout())
            .user_agent(http.user_agent.clone())
            .build()?;

        Ok(HttpTransport {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            auth,
            retry,
        })
    }

    fn url_for(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else {
            format!("{}/{}", self.base_url, path.trim_start_matches('/'))
        }
    }

    async fn get_once(&self, request: &ApiRequest) -> Result<ApiResponse> {
        let url = self.url_for(&request.path);

        let mut builder = self
            .client
            .get(&url)
            .query(&request.query)
            .header(reqwest::header::ACCEPT, "application/json");

        builder = match &self.auth {
            Auth::None => builder,
            Auth::Bearer(token) => builder.bearer_auth(token),
            Auth::Basic { username, password } => builder.basic_auth(username, Some(password)),
            Auth::Header { name, value } => builder.header(name.as_str(), value.as_str()),
        };

        let response = builder.send().await?;
        let status = response.status();
        let headers = response.headers().clone();

        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(EtlError::RateLimited {
                url,
                retry_after: retry_after(&headers),
            });
        }
        if !status.is_success() {
            return Err(EtlError::HttpStatus {
                status: status.as_u16(),
                url,
            });
        }

        let text = response.text().await?;
        let body = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text)?
        };

        let link = headers
            .get(LINK)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);

        debug!(url = %url, status = status.as_u16(), has_next = link.is_some(), "GET");

        Ok(ApiResponse { body, link })
    }
}

/// `Retry-After` in delta-seconds; HTTP-date values are ignored
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

#[async_trait]
impl Transport for HttpTransport {
    async fn get(&self, request: &ApiRequest) -> Result<ApiResponse> {
        let attempts = self.retry.max_attempts.max(1);
        retry_async(&self.retry, &request.path, || self.get_once(request))
            .await
            .map_err(|err| {
                // retried here already; callers must not repeat the request
                if err.is_retryable() {
                    EtlError::RetriesExhausted {
                        attempts,
                        last: Box::new(err),
                    }
                } else {
                    err
                }
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn transport(server: &MockServer, auth: Auth, max_attempts: u32) -> HttpTransport {
        HttpTransport::new(
            &server.uri(),
            auth,
            &HttpConfig::default(),
            RetryPolicy {
                max_attempts,
                initial_backoff_ms: 1,
                max_backoff_ms: 10,
            },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_get_sends_auth_and_query() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/LOC/payments"))
            .and(query_param("limit", "200"))
            .and(header("authorization", "Bearer secret"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!([{"id": "P1"}]))
                    .insert_header("Link", "<https://x.test/v1/LOC/payments?batch_token=t2>;rel='next'"),
            )
            .expect(1)
            .mount(&server)
            .await;

        let response = transport(&server, Auth::Bearer("secret".to_string()), 1)
            .get(&ApiRequest::new("/v1/LOC/payments").param("limit", 200))
            .await
            .unwrap();

        assert_eq!(response.body, json!([{"id": "P1"}]));
        assert!(response.link.unwrap().contains("batch_token=t2"));
    }

    #[tokio::test]
    async fn test_rate_limit_is_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/orders.json"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "0"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/orders.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"orders": []})))
            .mount(&server)
            .await;

        let response = transport(&server, Auth::None, 3)
            .get(&ApiRequest::new("orders.json"))
            .await
            .unwrap();

        assert_eq!(response.body, json!({"orders": []}));
    }

    #[tokio::test]
    async fn test_client_errors_are_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;

        let err = transport(&server, Auth::None, 5)
            .get(&ApiRequest::new("/api/v2/roasts"))
            .await
            .unwrap_err();

        assert!(matches!(err, EtlError::HttpStatus { status: 401, .. }));
    }

    #[tokio::test]
    async fn test_server_errors_exhaust_attempts() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .expect(3)
            .mount(&server)
            .await;

        let err = transport(&server, Auth::None, 3)
            .get(&ApiRequest::new("/v3/company/1/query"))
            .await
            .unwrap_err();

        match err {
            EtlError::RetriesExhausted { attempts, last } => {
                assert_eq!(attempts, 3);
                assert!(matches!(*last, EtlError::HttpStatus { status: 503, .. }));
            }
            other => panic!("expected exhausted retries, got {other:?}"),
        }
    }

    #[test]
    fn test_auth_debug_hides_secrets() {
        let auth = Auth::Basic {
            username: "key".to_string(),
            password: "hunter2".to_string(),
        };
        assert!(!format!("{:?}", auth).contains("hunter2"));
    }
}
