//! HTTP JSON data source.
//!
//! ### Requests
//! - Resource paths resolve against the configured base URL
//! - Request params become the query string of GET requests
//! - Mutations send a JSON body with any method
//!
//! ### Failure classification
//! - Request timeout: `Timeout`
//! - Connect/transport failure, HTTP 408, 429 and 5xx: `Transient`
//! - HTTP 404 and 410: `NotFound`
//! - Other 4xx and unusable URLs: `Validation`
//! - Undecodable bodies: `Unknown`

pub mod url;

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode, Url, header};
use serde_json::Value;

pub use self::url::{UrlError, canonicalize, resolve, with_query};

use quire_core::config::HttpConfig;
use quire_core::{Error, Fetcher};

/// Longest slice of an error response body carried into the error message.
const ERROR_BODY_LIMIT: usize = 200;

/// JSON-over-HTTP client.
#[derive(Debug, Clone)]
pub struct HttpClient {
    http: Client,
    base_url: Option<Url>,
}

impl HttpClient {
    pub fn new(config: &HttpConfig) -> Result<Self, Error> {
        let base_url = config
            .base_url
            .as_deref()
            .map(canonicalize)
            .transpose()
            .map_err(|e| Error::Validation(format!("base URL: {e}")))?;

        let http = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.timeout())
            .use_rustls_tls()
            .gzip(true)
            .brotli(true)
            .deflate(true)
            .build()
            .map_err(|e| Error::Unknown(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { http, base_url })
    }

    pub fn base_url(&self) -> Option<&Url> {
        self.base_url.as_ref()
    }

    /// Absolute URL for `path`.
    pub fn url(&self, path: &str) -> Result<Url, Error> {
        resolve(self.base_url.as_ref(), path).map_err(|e| Error::Validation(e.to_string()))
    }

    /// GET `path` with `params` as the query string and decode the JSON body.
    pub async fn get_json(&self, path: &str, params: &Value) -> Result<Value, Error> {
        let url = with_query(self.url(path)?, params);
        self.send(self.http.get(url.as_str()), &url).await
    }

    /// Send `body` as JSON with `method` and decode the JSON response.
    pub async fn send_json(&self, method: Method, path: &str, body: &Value) -> Result<Value, Error> {
        let url = self.url(path)?;
        self.send(self.http.request(method, url.as_str()).json(body), &url).await
    }

    async fn send(&self, request: reqwest::RequestBuilder, url: &Url) -> Result<Value, Error> {
        let start = Instant::now();
        let response = request
            .header(header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| classify_transport(&e))?;

        let status = response.status();
        let bytes = response.bytes().await.map_err(|e| classify_transport(&e))?;
        tracing::debug!(url = %url, status = status.as_u16(), bytes = bytes.len(), elapsed_ms = start.elapsed().as_millis() as u64, "http response");

        if !status.is_success() {
            let body = String::from_utf8_lossy(&bytes);
            let snippet: String = body.chars().take(ERROR_BODY_LIMIT).collect();
            return Err(status_error(status, &format!("{url}: {snippet}")));
        }
        if bytes.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&bytes).map_err(|e| Error::Unknown(format!("{url}: invalid JSON body: {e}")))
    }
}

/// Error for a non-success HTTP status.
pub fn status_error(status: StatusCode, context: &str) -> Error {
    let message = format!("status {} from {context}", status.as_u16());
    match status.as_u16() {
        404 | 410 => Error::NotFound(message),
        408 | 429 => Error::Transient(message),
        500..=599 => Error::Transient(message),
        400..=499 => Error::Validation(message),
        _ => Error::Unknown(message),
    }
}

fn classify_transport(err: &reqwest::Error) -> Error {
    if err.is_timeout() {
        Error::Timeout(err.to_string())
    } else if err.is_connect() || err.is_request() || err.is_body() {
        Error::Transient(err.to_string())
    } else if err.is_builder() {
        Error::Validation(err.to_string())
    } else {
        Error::Unknown(err.to_string())
    }
}

/// Fetcher issuing GET requests for one resource path.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Arc<HttpClient>,
    path: String,
}

impl HttpFetcher {
    pub fn new(client: Arc<HttpClient>, path: impl Into<String>) -> Self {
        Self { client, path: path.into() }
    }
}

#[async_trait]
impl Fetcher<Value> for HttpFetcher {
    async fn fetch(&self, params: &Value) -> Result<Value, Error> {
        self.client.get_json(&self.path, params).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quire_core::ErrorKind;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn config(base_url: Option<String>) -> HttpConfig {
        HttpConfig { base_url, user_agent: "quire-test/0.1".into(), timeout_ms: 2000 }
    }

    /// Serve `responses` in order, one per connection, on a local port.
    async fn serve(responses: Vec<(u16, &'static str)>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            for (status, body) in responses {
                let (mut socket, _) = listener.accept().await.unwrap();
                read_request(&mut socket).await;
                let response = format!(
                    "HTTP/1.1 {status} X\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len()
                );
                socket.write_all(response.as_bytes()).await.unwrap();
                socket.shutdown().await.ok();
            }
        });
        format!("http://{addr}/api/")
    }

    /// Consume one request (headers and any content-length body).
    async fn read_request(socket: &mut tokio::net::TcpStream) {
        let mut request = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            if let Some(end) = request.windows(4).position(|w| w == b"\r\n\r\n") {
                let head = String::from_utf8_lossy(&request[..end]).to_ascii_lowercase();
                let length = head
                    .lines()
                    .find_map(|line| line.strip_prefix("content-length:"))
                    .and_then(|v| v.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                if request.len() >= end + 4 + length {
                    return;
                }
            }
            let n = socket.read(&mut buf).await.unwrap();
            if n == 0 {
                return;
            }
            request.extend_from_slice(&buf[..n]);
        }
    }

    #[test]
    fn test_status_classification() {
        let kind = |code: u16| status_error(StatusCode::from_u16(code).unwrap(), "test").kind();
        assert_eq!(kind(404), ErrorKind::NotFound);
        assert_eq!(kind(410), ErrorKind::NotFound);
        assert_eq!(kind(408), ErrorKind::Transient);
        assert_eq!(kind(429), ErrorKind::Transient);
        assert_eq!(kind(503), ErrorKind::Transient);
        assert_eq!(kind(400), ErrorKind::Validation);
        assert_eq!(kind(422), ErrorKind::Validation);
        assert_eq!(kind(304), ErrorKind::Unknown);
    }

    #[test]
    fn test_client_new_rejects_bad_base_url() {
        let err = HttpClient::new(&config(Some("ftp://example.com".into()))).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn test_relative_path_needs_base() {
        let client = HttpClient::new(&config(None)).unwrap();
        assert_eq!(client.url("pages").unwrap_err().kind(), ErrorKind::Validation);

        let client = HttpClient::new(&config(Some("https://API.example.com/v1/".into()))).unwrap();
        assert_eq!(client.url("/pages/42").unwrap().as_str(), "https://api.example.com/v1/pages/42");
    }

    #[tokio::test]
    async fn test_fetcher_decodes_json() {
        let base = serve(vec![(200, r#"{"id":42,"title":"Home"}"#)]).await;
        let client = Arc::new(HttpClient::new(&config(Some(base))).unwrap());
        let fetcher = HttpFetcher::new(client, "pages");

        let value = fetcher.fetch(&json!({"id": 42})).await.unwrap();
        assert_eq!(value, json!({"id": 42, "title": "Home"}));
    }

    #[tokio::test]
    async fn test_server_error_is_transient() {
        let base = serve(vec![(503, r#"{"error":"maintenance"}"#)]).await;
        let client = HttpClient::new(&config(Some(base))).unwrap();

        let err = client.get_json("pages", &Value::Null).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transient);
        assert!(err.to_string().contains("maintenance"));
    }

    #[tokio::test]
    async fn test_invalid_body_is_unknown() {
        let base = serve(vec![(200, "<html>")]).await;
        let client = HttpClient::new(&config(Some(base))).unwrap();

        let err = client.get_json("pages", &Value::Null).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unknown);
    }

    #[tokio::test]
    async fn test_send_json_empty_body() {
        let base = serve(vec![(200, "")]).await;
        let client = HttpClient::new(&config(Some(base))).unwrap();

        let value = client.send_json(Method::PUT, "pages/42", &json!({"title": "Home"})).await.unwrap();
        assert_eq!(value, Value::Null);
    }

    #[tokio::test]
    async fn test_connection_refused_is_transient() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let client = HttpClient::new(&config(None)).unwrap();

        let err = client.get_json(&format!("http://{addr}/pages"), &Value::Null).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transient);
    }
}
