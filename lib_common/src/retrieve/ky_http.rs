//! # HTTP Retrieval Utilities
//!
//! This module provides an asynchronous API client wrapper around `reqwest`.
//! It includes optional middleware support for exponential backoff retries,
//! a per-request timeout and standardized JSON response handling.

use std::time::Duration;

use anyhow::Context;
use reqwest::{header::HeaderMap, Method, Url};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use serde::{de::DeserializeOwned, Serialize};

/// A standardized container for API responses.
///
/// This struct wraps the deserialized data along with metadata about the
/// HTTP transaction, such as status codes and headers.
#[derive(Debug)]
pub struct ApiResponse<T> {
    /// The successfully deserialized response body, if any.
    pub data: Option<T>,
    /// The raw error body returned by the server if the request failed.
    pub error_body: Option<String>,
    /// The numeric HTTP status code.
    pub status: u16,
    /// Indicates if the status code was in the 2xx range.
    pub success: bool,
    /// The headers returned by the server.
    pub headers: HeaderMap,
}

impl<T> ApiResponse<T> {
    /// Returns the body of a successful response, or an error describing the
    /// failed one.
    pub fn into_data(self) -> anyhow::Result<T> {
        match self.data {
            Some(data) if self.success => Ok(data),
            _ => Err(anyhow::anyhow!(
                "HTTP {}: {}",
                self.status,
                self.error_body.unwrap_or_default().trim()
            )),
        }
    }
}

/// Transport settings of an `ApiClient`.
#[derive(Debug, Clone, Copy)]
pub struct ApiClientOptions {
    /// Upper bound for a whole request, body included.
    pub timeout: Duration,
    /// Retries on transient failures. `0` disables the retry middleware.
    pub max_retries: u32,
}

impl Default for ApiClientOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            max_retries: 3,
        }
    }
}

/// A flexible asynchronous HTTP client.
///
/// Built on top of `reqwest_middleware`, it handles base URLs, timeouts and
/// automatic retries.
#[derive(Debug, Clone)]
pub struct ApiClient {
    /// The underlying middleware-enabled client.
    inner: ClientWithMiddleware,
    /// The base URL to which all relative paths are joined.
    base_url: Url,
}

impl ApiClient {
    /// Creates a new `ApiClient`.
    ///
    /// # Errors
    /// Fails if `base_url` is not a valid absolute URL or the TLS backend
    /// cannot be initialized.
    pub fn new(base_url: &str, options: ApiClientOptions) -> anyhow::Result<Self> {
        let url = normalize_base(base_url)?;

        let http = reqwest::Client::builder()
            .timeout(options.timeout)
            .build()
            .context("failed to build HTTP client")?;

        let mut builder = ClientBuilder::new(http);
        if options.max_retries > 0 {
            let retry_policy =
                ExponentialBackoff::builder().build_with_max_retries(options.max_retries);
            builder = builder.with(RetryTransientMiddleware::new_with_policy(retry_policy));
        }

        Ok(Self {
            inner: builder.build(),
            base_url: url,
        })
    }

    /// The normalized base URL (always ends with `/`).
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Shorthand for a `GET` without body.
    pub async fn get<T>(&self, path: &str, query: &[(&str, String)]) -> anyhow::Result<ApiResponse<T>>
    where
        T: DeserializeOwned,
    {
        self.request::<T, ()>(Method::GET, path, query, None).await
    }

    /// Performs a generic HTTP request and handles the response.
    ///
    /// # Arguments
    /// * `method` - The HTTP verb (GET, POST, etc.).
    /// * `path` - The path relative to the base URL; a leading `/` is ignored.
    /// * `query` - Query string pairs.
    /// * `body` - Optional serializable object to send as the JSON body.
    ///
    /// # Errors
    /// Returns an `anyhow::Error` if URL joining, network execution or
    /// decoding of a successful body fails. Non-2xx statuses are not errors;
    /// they are reported through `ApiResponse::success`.
    pub async fn request<T, B>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<B>,
    ) -> anyhow::Result<ApiResponse<T>>
    where
        T: DeserializeOwned,
        B: Serialize,
    {
        let full_url = self.base_url.join(path.trim_start_matches('/'))?;
        let mut req = self.inner.request(method, full_url);

        if !query.is_empty() {
            req = req.query(query);
        }

        if let Some(b) = body {
            use reqwest::header::CONTENT_TYPE;
            let json_body = serde_json::to_string(&b)?;
            req = req.header(CONTENT_TYPE, "application/json").body(json_body);
        }

        let response: reqwest::Response = req.send().await?;
        let status = response.status();
        let resp_headers = response.headers().clone();

        if status.is_success() {
            let data = response.json::<T>().await?;
            Ok(ApiResponse {
                data: Some(data),
                error_body: None,
                status: status.as_u16(),
                success: true,
                headers: resp_headers,
            })
        } else {
            let error_text = response.text().await.ok();
            Ok(ApiResponse {
                data: None,
                error_body: error_text,
                status: status.as_u16(),
                success: false,
                headers: resp_headers,
            })
        }
    }
}

/// Parses `base` and makes sure relative joins append to its path instead of
/// replacing the last segment.
fn normalize_base(base: &str) -> anyhow::Result<Url> {
    let mut url = Url::parse(base.trim())
        .with_context(|| format!("invalid base URL '{}' (must be absolute)", base))?;
    if url.cannot_be_a_base() {
        anyhow::bail!("invalid base URL '{}' (cannot be a base)", base);
    }
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;

    /// Serves one canned HTTP response and hands back the request line.
    fn serve_once(status: &'static str, body: &'static str) -> (String, std::thread::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = format!("http://{}", listener.local_addr().unwrap());
        let handle = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 4096];
            let n = stream.read(&mut buf).unwrap();
            let request = String::from_utf8_lossy(&buf[..n]).to_string();
            let response = format!(
                "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status,
                body.len(),
                body
            );
            stream.write_all(response.as_bytes()).unwrap();
            request.lines().next().unwrap_or_default().to_string()
        });
        (addr, handle)
    }

    fn no_retry() -> ApiClientOptions {
        ApiClientOptions {
            timeout: Duration::from_secs(5),
            max_retries: 0,
        }
    }

    #[test]
    fn base_url_keeps_its_path() {
        let url = normalize_base("http://node.example:1317/api").unwrap();
        assert_eq!(url.as_str(), "http://node.example:1317/api/");
        assert_eq!(
            url.join("cosmos/staking").unwrap().as_str(),
            "http://node.example:1317/api/cosmos/staking"
        );
        assert!(normalize_base("not a url").is_err());
        assert!(ApiClient::new("mailto:someone", no_retry()).is_err());
    }

    #[tokio::test]
    async fn get_decodes_json_and_sends_query() {
        let (addr, server) = serve_once("200 OK", r#"{"value":7}"#);
        let client = ApiClient::new(&addr, no_retry()).unwrap();

        let resp: ApiResponse<serde_json::Value> = client
            .get("/validators", &[("page", "2".to_string())])
            .await
            .unwrap();
        assert!(resp.success);
        assert_eq!(resp.into_data().unwrap()["value"], 7);

        let request_line = server.join().unwrap();
        assert_eq!(request_line, "GET /validators?page=2 HTTP/1.1");
    }

    #[tokio::test]
    async fn non_success_status_is_reported_not_raised() {
        let (addr, server) = serve_once("503 Service Unavailable", "syncing");
        let client = ApiClient::new(&addr, no_retry()).unwrap();

        let resp: ApiResponse<serde_json::Value> = client.get("status", &[]).await.unwrap();
        assert!(!resp.success);
        assert_eq!(resp.status, 503);
        let err = resp.into_data().unwrap_err();
        assert_eq!(err.to_string(), "HTTP 503: syncing");
        server.join().unwrap();
    }
}
