// HTTP session capability: base URL, persistent headers, cookie jar.
// Backed by reqwest; one session per scheduling unit.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Method};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Clone, thiserror::Error)]
pub enum HttpError {
    #[error("request timed out")]
    Timeout,

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("relative url '{0}' requires a base url on the session")]
    NoBaseUrl(String),

    #[error("invalid header '{0}'")]
    InvalidHeader(String),

    #[error("http error: {0}")]
    Other(String),

    #[error("request cancelled")]
    Cancelled,
}

/// Captured response, kept on the context for extract/assert blocks.
#[derive(Debug, Clone)]
pub struct HttpResponseData {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    /// Parsed JSON body, `Value::Null` when the body is not valid JSON.
    pub body: Value,
    pub body_text: String,
    pub duration_ms: u64,
}

/// Per-request options on top of the session state.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub headers: BTreeMap<String, String>,
    pub body: Option<Value>,
    pub query: Vec<(String, String)>,
}

// ============================================================================
// SESSION
// ============================================================================

/// HTTP capability owned by a scheduling unit. Headers and the cookie
/// jar persist across requests until the unit ends.
pub struct HttpSession {
    client: Client,
    base_url: Option<String>,
    headers: BTreeMap<String, String>,
    timeout: Duration,
}

impl HttpSession {
    pub fn new(timeout: Duration) -> Result<Self, HttpError> {
        let client = Client::builder()
            .cookie_store(true)
            .timeout(timeout)
            .build()
            .map_err(|e| HttpError::Other(e.to_string()))?;

        Ok(Self {
            client,
            base_url: None,
            headers: BTreeMap::new(),
            timeout,
        })
    }

    pub fn set_base_url(&mut self, base_url: impl Into<String>) {
        let mut url = base_url.into();
        while url.ends_with('/') {
            url.pop();
        }
        self.base_url = Some(url);
    }

    pub fn base_url(&self) -> Option<&str> {
        self.base_url.as_deref()
    }

    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(name.into(), value.into());
    }

    pub fn remove_header(&mut self, name: &str) {
        self.headers.remove(name);
    }

    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    /// Joins a possibly-relative target onto the session base URL and
    /// appends encoded query pairs.
    pub fn build_url(&self, target: &str, query: &[(String, String)]) -> Result<String, HttpError> {
        let mut url = if target.starts_with("http://") || target.starts_with("https://") {
            target.to_string()
        } else {
            let base = self
                .base_url
                .as_deref()
                .ok_or_else(|| HttpError::NoBaseUrl(target.to_string()))?;
            if target.starts_with('/') {
                format!("{base}{target}")
            } else {
                format!("{base}/{target}")
            }
        };

        for (i, (key, value)) in query.iter().enumerate() {
            let sep = if i == 0 && !url.contains('?') { '?' } else { '&' };
            url.push(sep);
            url.push_str(&urlencoding::encode(key));
            url.push('=');
            url.push_str(&urlencoding::encode(value));
        }

        Ok(url)
    }

    /// Sends one request, observing the cancel signal. Session headers
    /// apply first and per-request headers override them.
    pub async fn request(
        &self,
        method: Method,
        target: &str,
        options: RequestOptions,
        cancel: &CancellationToken,
    ) -> Result<HttpResponseData, HttpError> {
        let url = self.build_url(target, &options.query)?;

        let mut header_map = HeaderMap::new();
        for (name, value) in self.headers.iter().chain(options.headers.iter()) {
            let header_name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| HttpError::InvalidHeader(name.clone()))?;
            let header_value = HeaderValue::from_str(value)
                .map_err(|_| HttpError::InvalidHeader(name.clone()))?;
            header_map.insert(header_name, header_value);
        }

        let mut request = self
            .client
            .request(method.clone(), &url)
            .headers(header_map)
            .timeout(self.timeout);
        if let Some(body) = &options.body {
            request = request.json(body);
        }

        debug!(method = %method, url = %url, "sending http request");
        let started = Instant::now();

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(HttpError::Cancelled),
            result = request.send() => result.map_err(classify_reqwest_error)?,
        };

        let status = response.status().as_u16();
        let mut headers = BTreeMap::new();
        for (name, value) in response.headers() {
            if let Ok(text) = value.to_str() {
                headers.insert(name.as_str().to_string(), text.to_string());
            }
        }

        let body_text = tokio::select! {
            _ = cancel.cancelled() => return Err(HttpError::Cancelled),
            result = response.text() => result.map_err(classify_reqwest_error)?,
        };
        let body = serde_json::from_str(&body_text).unwrap_or(Value::Null);

        let duration_ms = started.elapsed().as_millis() as u64;
        debug!(status = status, duration_ms = duration_ms, "http response received");

        Ok(HttpResponseData {
            status,
            headers,
            body,
            body_text,
            duration_ms,
        })
    }
}

fn classify_reqwest_error(error: reqwest::Error) -> HttpError {
    if error.is_timeout() {
        HttpError::Timeout
    } else if error.is_connect() {
        HttpError::Connect(error.to_string())
    } else {
        HttpError::Other(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> HttpSession {
        HttpSession::new(Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn absolute_url_passes_through() {
        let session = session();
        let url = session.build_url("https://api.example.com/users", &[]).unwrap();
        assert_eq!(url, "https://api.example.com/users");
    }

    #[test]
    fn relative_url_joins_base() {
        let mut session = session();
        session.set_base_url("https://api.example.com/");
        assert_eq!(
            session.build_url("/users", &[]).unwrap(),
            "https://api.example.com/users"
        );
        assert_eq!(
            session.build_url("users", &[]).unwrap(),
            "https://api.example.com/users"
        );
    }

    #[test]
    fn relative_url_without_base_is_an_error() {
        let session = session();
        assert!(matches!(
            session.build_url("/users", &[]),
            Err(HttpError::NoBaseUrl(_))
        ));
    }

    #[test]
    fn query_pairs_are_encoded() {
        let mut session = session();
        session.set_base_url("https://api.example.com");
        let url = session
            .build_url(
                "/search",
                &[("q".to_string(), "a b".to_string()), ("page".to_string(), "2".to_string())],
            )
            .unwrap();
        assert_eq!(url, "https://api.example.com/search?q=a%20b&page=2");
    }

    #[test]
    fn headers_persist_and_unset() {
        let mut session = session();
        session.set_header("Authorization", "Bearer t");
        session.set_header("X-Env", "staging");
        session.remove_header("X-Env");

        assert_eq!(
            session.headers().get("Authorization").map(String::as_str),
            Some("Bearer t")
        );
        assert!(!session.headers().contains_key("X-Env"));
    }
}
