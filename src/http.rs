//! Wire-level request and response values
//!
//! A [`WireRequest`] is what a transport sends; an [`HttpResponse`] is what it
//! hands back. Both are plain data. Pipeline stages never mutate them in
//! place: each stage consumes a value and returns a new one.

use bytes::Bytes;
use reqwest::Method;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::de::DeserializeOwned;
use url::Url;

use crate::error::{Error, Result};

/// A concrete, transport-ready request
#[derive(Debug, Clone)]
pub struct WireRequest {
    /// HTTP method
    pub method: Method,
    /// Absolute URL, query included
    pub url: Url,
    /// Request headers
    pub headers: HeaderMap,
    /// Encoded body, if any
    pub body: Option<Bytes>,
}

impl WireRequest {
    /// Create a request without headers or body
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: None,
        }
    }

    /// Return a copy of this request with `name` set to `value`
    ///
    /// Invalid header names or values surface as [`Error::Transport`].
    pub fn with_header(mut self, name: &str, value: &str) -> Result<Self> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| Error::Transport(format!("invalid header name '{name}': {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| Error::Transport(format!("invalid header value for '{name}': {e}")))?;
        self.headers.insert(name, value);
        Ok(self)
    }

    /// Return a copy of this request with the given body
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Query items in URL order
    pub fn query_pairs(&self) -> Vec<(String, String)> {
        self.url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect()
    }

    /// Stable identity of this request (method, path and query)
    pub fn identifier(&self) -> crate::types::EndpointIdentifier {
        crate::types::EndpointIdentifier::new(
            self.method.as_str(),
            self.url.path(),
            self.url.query(),
        )
    }
}

/// A response as seen by the pipeline
///
/// `status` is `None` when the transport produced something that is not an
/// HTTP response; the status-validation stage turns that into
/// [`Error::NoStatusCode`].
#[derive(Debug, Clone)]
pub struct HttpResponse {
    /// HTTP status code
    pub status: Option<u16>,
    /// Response headers
    pub headers: HeaderMap,
    /// Response body bytes
    pub body: Bytes,
}

impl HttpResponse {
    /// Create a response
    pub fn new(status: Option<u16>, headers: HeaderMap, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers,
            body: body.into(),
        }
    }

    /// Convenience constructor for a JSON response with the given status
    pub fn json(status: u16, value: &serde_json::Value) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(
            reqwest::header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        Self::new(Some(status), headers, value.to_string())
    }

    /// Decode the body as JSON
    ///
    /// Decode failures surface as [`Error::Decode`], never as transport errors.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body).map_err(Error::Decode)
    }

    /// Body as UTF-8 text, when it is valid UTF-8
    pub fn text(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn with_header_returns_new_value() {
        let url = Url::parse("https://example.com/a").unwrap();
        let original = WireRequest::new(Method::GET, url);
        let adapted = original
            .clone()
            .with_header("Authorization", "Bearer abc")
            .unwrap();

        assert!(original.headers.is_empty());
        assert_eq!(adapted.headers["authorization"], "Bearer abc");
    }

    #[test]
    fn invalid_header_value_is_rejected() {
        let url = Url::parse("https://example.com/a").unwrap();
        let result = WireRequest::new(Method::GET, url).with_header("X-Test", "bad\nvalue");
        assert!(matches!(result, Err(Error::Transport(_))));
    }

    #[test]
    fn decode_failure_is_a_decode_error() {
        let response = HttpResponse::new(Some(200), HeaderMap::new(), "not json");
        let result: Result<serde_json::Value> = response.decode();
        assert!(matches!(result, Err(Error::Decode(_))));
    }
}
