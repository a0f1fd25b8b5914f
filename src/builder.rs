//! Request builder
//!
//! Turns an [`Endpoint`] into a [`WireRequest`]. URL assembly is
//! deterministic: query items are sorted by key (stable, so array values keep
//! their order) which makes identical logical calls produce byte-identical
//! URLs and therefore identical [`EndpointIdentifier`](crate::types::EndpointIdentifier)s.

use reqwest::header::{CONTENT_TYPE, HeaderName, HeaderValue};
use url::Url;

use crate::endpoint::{ArrayEncoding, Body, Endpoint, QueryValue};
use crate::error::{Error, Result};
use crate::http::WireRequest;
use crate::utils::encode_query_component;

/// Stateless builder from descriptors to wire requests
pub struct RequestBuilder;

impl RequestBuilder {
    /// Build the wire request for `endpoint`
    ///
    /// Fails with [`Error::InvalidUrlComponents`] if base URL, path and query do
    /// not form a valid absolute URL, or if a header cannot be represented.
    pub fn build(endpoint: &Endpoint) -> Result<WireRequest> {
        let url = Self::build_url(endpoint)?;
        let mut request = WireRequest::new(endpoint.method.clone(), url);

        for (name, value) in &endpoint.headers {
            let header_name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
                Error::InvalidUrlComponents(format!("invalid header name '{name}': {e}"))
            })?;
            let header_value = HeaderValue::from_str(value).map_err(|e| {
                Error::InvalidUrlComponents(format!("invalid value for header '{name}': {e}"))
            })?;
            request.headers.append(header_name, header_value);
        }

        match &endpoint.body {
            Body::Empty => {}
            Body::Json(value) => {
                let bytes = serde_json::to_vec(value).map_err(Error::Encode)?;
                if !request.headers.contains_key(CONTENT_TYPE) {
                    request
                        .headers
                        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
                }
                request.body = Some(bytes.into());
            }
            Body::Raw {
                bytes,
                content_type,
            } => {
                let value = HeaderValue::from_str(content_type).map_err(|e| {
                    Error::InvalidUrlComponents(format!("invalid content type '{content_type}': {e}"))
                })?;
                request.headers.insert(CONTENT_TYPE, value);
                request.body = Some(bytes.clone());
            }
        }

        Ok(request)
    }

    /// Assemble and validate the absolute URL
    pub fn build_url(endpoint: &Endpoint) -> Result<Url> {
        let raw = join_base_and_path(&endpoint.base_url, &endpoint.path);
        let mut url = Url::parse(&raw)
            .map_err(|e| Error::InvalidUrlComponents(format!("'{raw}': {e}")))?;

        if url.cannot_be_a_base() || url.host().is_none() {
            return Err(Error::InvalidUrlComponents(format!(
                "'{raw}' is not an absolute URL with a host"
            )));
        }

        let query = encode_query(&endpoint.query);
        if !query.is_empty() {
            let combined = match url.query() {
                Some(existing) if !existing.is_empty() => format!("{existing}&{query}"),
                _ => query,
            };
            url.set_query(Some(&combined));
        }

        Ok(url)
    }
}

/// Encode query items sorted by key
///
/// ```
/// use wirekit::builder::encode_query;
/// use wirekit::endpoint::{ArrayEncoding, QueryValue};
///
/// let items = vec![
///     ("filter".to_string(), QueryValue::array([1, 2, 3], ArrayEncoding::CommaSeparated)),
///     ("a".to_string(), QueryValue::from("x y")),
/// ];
/// assert_eq!(encode_query(&items), "a=x%20y&filter=1,2,3");
/// ```
pub fn encode_query(items: &[(String, QueryValue)]) -> String {
    let mut sorted: Vec<&(String, QueryValue)> = items.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(&b.0));

    let mut parts = Vec::with_capacity(sorted.len());
    for (key, value) in sorted {
        let key = encode_query_component(key);
        match value {
            QueryValue::Scalar(v) => parts.push(format!("{key}={}", encode_query_component(v))),
            QueryValue::PreEncoded(v) => parts.push(format!("{key}={v}")),
            QueryValue::Array {
                values,
                encoding: ArrayEncoding::Individual,
            } => {
                for v in values {
                    parts.push(format!("{key}={}", encode_query_component(v)));
                }
            }
            QueryValue::Array {
                values,
                encoding: ArrayEncoding::CommaSeparated,
            } => {
                let joined = values
                    .iter()
                    .map(|v| encode_query_component(v))
                    .collect::<Vec<_>>()
                    .join(",");
                parts.push(format!("{key}={joined}"));
            }
        }
    }
    parts.join("&")
}

fn join_base_and_path(base: &str, path: &str) -> String {
    if path.is_empty() {
        return base.to_string();
    }
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}
