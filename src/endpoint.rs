//! Endpoint descriptors and per-call context
//!
//! An [`Endpoint`] is an immutable description of one logical request: where
//! it goes, how its query and body are encoded, which status codes are
//! acceptable and whether it needs authorization. Application routers build
//! a fresh one per call site. The [`RequestBuilder`](crate::builder::RequestBuilder)
//! turns it into a [`WireRequest`](crate::http::WireRequest).

use bytes::Bytes;
use reqwest::Method;
use serde::Serialize;
use std::ops::Range;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::types::{EndpointIdentifier, RequestId, SessionId};

/// How an array query parameter is expanded
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ArrayEncoding {
    /// `key=1&key=2&key=3`
    #[default]
    Individual,
    /// `key=1,2,3`
    CommaSeparated,
}

/// Value of one query parameter
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum QueryValue {
    /// Single value, percent-encoded by the default rules
    Scalar(String),
    /// Several values for the same key
    Array {
        /// Values, each encoded by the default rules
        values: Vec<String>,
        /// Expansion mode
        encoding: ArrayEncoding,
    },
    /// Caller-encoded value inserted into the URL exactly as given
    PreEncoded(String),
}

impl QueryValue {
    /// Array parameter from anything displayable
    pub fn array<I, T>(values: I, encoding: ArrayEncoding) -> Self
    where
        I: IntoIterator<Item = T>,
        T: ToString,
    {
        QueryValue::Array {
            values: values.into_iter().map(|v| v.to_string()).collect(),
            encoding,
        }
    }

    /// Value that bypasses automatic encoding
    pub fn pre_encoded(value: impl Into<String>) -> Self {
        QueryValue::PreEncoded(value.into())
    }

    /// Default encoding with `+` escaped as `%2B`
    ///
    /// ```
    /// use wirekit::endpoint::QueryValue;
    ///
    /// let value = QueryValue::plus_encoded("2023-11-29T12:13:04.598+0100");
    /// assert_eq!(value, QueryValue::PreEncoded("2023-11-29T12:13:04.598%2B0100".into()));
    /// ```
    pub fn plus_encoded(raw: &str) -> Self {
        QueryValue::PreEncoded(crate::utils::encode_query_component_plus(raw))
    }
}

macro_rules! scalar_from {
    ($($t:ty),*) => {
        $(
            impl From<$t> for QueryValue {
                fn from(value: $t) -> Self {
                    QueryValue::Scalar(value.to_string())
                }
            }
        )*
    };
}

scalar_from!(&str, String, &String, i32, i64, u16, u32, u64, usize, bool, f64);

/// Request body strategy
#[derive(Clone, Debug, Default)]
pub enum Body {
    /// No body
    #[default]
    Empty,
    /// JSON document, sent with `Content-Type: application/json`
    Json(serde_json::Value),
    /// Pre-encoded bytes with an explicit content type
    Raw {
        /// Encoded body
        bytes: Bytes,
        /// Content-Type header value
        content_type: String,
    },
}

/// Immutable description of a logical request
#[derive(Clone, Debug)]
pub struct Endpoint {
    /// Scheme and host, optionally with a base path (e.g. `https://api.example.com/v1`)
    pub base_url: String,
    /// Path appended to the base URL
    pub path: String,
    /// HTTP method
    pub method: Method,
    /// Query parameters in insertion order; sorted by key when encoded
    pub query: Vec<(String, QueryValue)>,
    /// Extra headers
    pub headers: Vec<(String, String)>,
    /// Body strategy
    pub body: Body,
    /// Half-open range of acceptable status codes; an empty range disables validation
    pub acceptable_status: Range<u16>,
    /// Whether an `Authorization: Bearer` header must be attached
    pub requires_authorization: bool,
}

impl Endpoint {
    /// Create a descriptor with no query, headers or body
    pub fn new(method: Method, base_url: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            path: path.into(),
            method,
            query: Vec::new(),
            headers: Vec::new(),
            body: Body::Empty,
            acceptable_status: 200..300,
            requires_authorization: false,
        }
    }

    /// `GET` descriptor
    pub fn get(base_url: impl Into<String>, path: impl Into<String>) -> Self {
        Self::new(Method::GET, base_url, path)
    }

    /// `POST` descriptor
    pub fn post(base_url: impl Into<String>, path: impl Into<String>) -> Self {
        Self::new(Method::POST, base_url, path)
    }

    /// `PUT` descriptor
    pub fn put(base_url: impl Into<String>, path: impl Into<String>) -> Self {
        Self::new(Method::PUT, base_url, path)
    }

    /// `PATCH` descriptor
    pub fn patch(base_url: impl Into<String>, path: impl Into<String>) -> Self {
        Self::new(Method::PATCH, base_url, path)
    }

    /// `DELETE` descriptor
    pub fn delete(base_url: impl Into<String>, path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, base_url, path)
    }

    /// Add a query parameter
    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<QueryValue>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    /// Add a header
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Serialize `value` as the JSON body
    pub fn with_json<T: Serialize>(mut self, value: &T) -> Result<Self> {
        self.body = Body::Json(serde_json::to_value(value).map_err(Error::Encode)?);
        Ok(self)
    }

    /// Use pre-encoded bytes as the body
    pub fn with_raw_body(mut self, bytes: impl Into<Bytes>, content_type: impl Into<String>) -> Self {
        self.body = Body::Raw {
            bytes: bytes.into(),
            content_type: content_type.into(),
        };
        self
    }

    /// Replace the acceptable status range
    pub fn with_acceptable_status(mut self, range: Range<u16>) -> Self {
        self.acceptable_status = range;
        self
    }

    /// Disable status validation for this endpoint
    pub fn without_status_validation(mut self) -> Self {
        self.acceptable_status = 0..0;
        self
    }

    /// Require an `Authorization: Bearer` header
    pub fn authorized(mut self) -> Self {
        self.requires_authorization = true;
        self
    }

    /// Stable identity of this descriptor
    pub fn identifier(&self) -> Result<EndpointIdentifier> {
        crate::builder::RequestBuilder::build(self).map(|request| request.identifier())
    }
}

/// Call context for one logical request
///
/// Created once per call. Retries of that call reuse it, so the request id
/// correlates retry state across attempts.
#[derive(Clone, Debug)]
pub struct EndpointRequest {
    /// Process-unique id of this call
    pub id: RequestId,
    /// Session the call belongs to (debug-capture grouping)
    pub session: SessionId,
    /// Stable identity of the endpoint
    pub identifier: EndpointIdentifier,
    /// The descriptor being executed
    pub endpoint: Arc<Endpoint>,
}

impl EndpointRequest {
    /// Build the context, validating that the endpoint forms a URL
    pub fn new(endpoint: Endpoint, session: SessionId) -> Result<Self> {
        let identifier = endpoint.identifier()?;
        Ok(Self {
            id: RequestId::generate(&identifier),
            session,
            identifier,
            endpoint: Arc::new(endpoint),
        })
    }
}
