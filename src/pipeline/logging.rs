//! Logging stage backed by `tracing`
//!
//! Pure side effect: requests and responses pass through unchanged. The
//! `Authorization` header value is redacted in the log output only.

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, HeaderMap};

use super::{RequestAdapter, ResponseProcessor};
use crate::endpoint::EndpointRequest;
use crate::error::{Error, Result};
use crate::http::{HttpResponse, WireRequest};

/// Logs requests before send and outcomes after processing
#[derive(Clone, Debug, Default)]
pub struct LoggingStage;

#[async_trait]
impl RequestAdapter for LoggingStage {
    async fn adapt(&self, request: WireRequest, ctx: &EndpointRequest) -> Result<WireRequest> {
        tracing::debug!(
            target: "wirekit::http",
            request_id = %ctx.id,
            method = %request.method,
            url = %request.url,
            headers = %format_headers(&request.headers),
            body = %pretty_body(request.body.as_deref()),
            "sending request"
        );
        Ok(request)
    }
}

#[async_trait]
impl ResponseProcessor for LoggingStage {
    async fn process(
        &self,
        response: HttpResponse,
        request: &WireRequest,
        ctx: &EndpointRequest,
    ) -> Result<HttpResponse> {
        tracing::debug!(
            target: "wirekit::http",
            request_id = %ctx.id,
            method = %request.method,
            url = %request.url,
            status = ?response.status,
            headers = %format_headers(&response.headers),
            body = %pretty_body(Some(&response.body)),
            "response received"
        );
        Ok(response)
    }

    async fn process_error(
        &self,
        error: Error,
        request: &WireRequest,
        ctx: &EndpointRequest,
    ) -> Error {
        tracing::debug!(
            target: "wirekit::http",
            request_id = %ctx.id,
            endpoint = %ctx.identifier,
            url = %request.url,
            status = ?error.status_code(),
            error = %error,
            "request failed"
        );
        error
    }
}

fn format_headers(headers: &HeaderMap) -> String {
    headers
        .iter()
        .map(|(name, value)| {
            if name == AUTHORIZATION {
                format!("{name}: <redacted>")
            } else {
                format!("{name}: {}", value.to_str().unwrap_or("<binary>"))
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// Pretty-printed JSON when the body parses, raw text or a byte count otherwise
fn pretty_body(body: Option<&[u8]>) -> String {
    let Some(body) = body.filter(|b| !b.is_empty()) else {
        return "<empty>".to_string();
    };
    if let Ok(value) = serde_json::from_slice::<serde_json::Value>(body)
        && let Ok(pretty) = serde_json::to_string_pretty(&value)
    {
        return pretty;
    }
    match std::str::from_utf8(body) {
        Ok(text) => text.to_string(),
        Err(_) => format!("<{} bytes>", body.len()),
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::RequestBuilder;
    use crate::endpoint::Endpoint;
    use crate::types::SessionId;
    use reqwest::header::HeaderValue;

    #[tokio::test]
    async fn logging_leaves_request_and_response_untouched() {
        let endpoint = Endpoint::post("https://api.example.com", "/users")
            .with_json(&serde_json::json!({"name": "ada"}))
            .unwrap();
        let request = RequestBuilder::build(&endpoint)
            .unwrap()
            .with_header("Authorization", "Bearer secret")
            .unwrap();
        let ctx = EndpointRequest::new(endpoint, SessionId("s".into())).unwrap();

        let adapted = LoggingStage.adapt(request.clone(), &ctx).await.unwrap();
        assert_eq!(adapted.url, request.url);
        assert_eq!(adapted.headers, request.headers);
        assert_eq!(adapted.body, request.body);

        let response = HttpResponse::json(201, &serde_json::json!({"id": 1}));
        let processed = LoggingStage
            .process(response.clone(), &request, &ctx)
            .await
            .unwrap();
        assert_eq!(processed.status, Some(201));
        assert_eq!(processed.body, response.body);
    }

    #[test]
    fn authorization_is_redacted() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer secret"));
        headers.insert("x-trace", HeaderValue::from_static("42"));
        let formatted = format_headers(&headers);
        assert!(formatted.contains("authorization: <redacted>"));
        assert!(formatted.contains("x-trace: 42"));
        assert!(!formatted.contains("secret"));
    }

    #[test]
    fn body_formatting() {
        assert_eq!(pretty_body(None), "<empty>");
        assert_eq!(pretty_body(Some(b"{\"a\":1}")), "{\n  \"a\": 1\n}");
        assert_eq!(pretty_body(Some(b"plain")), "plain");
        assert_eq!(pretty_body(Some(&[0xff, 0xfe])), "<2 bytes>");
    }
}
