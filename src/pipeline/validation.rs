//! Status-code validation stage

use async_trait::async_trait;

use super::ResponseProcessor;
use crate::endpoint::EndpointRequest;
use crate::error::{Error, Result};
use crate::http::{HttpResponse, WireRequest};

/// Rejects responses whose status falls outside the endpoint's acceptable range
///
/// An empty range (e.g. `0..0`) disables the check.
#[derive(Clone, Debug, Default)]
pub struct StatusValidation;

impl StatusValidation {
    /// Validate `response` against `acceptable`
    pub fn validate(
        response: HttpResponse,
        acceptable: &std::ops::Range<u16>,
    ) -> Result<HttpResponse> {
        if acceptable.is_empty() {
            return Ok(response);
        }
        let Some(code) = response.status else {
            return Err(Error::NoStatusCode);
        };
        if acceptable.contains(&code) {
            Ok(response)
        } else {
            Err(Error::UnacceptableStatusCode {
                code,
                acceptable: acceptable.clone(),
                response: Box::new(response),
            })
        }
    }
}

#[async_trait]
impl ResponseProcessor for StatusValidation {
    async fn process(
        &self,
        response: HttpResponse,
        _request: &WireRequest,
        ctx: &EndpointRequest,
    ) -> Result<HttpResponse> {
        Self::validate(response, &ctx.endpoint.acceptable_status)
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderMap;

    fn response(status: Option<u16>) -> HttpResponse {
        HttpResponse::new(status, HeaderMap::new(), "body")
    }

    #[test]
    fn status_inside_range_passes() {
        let ok = StatusValidation::validate(response(Some(204)), &(200..300)).unwrap();
        assert_eq!(ok.status, Some(204));
    }

    #[test]
    fn status_outside_range_fails_with_details() {
        let err = StatusValidation::validate(response(Some(404)), &(200..300)).unwrap_err();
        match err {
            Error::UnacceptableStatusCode {
                code,
                acceptable,
                response,
            } => {
                assert_eq!(code, 404);
                assert_eq!(acceptable, 200..300);
                assert_eq!(response.text(), Some("body"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn upper_bound_is_exclusive() {
        assert!(StatusValidation::validate(response(Some(300)), &(200..300)).is_err());
    }

    #[test]
    fn missing_status_fails() {
        assert!(matches!(
            StatusValidation::validate(response(None), &(200..300)),
            Err(Error::NoStatusCode)
        ));
    }

    #[test]
    fn empty_range_disables_check() {
        assert!(StatusValidation::validate(response(Some(500)), &(0..0)).is_ok());
        assert!(StatusValidation::validate(response(None), &(0..0)).is_ok());
    }
}
