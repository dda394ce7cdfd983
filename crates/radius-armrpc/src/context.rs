//! Per-request context extracted before any controller runs.

use axum::http::{HeaderMap, header};
use radius_resource::{ErrorCode, ErrorDetail, ResourceId};
use radius_store::Etag;

use crate::rest::CORRELATION_ID;

/// Everything a front-end controller needs to know about the request that is
/// not the body: the parsed ID, the API version, preconditions and caller
/// identity.
#[derive(Clone, Debug)]
pub struct RequestContext {
    pub resource_id: ResourceId,
    pub api_version: String,
    pub if_match: Option<Etag>,
    /// `If-None-Match: *`: the write must create the resource.
    pub if_none_match_any: bool,
    pub correlation_id: Option<String>,
    /// Caller identity as asserted by the fronting authenticator. UCP trusts
    /// the gateway; `anonymous` when the header is absent.
    pub client_identity: String,
}

impl RequestContext {
    pub fn new(
        resource_id: ResourceId,
        api_version: Option<&str>,
        headers: &HeaderMap,
    ) -> Result<Self, ErrorDetail> {
        let api_version = api_version
            .filter(|version| !version.is_empty())
            .ok_or_else(|| {
                ErrorDetail::new(ErrorCode::Invalid, "the api-version query parameter is required")
            })?;

        let if_match = headers
            .get(header::IF_MATCH)
            .and_then(|value| value.to_str().ok())
            .filter(|value| *value != "*")
            .map(|value| Etag::new(value.trim_matches('"')));

        let if_none_match_any = headers
            .get(header::IF_NONE_MATCH)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value == "*");

        let correlation_id = headers
            .get(&CORRELATION_ID)
            .and_then(|value| value.to_str().ok())
            .map(ToOwned::to_owned);

        let client_identity = headers
            .get("x-ms-client-principal-name")
            .and_then(|value| value.to_str().ok())
            .unwrap_or("anonymous")
            .to_owned();

        Ok(Self {
            resource_id,
            api_version: api_version.to_owned(),
            if_match,
            if_none_match_any,
            correlation_id,
            client_identity,
        })
    }
}
