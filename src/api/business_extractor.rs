use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{request::Parts, HeaderMap, StatusCode},
    Json,
};

use crate::api::ErrorResponse;
use crate::model::Id;

pub const BUSINESS_HEADER: &str = "x-business-id";

/// Business every request operates in, taken from the `X-Business-Id` header.
///
/// A missing, malformed or non-positive id rejects the request with 400
/// before any handler runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusinessScope(pub Id);

#[async_trait]
impl<S> FromRequestParts<S> for BusinessScope
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, Json<ErrorResponse>);

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        business_id_from_headers(&parts.headers)
            .map(BusinessScope)
            .map_err(|message| (StatusCode::BAD_REQUEST, Json(ErrorResponse::new(&message))))
    }
}

fn business_id_from_headers(headers: &HeaderMap) -> Result<Id, String> {
    let raw = headers
        .get(BUSINESS_HEADER)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| "missing X-Business-Id header".to_string())?;
    match raw.trim().parse::<Id>() {
        Ok(id) if id > 0 => Ok(id),
        _ => Err(format!("invalid business id: {}", raw)),
    }
}
