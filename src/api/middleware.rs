//! Middleware Components
//!
//! CORS, request tracking, caller identity and service-key checks.

use super::errors::ApiError;
use axum::{
    async_trait,
    extract::{FromRequestParts, Request},
    http::{request::Parts, HeaderMap, HeaderName, HeaderValue},
    middleware::Next,
    response::Response,
};
use tower_http::cors::{Any, CorsLayer, ExposeHeaders};
use uuid::Uuid;

/// Request ID header key
pub const REQUEST_ID_HEADER: &str = "x-request-id";
/// Authenticated user id injected by the upstream auth layer
pub const USER_ID_HEADER: &str = "x-user-id";
/// Shared secret presented by the casino provider and the match engine
pub const API_KEY_HEADER: &str = "x-api-key";

/// Create CORS middleware with configurable origins
pub fn create_cors_layer(allowed_origins: Vec<String>) -> CorsLayer {
    let expose = ExposeHeaders::list([HeaderName::from_static(REQUEST_ID_HEADER)]);
    if allowed_origins.is_empty() || allowed_origins.contains(&"*".to_string()) {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
            .expose_headers(expose)
    } else {
        CorsLayer::new()
            .allow_origin(
                allowed_origins
                    .into_iter()
                    .filter_map(|o| o.parse().ok())
                    .collect::<Vec<_>>(),
            )
            .allow_methods([axum::http::Method::GET, axum::http::Method::POST])
            .allow_headers(Any)
            .expose_headers(expose)
    }
}

/// Middleware to add request ID to all requests
pub async fn request_id_middleware(mut request: Request, next: Next) -> Response {
    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    request.extensions_mut().insert(RequestId(request_id.clone()));

    let mut response = next.run(request).await;

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }

    response
}

/// Request ID wrapper for extracting in handlers
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

fn request_id_of(parts: &Parts) -> String {
    parts
        .extensions
        .get::<RequestId>()
        .map(|r| r.0.clone())
        .unwrap_or_default()
}

/// Caller identity taken from the `x-user-id` header
#[derive(Debug, Clone)]
pub struct CallerId(pub String);

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for CallerId {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        match parts.headers.get(USER_ID_HEADER).and_then(|v| v.to_str().ok()) {
            Some(user) if !user.is_empty() => Ok(CallerId(user.to_string())),
            _ => Err(ApiError::unauthorized(
                request_id_of(&parts),
                format!("missing {} header", USER_ID_HEADER),
            )),
        }
    }
}

/// Check the service key when one is configured
pub fn validate_api_key(expected: Option<&str>, headers: &HeaderMap, request_id: &str) -> Result<(), ApiError> {
    let Some(expected) = expected else {
        return Ok(());
    };
    let provided = headers.get(API_KEY_HEADER).and_then(|v| v.to_str().ok());
    if provided == Some(expected) {
        Ok(())
    } else {
        Err(ApiError::unauthorized(
            request_id.to_string(),
            "invalid or missing API key".to_string(),
        ))
    }
}
