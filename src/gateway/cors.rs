use axum::http::{HeaderName, HeaderValue, Method};
use tower_http::cors::{AllowHeaders, AllowOrigin, CorsLayer};

use crate::config::HttpSettings;
use crate::error::{Error, Result};

const ALLOWED_METHODS: [Method; 6] = [
    Method::GET,
    Method::POST,
    Method::HEAD,
    Method::PATCH,
    Method::DELETE,
    Method::PUT,
];

/// Builds the gateway's CORS policy.
///
/// Credentials are always allowed. Since a wildcard cannot be combined with
/// credentials, `*` mirrors whatever the request asks for.
///
/// # Errors
/// Returns [`Error::Config`] for an origin or header that is not a valid header value.
pub fn layer(settings: &HttpSettings) -> Result<CorsLayer> {
    let origins = if settings.cors_allowed_origins.iter().any(|o| o == "*") {
        AllowOrigin::mirror_request()
    } else {
        let origins = settings
            .cors_allowed_origins
            .iter()
            .map(|o| {
                HeaderValue::from_str(o)
                    .map_err(|e| Error::Config(format!("invalid cors origin {o:?}: {e}")))
            })
            .collect::<Result<Vec<_>>>()?;
        AllowOrigin::list(origins)
    };

    let headers = if settings.cors_allowed_headers.iter().any(|h| h == "*") {
        AllowHeaders::mirror_request()
    } else {
        let headers = settings
            .cors_allowed_headers
            .iter()
            .map(|h| {
                HeaderName::from_bytes(h.as_bytes())
                    .map_err(|e| Error::Config(format!("invalid cors header {h:?}: {e}")))
            })
            .collect::<Result<Vec<_>>>()?;
        AllowHeaders::list(headers)
    };

    Ok(CorsLayer::new()
        .allow_credentials(true)
        .allow_methods(ALLOWED_METHODS.to_vec())
        .allow_origin(origins)
        .allow_headers(headers))
}
