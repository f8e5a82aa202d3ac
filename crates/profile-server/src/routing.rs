//! Case-insensitive routing.
//!
//! Requests are canonicalized before they reach the router: the URI is
//! lowercased, so `/PROFILES/{id}`, `/Profiles/{id}` and `/profiles/{id}`
//! dispatch identically. Handlers can still see the original URI through
//! the [`RequestPath`] extension.

use axum::extract::Request;
use axum::http::Uri;
use axum::middleware::Next;
use axum::response::Response;
use std::time::Instant;
use tracing::{debug, info};

/// Canonical and original forms of the request URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestPath {
    /// Lowercased URI used for dispatch and `Location` headers.
    pub canonical: Uri,
    /// URI as sent by the client.
    pub original: Uri,
}

impl RequestPath {
    /// Build both forms from a client URI.
    #[must_use]
    pub fn new(original: Uri) -> Self {
        let canonical = canonicalize(&original);
        Self {
            canonical,
            original,
        }
    }
}

/// Lowercase a URI. A URI that cannot be re-parsed is kept as is.
#[must_use]
pub fn canonicalize(uri: &Uri) -> Uri {
    let lowered = uri.to_string().to_lowercase();
    if lowered == uri.to_string() {
        return uri.clone();
    }
    lowered.parse().unwrap_or_else(|_| uri.clone())
}

/// Middleware: rewrite the URI to its canonical form and log the request.
pub async fn canonical_paths(mut request: Request, next: Next) -> Response {
    let path = RequestPath::new(request.uri().clone());
    let method = request.method().clone();
    let started = Instant::now();

    info!(
        method = %method,
        path = %path.canonical.path(),
        uri = %path.original,
        "Request"
    );

    *request.uri_mut() = path.canonical.clone();
    request.extensions_mut().insert(path.clone());

    let response = next.run(request).await;

    debug!(
        method = %method,
        path = %path.canonical.path(),
        status = response.status().as_u16(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Response"
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonicalize_lowercases_path_and_query() {
        let uri: Uri = "/Profiles/ABC?Sort=Email".parse().unwrap();
        assert_eq!(canonicalize(&uri), "/profiles/abc?sort=email");
    }

    #[test]
    fn test_canonical_uri_is_unchanged() {
        let uri: Uri = "/profiles".parse().unwrap();
        assert_eq!(canonicalize(&uri), uri);
    }

    #[test]
    fn test_request_path_keeps_original() {
        let path = RequestPath::new("/PROFILES".parse().unwrap());
        assert_eq!(path.canonical.path(), "/profiles");
        assert_eq!(path.original.path(), "/PROFILES");
    }
}
