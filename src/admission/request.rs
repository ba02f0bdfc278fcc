//! Request descriptors and client key extraction.

use std::net::SocketAddr;
use std::sync::Arc;

/// Sentinel key used when no client identity can be derived from a request.
pub const UNKNOWN_KEY: &str = "unknown";

/// The slice of an inbound HTTP request the admission controller looks at.
///
/// The serving layer builds one of these per request; the controller never
/// touches the request body or any framework-specific type.
#[derive(Debug, Clone, Default)]
pub struct RequestInfo {
    /// Peer socket address, when the transport knows it
    pub remote_addr: Option<SocketAddr>,
    /// Raw `X-Forwarded-For` header value, when present
    pub forwarded_for: Option<String>,
    /// Request path, for skip predicates that exempt routes
    pub path: Option<String>,
}

impl RequestInfo {
    /// Create an empty descriptor.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a descriptor for a request from the given peer address.
    pub fn from_addr(addr: SocketAddr) -> Self {
        Self {
            remote_addr: Some(addr),
            ..Self::default()
        }
    }

    /// Set the forwarded-for header value.
    pub fn with_forwarded_for(mut self, value: impl Into<String>) -> Self {
        self.forwarded_for = Some(value.into());
        self
    }

    /// Set the request path.
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }
}

/// Derives a stable identity string from a request. Returning `None` (or an
/// empty string) makes the controller fall back to [`UNKNOWN_KEY`].
pub type KeyExtractor = Arc<dyn Fn(&RequestInfo) -> Option<String> + Send + Sync>;

/// When this returns `true` the request bypasses limiting entirely.
pub type SkipPredicate = Arc<dyn Fn(&RequestInfo) -> bool + Send + Sync>;

/// Default identity: peer IP, else the first hop of `X-Forwarded-For`.
pub fn default_key_extractor() -> KeyExtractor {
    Arc::new(|request: &RequestInfo| {
        if let Some(addr) = request.remote_addr {
            return Some(addr.ip().to_string());
        }
        request
            .forwarded_for
            .as_deref()
            .and_then(|header| header.split(',').next())
            .map(str::trim)
            .filter(|hop| !hop.is_empty())
            .map(str::to_string)
    })
}
