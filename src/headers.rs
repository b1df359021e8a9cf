//! Header propagation policy.
//!
//! Headers are copied in arrival order by appending to the destination, so
//! repeated fields and their relative order survive the hop. The excluded set
//! is the RFC 7230 hop-by-hop list, plus configured extras, plus any field
//! named by the message's own `Connection` header.

use hyper::HeaderMap;
use hyper::header::{self, HeaderName, HeaderValue};
use std::collections::HashSet;

/// Standard HTTP/1.1 hop-by-hop headers, never forwarded in either direction.
pub static HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

// Not in the RFC list but only meaningful between a client and the proxy in front of it
static PROXY_CONNECTION: HeaderName = HeaderName::from_static("proxy-connection");

#[derive(Debug, Clone)]
pub struct HeaderFilter {
    excluded: HashSet<HeaderName>,
}

impl Default for HeaderFilter {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl HeaderFilter {
    pub fn new(extra: Vec<HeaderName>) -> Self {
        let mut excluded: HashSet<HeaderName> = HOP_BY_HOP.iter().cloned().collect();
        excluded.insert(PROXY_CONNECTION.clone());
        excluded.extend(extra);
        Self { excluded }
    }

    pub fn is_excluded(&self, name: &HeaderName) -> bool {
        self.excluded.contains(name)
    }

    /// Inbound request headers → outbound request.
    ///
    /// `Host` is only carried over when `preserve_host` is set; otherwise the
    /// request builder sets it from the rewritten URI.
    pub fn copy_request_headers(&self, src: &HeaderMap, dst: &mut HeaderMap, preserve_host: bool) {
        let listed = connection_tokens(src);
        let chunked = src.contains_key(header::TRANSFER_ENCODING);
        for (name, value) in src.iter() {
            if self.is_excluded(name) || listed.contains(name) {
                continue;
            }
            if name == header::HOST && !preserve_host {
                continue;
            }
            // A chunked message length wins over Content-Length (RFC 7230 §3.3.3)
            if name == header::CONTENT_LENGTH && chunked {
                continue;
            }
            dst.append(name.clone(), value.clone());
        }
    }

    /// Upstream response headers, handed to `set` one field at a time.
    pub fn copy_response_headers<F>(&self, src: &HeaderMap, mut set: F)
    where
        F: FnMut(HeaderName, HeaderValue),
    {
        let listed = connection_tokens(src);
        for (name, value) in src.iter() {
            if self.is_excluded(name) || listed.contains(name) {
                continue;
            }
            set(name.clone(), value.clone());
        }
    }
}

/// Field names listed as options of the `Connection` header.
fn connection_tokens(headers: &HeaderMap) -> HashSet<HeaderName> {
    headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|token| HeaderName::from_bytes(token.trim().as_bytes()).ok())
        .collect()
}
