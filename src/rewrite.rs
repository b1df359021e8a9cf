use crate::error::ProxyError;
use hyper::Uri;
use hyper::header::HOST;
use hyper::http::request::Parts;
use hyper::http::uri::{Authority, Scheme};
use std::net::{IpAddr, SocketAddr};
use url::Url;

/// Maps an inbound request head to the upstream URI it should be sent to.
///
/// Implemented by the two built-in policies and by any
/// `Fn(&Parts) -> Result<Uri, ProxyError>` closure.
pub trait UriRewrite: Send + Sync {
    fn rewrite(&self, head: &Parts) -> Result<Uri, ProxyError>;
}

impl<F> UriRewrite for F
where
    F: Fn(&Parts) -> Result<Uri, ProxyError> + Send + Sync,
{
    fn rewrite(&self, head: &Parts) -> Result<Uri, ProxyError> {
        self(head)
    }
}

/// Prefix substitution against one statically configured upstream (reverse proxy).
#[derive(Debug, Clone)]
pub struct FixedTargetRewrite {
    target_url: Url,
    forward_path: bool,
}

impl FixedTargetRewrite {
    pub fn new(target_url: &str) -> Result<Self, ProxyError> {
        let url = Url::parse(target_url)?;
        if !url.has_host() {
            return Err(ProxyError::Config(format!("Target URL has no host: {}", target_url)));
        }
        Ok(Self {
            target_url: url,
            forward_path: true,
        })
    }

    /// When disabled, the request path is suppressed and only the query string is carried over.
    pub fn with_forward_path(mut self, forward_path: bool) -> Self {
        self.forward_path = forward_path;
        self
    }
}

impl UriRewrite for FixedTargetRewrite {
    fn rewrite(&self, head: &Parts) -> Result<Uri, ProxyError> {
        let base = self.target_url.as_str().trim_end_matches('/');
        let path = if self.forward_path { head.uri.path() } else { "" };
        let mut target = format!("{}{}", base, path);
        // Bare origin with nothing forwarded: the request target still needs a path
        if path.is_empty() && self.target_url.path() == "/" {
            target.push('/');
        }
        if let Some(query) = head.uri.query() {
            target.push('?');
            target.push_str(query);
        }
        target
            .parse()
            .map_err(|e: hyper::http::uri::InvalidUri| ProxyError::Rewrite(format!("{}: {}", target, e)))
    }
}

/// Derives the upstream from the request itself (forward proxy).
///
/// Resolution order: absolute-form request URI, then the configured default
/// origin, then the `Host` header. Path and query are always forwarded as received.
#[derive(Debug, Clone, Default)]
pub struct DynamicRewrite {
    default_origin: Option<(Scheme, Authority)>,
    listen_addr: Option<SocketAddr>,
}

impl DynamicRewrite {
    pub fn new() -> Self {
        Self::default()
    }

    /// Origin used for origin-form requests, e.g. `http://localhost:80`.
    pub fn with_default_origin(origin: &str) -> Result<Self, ProxyError> {
        let uri: Uri = origin
            .parse()
            .map_err(|e: hyper::http::uri::InvalidUri| ProxyError::Config(format!("Invalid origin {}: {}", origin, e)))?;
        match (uri.scheme().cloned(), uri.authority().cloned()) {
            (Some(scheme), Some(authority)) => Ok(Self {
                default_origin: Some((scheme, authority)),
                listen_addr: None,
            }),
            _ => Err(ProxyError::Config(format!("Origin must be absolute: {}", origin))),
        }
    }

    /// Refuses upstreams that resolve to the proxy's own listener, which would
    /// otherwise relay the request back into the proxy until the pool runs dry.
    pub fn with_listen_addr(mut self, addr: SocketAddr) -> Self {
        self.listen_addr = Some(addr);
        self
    }

    fn targets_listener(&self, authority: &Authority) -> bool {
        let Some(listen) = self.listen_addr else {
            return false;
        };
        if authority.port_u16().unwrap_or(80) != listen.port() {
            return false;
        }
        let host = authority.host().trim_start_matches('[').trim_end_matches(']');
        if host.eq_ignore_ascii_case("localhost") {
            return listen.ip().is_loopback() || listen.ip().is_unspecified();
        }
        match host.parse::<IpAddr>() {
            Ok(ip) if ip == listen.ip() => true,
            Ok(ip) if listen.ip().is_unspecified() => ip.is_loopback() || ip.is_unspecified(),
            Ok(ip) => ip.is_loopback() && listen.ip().is_loopback(),
            Err(_) => false,
        }
    }
}

impl UriRewrite for DynamicRewrite {
    fn rewrite(&self, head: &Parts) -> Result<Uri, ProxyError> {
        let (scheme, authority) = match (head.uri.scheme(), head.uri.authority()) {
            (Some(scheme), Some(authority)) => (scheme.clone(), authority.clone()),
            _ => match &self.default_origin {
                Some((scheme, authority)) => (scheme.clone(), authority.clone()),
                None => {
                    let host = head
                        .headers
                        .get(HOST)
                        .and_then(|h| h.to_str().ok())
                        .ok_or_else(|| ProxyError::Rewrite("request names no upstream host".to_string()))?;
                    let authority = host
                        .parse::<Authority>()
                        .map_err(|e| ProxyError::Rewrite(format!("invalid Host header {}: {}", host, e)))?;
                    (Scheme::HTTP, authority)
                }
            },
        };

        if self.targets_listener(&authority) {
            return Err(ProxyError::Rewrite(format!("request loops back to the proxy at {}", authority)));
        }

        let path_and_query = head
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");

        Uri::builder()
            .scheme(scheme)
            .authority(authority)
            .path_and_query(path_and_query)
            .build()
            .map_err(|e| ProxyError::Rewrite(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::{Method, Request};

    fn head(uri: &str) -> Parts {
        Request::builder()
            .method(Method::GET)
            .uri(uri)
            .body(())
            .unwrap()
            .into_parts()
            .0
    }

    #[test]
    fn test_fixed_target_prefix_substitution() {
        let policy = FixedTargetRewrite::new("http://backend.example.com").unwrap();
        let uri = policy.rewrite(&head("/api/users?page=2")).unwrap();
        assert_eq!(uri.to_string(), "http://backend.example.com/api/users?page=2");
    }

    #[test]
    fn test_fixed_target_with_base_path() {
        let policy = FixedTargetRewrite::new("http://backend:3000/app/").unwrap();
        let uri = policy.rewrite(&head("/login")).unwrap();
        assert_eq!(uri.to_string(), "http://backend:3000/app/login");
    }

    #[test]
    fn test_fixed_target_path_suppressed() {
        let policy = FixedTargetRewrite::new("http://backend:3000")
            .unwrap()
            .with_forward_path(false);
        let uri = policy.rewrite(&head("/ignored/path?q=1")).unwrap();
        assert_eq!(uri.to_string(), "http://backend:3000/?q=1");
    }

    #[test]
    fn test_fixed_target_keeps_path_ending_in_authority() {
        let policy = FixedTargetRewrite::new("http://example.com").unwrap();
        let uri = policy.rewrite(&head("/mirror/example.com")).unwrap();
        assert_eq!(uri.to_string(), "http://example.com/mirror/example.com");

        let policy = FixedTargetRewrite::new("http://backend:3000/app")
            .unwrap()
            .with_forward_path(false);
        let uri = policy.rewrite(&head("/ignored")).unwrap();
        assert_eq!(uri.to_string(), "http://backend:3000/app");
    }

    #[test]
    fn test_fixed_target_rejects_invalid_url() {
        assert!(FixedTargetRewrite::new("not-a-url").is_err());
    }

    #[test]
    fn test_dynamic_default_origin() {
        let policy = DynamicRewrite::with_default_origin("http://localhost:80").unwrap();
        let uri = policy.rewrite(&head("/foo")).unwrap();
        assert_eq!(uri.to_string(), "http://localhost:80/foo");
    }

    #[test]
    fn test_dynamic_absolute_form_wins() {
        let policy = DynamicRewrite::with_default_origin("http://localhost:80").unwrap();
        let uri = policy.rewrite(&head("http://example.org:8080/a?b=c")).unwrap();
        assert_eq!(uri.to_string(), "http://example.org:8080/a?b=c");
    }

    #[test]
    fn test_dynamic_host_header() {
        let mut parts = head("/status");
        parts.headers.insert(HOST, "upstream.internal:9000".parse().unwrap());
        let uri = DynamicRewrite::new().rewrite(&parts).unwrap();
        assert_eq!(uri.to_string(), "http://upstream.internal:9000/status");
    }

    #[test]
    fn test_dynamic_rejects_own_listener() {
        let policy = DynamicRewrite::new().with_listen_addr("127.0.0.1:8080".parse().unwrap());

        let mut parts = head("/loop");
        parts.headers.insert(HOST, "localhost:8080".parse().unwrap());
        assert!(matches!(policy.rewrite(&parts), Err(ProxyError::Rewrite(_))));
        assert!(policy.rewrite(&head("http://127.0.0.1:8080/loop")).is_err());

        let uri = policy.rewrite(&head("http://127.0.0.1:9090/elsewhere")).unwrap();
        assert_eq!(uri.to_string(), "http://127.0.0.1:9090/elsewhere");
        let uri = policy.rewrite(&head("http://example.org:8080/a")).unwrap();
        assert_eq!(uri.to_string(), "http://example.org:8080/a");
    }

    #[test]
    fn test_dynamic_without_routing_data_fails() {
        let result = DynamicRewrite::new().rewrite(&head("/orphan"));
        assert!(matches!(result, Err(ProxyError::Rewrite(_))));
    }

    #[test]
    fn test_closure_policy() {
        let policy = |parts: &Parts| -> Result<Uri, ProxyError> {
            format!("http://shard-1{}", parts.uri.path())
                .parse()
                .map_err(|_| ProxyError::Rewrite("bad".into()))
        };
        let uri = policy.rewrite(&head("/x")).unwrap();
        assert_eq!(uri.to_string(), "http://shard-1/x");
    }
}
