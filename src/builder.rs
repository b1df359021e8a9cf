use crate::body::{BoxError, OutboundBody, outbound_body};
use crate::config::RequestConfig;
use crate::error::ProxyError;
use crate::headers::HeaderFilter;
use crate::pool::Route;
use crate::rewrite::UriRewrite;
use bytes::Bytes;
use hyper::body::Body;
use hyper::header::{HOST, HeaderMap, HeaderName, HeaderValue};
use hyper::http::request::Parts;
use hyper::{Method, Request, Uri, Version};
use std::net::SocketAddr;
use std::sync::Arc;

static X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
static X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");
static X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");

/// Peer address of the inbound connection, stored in request extensions by the server.
#[derive(Debug, Clone, Copy)]
pub struct ClientAddr(pub SocketAddr);

/// Everything the relay needs to submit one upstream request.
#[derive(Debug)]
pub struct OutboundRequest {
    /// Origin-form request ready for an HTTP/1.1 connection
    pub request: Request<OutboundBody>,
    /// Absolute rewritten target
    pub target: Uri,
    pub route: Route,
    /// `METHOD target VERSION`, used in completion logs
    pub request_line: String,
}

pub struct RequestBuilder {
    rewrite: Arc<dyn UriRewrite>,
    config: RequestConfig,
    filter: HeaderFilter,
}

impl RequestBuilder {
    pub fn new(rewrite: Arc<dyn UriRewrite>, config: RequestConfig, filter: HeaderFilter) -> Self {
        Self {
            rewrite,
            config,
            filter,
        }
    }

    pub fn filter(&self) -> &HeaderFilter {
        &self.filter
    }

    /// Turns an inbound request into its upstream counterpart. No I/O happens
    /// here: the inbound body is wrapped, not read.
    pub fn build<B>(&self, inbound: Request<B>) -> Result<OutboundRequest, ProxyError>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let (parts, body) = inbound.into_parts();
        if parts.method == Method::CONNECT {
            return Err(ProxyError::Rewrite("CONNECT tunnelling is not supported".to_string()));
        }

        let target = self.rewrite.rewrite(&parts)?;
        let route = Route::from_uri(&target)?;
        let origin_form = target
            .path_and_query()
            .cloned()
            .map(Uri::from)
            .unwrap_or_else(|| Uri::from_static("/"));

        let mut request = Request::new(outbound_body(body));
        *request.method_mut() = parts.method.clone();
        *request.uri_mut() = origin_form;
        *request.version_mut() = Version::HTTP_11;

        let headers = request.headers_mut();
        self.filter
            .copy_request_headers(&parts.headers, headers, self.config.preserve_host_header);
        if !headers.contains_key(HOST) {
            headers.insert(HOST, host_value(&target)?);
        }
        if self.config.forwarded_headers {
            add_forwarded_headers(&parts, headers);
        }

        let request_line = format!("{} {} {:?}", parts.method, target, Version::HTTP_11);
        Ok(OutboundRequest {
            request,
            target,
            route,
            request_line,
        })
    }
}

/// `METHOD uri VERSION` of the request as received.
pub fn inbound_request_line<B>(request: &Request<B>) -> String {
    format!("{} {} {:?}", request.method(), request.uri(), request.version())
}

fn host_value(target: &Uri) -> Result<HeaderValue, ProxyError> {
    let host = target
        .host()
        .ok_or_else(|| ProxyError::Uri(format!("{} has no host", target)))?;
    let value = match target.port_u16() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    };
    HeaderValue::from_str(&value).map_err(|e| ProxyError::Uri(e.to_string()))
}

fn add_forwarded_headers(parts: &Parts, headers: &mut HeaderMap) {
    if let Some(ClientAddr(addr)) = parts.extensions.get::<ClientAddr>() {
        let client_ip = addr.ip().to_string();
        // Earlier hops may arrive split across several field lines
        let mut hops: Vec<&str> = parts
            .headers
            .get_all(&X_FORWARDED_FOR)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .collect();
        hops.push(&client_ip);
        if let Ok(value) = HeaderValue::from_str(&hops.join(", ")) {
            headers.insert(X_FORWARDED_FOR.clone(), value);
        }
    }

    headers.insert(X_FORWARDED_PROTO.clone(), HeaderValue::from_static("http"));

    if let Some(host) = parts.headers.get(HOST) {
        headers.insert(X_FORWARDED_HOST.clone(), host.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rewrite::{DynamicRewrite, FixedTargetRewrite};
    use http_body_util::{BodyExt, Full};
    use hyper::header::{CONNECTION, CONTENT_LENGTH};

    fn builder(preserve_host: bool, forwarded: bool) -> RequestBuilder {
        let rewrite = FixedTargetRewrite::new("http://backend.internal:3000").unwrap();
        RequestBuilder::new(
            Arc::new(rewrite),
            RequestConfig {
                redirects_enabled: false,
                preserve_host_header: preserve_host,
                forwarded_headers: forwarded,
            },
            HeaderFilter::default(),
        )
    }

    #[tokio::test]
    async fn test_build_rewrites_and_streams_body() {
        let inbound = Request::builder()
            .method(Method::POST)
            .uri("/orders?draft=1")
            .header(HOST, "shop.example.com")
            .header(CONNECTION, "keep-alive")
            .header(CONTENT_LENGTH, "7")
            .body(Full::new(Bytes::from("payload")))
            .unwrap();

        let outbound = builder(false, false).build(inbound).unwrap();
        assert_eq!(outbound.target.to_string(), "http://backend.internal:3000/orders?draft=1");
        assert_eq!(outbound.route, Route::new("http", "backend.internal", 3000));
        assert_eq!(outbound.request_line, "POST http://backend.internal:3000/orders?draft=1 HTTP/1.1");

        let request = outbound.request;
        assert_eq!(request.method(), Method::POST);
        assert_eq!(request.uri().to_string(), "/orders?draft=1");
        assert_eq!(request.headers().get(HOST).unwrap(), "backend.internal:3000");
        assert_eq!(request.headers().get(CONTENT_LENGTH).unwrap(), "7");
        assert!(request.headers().get(CONNECTION).is_none());

        let body = request.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, Bytes::from("payload"));
    }

    #[test]
    fn test_preserve_host_and_forwarded_headers() {
        let mut inbound = Request::builder()
            .uri("/")
            .header(HOST, "shop.example.com")
            .header("x-forwarded-for", "10.0.0.1")
            .body(Full::new(Bytes::new()))
            .unwrap();
        inbound
            .extensions_mut()
            .insert(ClientAddr("192.168.1.20:51000".parse().unwrap()));

        let request = builder(true, true).build(inbound).unwrap().request;
        let headers = request.headers();
        assert_eq!(headers.get(HOST).unwrap(), "shop.example.com");
        assert_eq!(headers.get("x-forwarded-for").unwrap(), "10.0.0.1, 192.168.1.20");
        assert_eq!(headers.get("x-forwarded-proto").unwrap(), "http");
        assert_eq!(headers.get("x-forwarded-host").unwrap(), "shop.example.com");
    }

    #[test]
    fn test_forwarded_for_joins_every_field_line() {
        let mut inbound = Request::builder()
            .uri("/")
            .header("x-forwarded-for", "10.0.0.1")
            .header("x-forwarded-for", "10.0.0.2, 10.0.0.3")
            .body(Full::new(Bytes::new()))
            .unwrap();
        inbound
            .extensions_mut()
            .insert(ClientAddr("192.168.1.20:51000".parse().unwrap()));

        let request = builder(false, true).build(inbound).unwrap().request;
        let values: Vec<_> = request.headers().get_all("x-forwarded-for").iter().collect();
        assert_eq!(values.len(), 1);
        assert_eq!(values[0], "10.0.0.1, 10.0.0.2, 10.0.0.3, 192.168.1.20");
    }

    #[test]
    fn test_rewrite_failure_surfaces() {
        let builder = RequestBuilder::new(
            Arc::new(DynamicRewrite::new()),
            RequestConfig::default(),
            HeaderFilter::default(),
        );
        let inbound = Request::builder().uri("/no-host").body(Full::new(Bytes::new())).unwrap();
        assert!(matches!(builder.build(inbound), Err(ProxyError::Rewrite(_))));
    }

    #[test]
    fn test_connect_rejected() {
        let inbound = Request::builder()
            .method(Method::CONNECT)
            .uri("example.com:443")
            .body(Full::new(Bytes::new()))
            .unwrap();
        assert!(matches!(builder(false, false).build(inbound), Err(ProxyError::Rewrite(_))));
    }

    #[test]
    fn test_inbound_request_line() {
        let request = Request::builder()
            .method(Method::DELETE)
            .uri("/items/3")
            .body(())
            .unwrap();
        assert_eq!(inbound_request_line(&request), "DELETE /items/3 HTTP/1.1");
    }
}
