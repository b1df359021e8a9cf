//! Shared fixtures: local upstream servers, a recording response sink and a proxy launcher.
#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::header::{HeaderName, HeaderValue};
use hyper::server::conn::http1 as server_http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use relay_proxy::builder::RequestBuilder;
use relay_proxy::config::{Config, PoolConfig, RequestConfig, TimeoutConfig};
use relay_proxy::headers::HeaderFilter;
use relay_proxy::pool::ConnectionPool;
use relay_proxy::rewrite::UriRewrite;
use relay_proxy::{Outcome, Phase, ProxyError, ProxyServer, RelayEngine, ResponseSink};
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub type UpstreamBody = UnsyncBoxBody<Bytes, Infallible>;

/// Starts a hyper HTTP/1.1 upstream on an ephemeral port.
pub async fn start_upstream<F, Fut>(handler: F) -> SocketAddr
where
    F: Fn(Request<Incoming>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Response<UpstreamBody>> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handler = Arc::new(handler);

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let handler = handler.clone();
            tokio::spawn(async move {
                let service = service_fn(move |req| {
                    let handler = handler.clone();
                    async move { Ok::<_, Infallible>(handler(req).await) }
                });
                let _ = server_http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });
    addr
}

/// A port nothing listens on.
pub async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

pub fn full_body(body: impl Into<Bytes>) -> UpstreamBody {
    Full::new(body.into()).boxed_unsync()
}

pub fn chunked_body(chunks: Vec<Bytes>) -> UpstreamBody {
    let frames = chunks.into_iter().map(|chunk| Ok::<_, Infallible>(Frame::data(chunk)));
    StreamBody::new(futures::stream::iter(frames)).boxed_unsync()
}

/// Endless body yielding one small chunk every `interval`.
pub fn trickle_body(interval: Duration) -> UpstreamBody {
    let stream = futures::stream::unfold((), move |()| async move {
        tokio::time::sleep(interval).await;
        Some((Ok::<_, Infallible>(Frame::data(Bytes::from_static(b"tick\n"))), ()))
    });
    StreamBody::new(stream).boxed_unsync()
}

pub fn text_response(status: StatusCode, body: &'static str) -> Response<UpstreamBody> {
    let mut response = Response::new(full_body(body));
    *response.status_mut() = status;
    response
}

pub fn engine(rewrite: impl UriRewrite + 'static, pool: PoolConfig) -> RelayEngine {
    engine_with(rewrite, RequestConfig::default(), HeaderFilter::default(), pool)
}

pub fn engine_with(
    rewrite: impl UriRewrite + 'static,
    request: RequestConfig,
    filter: HeaderFilter,
    pool: PoolConfig,
) -> RelayEngine {
    let timeouts = TimeoutConfig {
        connect_timeout_secs: 2,
        response_timeout_secs: 5,
        read_timeout_secs: 5,
    };
    let builder = RequestBuilder::new(Arc::new(rewrite), request, filter);
    let pool = ConnectionPool::new(pool, timeouts.connect_timeout());
    RelayEngine::new(builder, pool, timeouts)
}

pub fn get(uri: &str) -> Request<Full<Bytes>> {
    Request::builder().uri(uri).body(Full::new(Bytes::new())).unwrap()
}

/// Everything a [`RecordingSink`] saw.
#[derive(Debug, Default)]
pub struct Recorded {
    pub status: Option<StatusCode>,
    pub headers: Vec<(HeaderName, HeaderValue)>,
    pub body: Vec<u8>,
    pub writes: usize,
    pub flushes: usize,
    pub completions: usize,
    pub outcome: Option<Phase>,
    pub body_before_status: bool,
}

impl Recorded {
    pub fn header(&self, name: &str) -> Option<&HeaderValue> {
        self.headers.iter().find(|(n, _)| n.as_str() == name).map(|(_, v)| v)
    }
}

/// In-memory response sink that records every call.
pub struct RecordingSink {
    state: Arc<Mutex<Recorded>>,
    stall: Option<(usize, Duration)>,
    disconnect: CancellationToken,
}

impl RecordingSink {
    pub fn new() -> (Self, Arc<Mutex<Recorded>>) {
        let state = Arc::new(Mutex::new(Recorded::default()));
        let sink = Self {
            state: state.clone(),
            stall: None,
            disconnect: CancellationToken::new(),
        };
        (sink, state)
    }

    /// Refuses to accept bytes for `pause` on every `every`-th write.
    pub fn stall_every(mut self, every: usize, pause: Duration) -> Self {
        self.stall = Some((every.max(1), pause));
        self
    }

    /// Reports the downstream as gone once `token` is cancelled.
    pub fn disconnect_on(mut self, token: CancellationToken) -> Self {
        self.disconnect = token;
        self
    }
}

#[async_trait]
impl ResponseSink for RecordingSink {
    fn set_status(&mut self, status: StatusCode) {
        self.state.lock().unwrap().status = Some(status);
    }

    fn set_header(&mut self, name: HeaderName, value: HeaderValue) {
        self.state.lock().unwrap().headers.push((name, value));
    }

    async fn write(&mut self, chunk: Bytes) -> Result<(), ProxyError> {
        let writes = {
            let mut state = self.state.lock().unwrap();
            if state.status.is_none() {
                state.body_before_status = true;
            }
            state.body.extend_from_slice(&chunk);
            state.writes += 1;
            state.writes
        };
        if let Some((every, pause)) = self.stall {
            if writes % every == 0 {
                tokio::time::sleep(pause).await;
            }
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), ProxyError> {
        self.state.lock().unwrap().flushes += 1;
        Ok(())
    }

    fn closed(&self) -> BoxFuture<'static, ()> {
        let token = self.disconnect.clone();
        Box::pin(async move { token.cancelled().await })
    }

    async fn complete(&mut self, outcome: &Outcome) {
        let mut state = self.state.lock().unwrap();
        state.completions += 1;
        state.outcome = Some(outcome.phase());
    }
}

/// Runs a [`ProxyServer`] for `config` on an ephemeral port.
pub async fn start_proxy(config: Config) -> (SocketAddr, Arc<RelayEngine>, CancellationToken) {
    let shutdown = CancellationToken::new();
    let engine = RelayEngine::from_config(&config).unwrap();
    let server = ProxyServer::new(engine, config.listen_addr, config.response_buffer_chunks, shutdown.clone());
    let engine = server.engine().clone();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(server.serve(listener));
    (addr, engine, shutdown)
}

/// Sends one request over a fresh client connection. Aborting the returned
/// handle closes that connection.
pub async fn send_to(addr: SocketAddr, request: Request<Full<Bytes>>) -> (Response<Incoming>, JoinHandle<()>) {
    let stream = TcpStream::connect(addr).await.unwrap();
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .unwrap();
    let driver = tokio::spawn(async move {
        let _ = conn.await;
    });
    let response = sender.send_request(request).await.unwrap();
    (response, driver)
}

pub async fn body_string(response: Response<Incoming>) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8_lossy(&bytes).into_owned()
}

/// Polls `check` until it holds or `within` elapses.
pub async fn eventually<F: Fn() -> bool>(within: Duration, check: F) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
