//! The exchange state machine.
//!
//! ```text
//! Built -> Submitted -> HeadersReceived -> Streaming -> Completed
//!   \__________\______________\_______________\______> Failed | Cancelled
//! ```
//!
//! One [`RelayEngine::relay`] call owns one [`Exchange`] from start to finish.
//! Every path out of the relay ends in a single call to the
//! [`CompletionHandler`], which finalizes the inbound response.

use crate::body::BoxError;
use crate::builder::{OutboundRequest, RequestBuilder, inbound_request_line};
use crate::completion::{CompletionHandler, Outcome};
use crate::config::{Config, ProxyMode, TimeoutConfig};
use crate::error::ProxyError;
use crate::headers::HeaderFilter;
use crate::metrics::RelayMetrics;
use crate::pool::{ConnectionPool, Lease};
use crate::rewrite::{DynamicRewrite, FixedTargetRewrite, UriRewrite};
use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use http_body_util::BodyExt;
use hyper::body::Body;
use hyper::header::{HeaderName, HeaderValue};
use hyper::{Request, StatusCode};
use log::{debug, trace};
use std::fmt;
use std::sync::Arc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Built,
    Submitted,
    HeadersReceived,
    Streaming,
    Completed,
    Failed,
    Cancelled,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Completed | Phase::Failed | Phase::Cancelled)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Built => "BUILT",
            Phase::Submitted => "SUBMITTED",
            Phase::HeadersReceived => "HEADERS_RECEIVED",
            Phase::Streaming => "STREAMING",
            Phase::Completed => "COMPLETED",
            Phase::Failed => "FAILED",
            Phase::Cancelled => "CANCELLED",
        };
        f.write_str(name)
    }
}

/// Where the upstream response goes.
///
/// `set_status` and `set_header` are called before the first `write`. The
/// relay awaits every `write` and `flush`, so a sink that is slow to accept
/// bytes pauses the upstream read. `complete` is called exactly once per
/// exchange by the completion handler.
#[async_trait]
pub trait ResponseSink: Send {
    fn set_status(&mut self, status: StatusCode);

    fn set_header(&mut self, name: HeaderName, value: HeaderValue);

    async fn write(&mut self, chunk: Bytes) -> Result<(), ProxyError>;

    async fn flush(&mut self) -> Result<(), ProxyError>;

    /// Resolves once the downstream peer has gone away.
    fn closed(&self) -> BoxFuture<'static, ()>;

    async fn complete(&mut self, outcome: &Outcome);
}

/// One inbound request paired with its outbound counterpart and relay state.
pub struct Exchange<S> {
    pub(crate) request_line: String,
    pub(crate) outbound_line: Option<String>,
    pub(crate) sink: S,
    pub(crate) phase: Phase,
    pub(crate) bytes_relayed: u64,
    pub(crate) lease: Option<Lease>,
    pub(crate) error: Option<ProxyError>,
    finalized: bool,
}

impl<S: ResponseSink> Exchange<S> {
    pub fn new(request_line: String, sink: S) -> Self {
        Self {
            request_line,
            outbound_line: None,
            sink,
            phase: Phase::Built,
            bytes_relayed: 0,
            lease: None,
            error: None,
            finalized: false,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn request_line(&self) -> &str {
        &self.request_line
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Closes the completion gate. Returns false if it was already closed.
    pub(crate) fn begin_finalize(&mut self) -> bool {
        !std::mem::replace(&mut self.finalized, true)
    }

    fn advance(&mut self, next: Phase) {
        trace!("{}: {} -> {}", self.request_line, self.phase, next);
        self.phase = next;
    }

    fn into_report(self) -> ExchangeReport {
        ExchangeReport {
            request_line: self.request_line,
            outbound_line: self.outbound_line,
            phase: self.phase,
            bytes_relayed: self.bytes_relayed,
            error: self.error,
        }
    }
}

/// What is left of an exchange once it has been finalized.
#[derive(Debug)]
pub struct ExchangeReport {
    pub request_line: String,
    pub outbound_line: Option<String>,
    pub phase: Phase,
    pub bytes_relayed: u64,
    pub error: Option<ProxyError>,
}

pub struct RelayEngine {
    builder: RequestBuilder,
    pool: ConnectionPool,
    completion: CompletionHandler,
    timeouts: TimeoutConfig,
    shutdown: CancellationToken,
    metrics: Arc<RelayMetrics>,
}

impl RelayEngine {
    pub fn new(builder: RequestBuilder, pool: ConnectionPool, timeouts: TimeoutConfig) -> Self {
        let metrics = Arc::new(RelayMetrics::new());
        Self {
            builder,
            completion: CompletionHandler::new(pool.clone(), metrics.clone()),
            pool,
            timeouts,
            shutdown: CancellationToken::new(),
            metrics,
        }
    }

    /// Engine for a validated config: fixed rewrite in reverse mode, dynamic in forward mode.
    pub fn from_config(config: &Config) -> Result<Self, ProxyError> {
        let rewrite: Arc<dyn UriRewrite> = match config.mode {
            ProxyMode::Reverse => {
                let target = config
                    .reverse_proxy_target
                    .as_deref()
                    .ok_or_else(|| ProxyError::Config("Reverse proxy mode requires a target URL".to_string()))?;
                Arc::new(FixedTargetRewrite::new(target)?.with_forward_path(config.forward_path))
            }
            ProxyMode::Forward => {
                let dynamic = match config.default_upstream.as_deref() {
                    Some(origin) => DynamicRewrite::with_default_origin(origin)?,
                    None => DynamicRewrite::new(),
                };
                Arc::new(dynamic.with_listen_addr(config.listen_addr))
            }
        };
        let filter = HeaderFilter::new(config.excluded_header_names()?);
        let builder = RequestBuilder::new(rewrite, config.request.clone(), filter);
        let pool = ConnectionPool::new(config.pool.clone(), config.timeouts.connect_timeout());
        Ok(Self::new(builder, pool, config.timeouts.clone()))
    }

    /// Cancels every in-flight exchange once `token` fires.
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn metrics(&self) -> &Arc<RelayMetrics> {
        &self.metrics
    }

    /// Relays one inbound request to its upstream and the response back into `sink`.
    ///
    /// Never returns before the exchange has been finalized.
    pub async fn relay<B, S>(&self, inbound: Request<B>, sink: S) -> ExchangeReport
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
        S: ResponseSink,
    {
        self.metrics.increment_requests();
        let mut exchange = Exchange::new(inbound_request_line(&inbound), sink);

        let outcome = match self.builder.build(inbound) {
            Ok(outbound) => {
                exchange.outbound_line = Some(outbound.request_line.clone());
                self.run(&mut exchange, outbound).await
            }
            Err(e) => Outcome::Failure(e),
        };

        self.completion.on_outcome(&mut exchange, outcome).await;
        exchange.into_report()
    }

    async fn run<S: ResponseSink>(&self, exchange: &mut Exchange<S>, outbound: OutboundRequest) -> Outcome {
        let disconnected = exchange.sink.closed();
        let result = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(ProxyError::Cancelled("server shutting down".to_string())),
            _ = disconnected => Err(ProxyError::Cancelled("client disconnected".to_string())),
            result = self.drive(exchange, outbound) => result,
        };

        match result {
            Ok(status_line) => Outcome::Success { status_line },
            Err(e) if e.is_cancellation() => Outcome::Cancelled(e.to_string()),
            Err(e) => Outcome::Failure(e),
        }
    }

    /// Everything between BUILT and the end of the upstream body. Returns the upstream status line.
    async fn drive<S: ResponseSink>(
        &self,
        exchange: &mut Exchange<S>,
        outbound: OutboundRequest,
    ) -> Result<String, ProxyError> {
        let OutboundRequest { request, route, .. } = outbound;

        exchange.advance(Phase::Submitted);
        let lease = exchange.lease.insert(self.pool.lease(&route).await?);
        let response = timeout(self.timeouts.response_timeout(), lease.send(request))
            .await
            .map_err(|_| ProxyError::Timeout(format!("no response head from {}", route)))??;

        let (head, mut body) = response.into_parts();
        let status_line = format!("{:?} {}", head.version, head.status);
        exchange.advance(Phase::HeadersReceived);
        exchange.sink.set_status(head.status);
        let sink = &mut exchange.sink;
        self.builder
            .filter()
            .copy_response_headers(&head.headers, |name, value| sink.set_header(name, value));

        exchange.advance(Phase::Streaming);
        let read_timeout = self.timeouts.read_timeout();
        loop {
            let frame = match timeout(read_timeout, body.frame()).await {
                Err(_) => return Err(ProxyError::Timeout(format!("response body from {} stalled", route))),
                Ok(None) => break,
                Ok(Some(frame)) => frame.map_err(ProxyError::from_upstream)?,
            };
            // Trailers have no HTTP/1.1 representation once hop-by-hop headers are stripped
            let Ok(chunk) = frame.into_data() else { continue };
            if chunk.is_empty() {
                continue;
            }
            exchange.bytes_relayed += chunk.len() as u64;
            exchange.sink.write(chunk).await?;
            exchange.sink.flush().await?;
        }

        debug!("{}: {} bytes relayed from {}", exchange.request_line, exchange.bytes_relayed, route);
        Ok(status_line)
    }
}
