use crate::builder::ClientAddr;
use crate::config::{Config, ProxyMode};
use crate::error::ProxyError;
use crate::inbound::response_channel;
use crate::relay::RelayEngine;
use hyper::Request;
use hyper::body::Incoming;
use hyper::server::conn::http1::Builder as ServerBuilder;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use log::{debug, info, warn};
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

pub trait Proxy {
    fn run(self: Box<Self>) -> Pin<Box<dyn Future<Output = Result<(), ProxyError>> + Send>>;
}

pub struct ProxyFactory;

impl ProxyFactory {
    pub fn create_proxy(config: Config, shutdown: CancellationToken) -> Result<Box<dyn Proxy + Send>, ProxyError> {
        info!("Creating proxy instance for mode: {:?}", config.mode);
        config.validate()?;
        debug!(
            "Pool limits - total: {}, per route: {}, idle per route: {}",
            config.pool.max_total_connections, config.pool.max_connections_per_route, config.pool.max_idle_per_route
        );

        match config.mode {
            ProxyMode::Forward => match &config.default_upstream {
                Some(origin) => info!("Forward proxy mode, origin-form requests go to {}", origin),
                None => info!("Forward proxy mode, upstream taken from each request"),
            },
            ProxyMode::Reverse => info!(
                "Reverse proxy mode, target: {}",
                config.reverse_proxy_target.as_deref().unwrap_or_default()
            ),
        }

        let engine = RelayEngine::from_config(&config)?;
        Ok(Box::new(ProxyServer::new(
            engine,
            config.listen_addr,
            config.response_buffer_chunks,
            shutdown,
        )))
    }
}

/// Accepts HTTP/1.1 connections and hands every request to the relay engine.
pub struct ProxyServer {
    engine: Arc<RelayEngine>,
    addr: SocketAddr,
    buffer_chunks: usize,
    shutdown: CancellationToken,
}

impl ProxyServer {
    pub fn new(engine: RelayEngine, addr: SocketAddr, buffer_chunks: usize, shutdown: CancellationToken) -> Self {
        Self {
            engine: Arc::new(engine.with_shutdown(shutdown.clone())),
            addr,
            buffer_chunks,
            shutdown,
        }
    }

    pub fn engine(&self) -> &Arc<RelayEngine> {
        &self.engine
    }

    /// Serves `listener` until the shutdown token fires.
    pub async fn serve(self, listener: TcpListener) -> Result<(), ProxyError> {
        let local_addr = listener.local_addr()?;
        info!("HTTP proxy listening on: http://{}", local_addr);

        let reaper = spawn_idle_reaper(self.engine.clone(), self.shutdown.clone());

        loop {
            let (stream, remote_addr) = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("Failed to accept connection: {}", e);
                        continue;
                    }
                },
            };
            if let Err(e) = stream.set_nodelay(true) {
                debug!("Failed to set TCP_NODELAY for {}: {}", remote_addr, e);
            }

            let engine = self.engine.clone();
            let buffer_chunks = self.buffer_chunks;
            let shutdown = self.shutdown.clone();
            tokio::spawn(async move {
                let service = service_fn(move |mut req: Request<Incoming>| {
                    let engine = engine.clone();
                    async move {
                        req.extensions_mut().insert(ClientAddr(remote_addr));
                        let (sink, pending) = response_channel(buffer_chunks);
                        tokio::spawn(async move {
                            engine.relay(req, sink).await;
                        });
                        Ok::<_, Infallible>(pending.into_response().await)
                    }
                });

                let conn = ServerBuilder::new()
                    .keep_alive(true)
                    .serve_connection(TokioIo::new(stream), service);
                tokio::pin!(conn);
                let result = tokio::select! {
                    result = conn.as_mut() => result,
                    _ = shutdown.cancelled() => {
                        conn.as_mut().graceful_shutdown();
                        conn.as_mut().await
                    }
                };
                if let Err(e) = result {
                    debug!("Error serving connection from {}: {}", remote_addr, e);
                }
            });
        }

        info!("Listener on {} stopped", local_addr);
        reaper.abort();
        info!("Relay metrics: {}", self.engine.metrics().summary().to_json());
        Ok(())
    }
}

impl Proxy for ProxyServer {
    fn run(self: Box<Self>) -> Pin<Box<dyn Future<Output = Result<(), ProxyError>> + Send>> {
        Box::pin(async move {
            info!("Binding HTTP listener to: {}", self.addr);
            let listener = TcpListener::bind(self.addr).await?;
            self.serve(listener).await
        })
    }
}

fn spawn_idle_reaper(engine: Arc<RelayEngine>, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
    let period = (engine.pool().idle_timeout() / 2).clamp(Duration::from_secs(1), Duration::from_secs(30));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        let mut last_seen = 0;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let evicted = engine.pool().evict_expired();
                    if evicted > 0 {
                        debug!("Evicted {} idle upstream connections", evicted);
                    }
                    let summary = engine.metrics().summary();
                    if summary.requests_total != last_seen {
                        last_seen = summary.requests_total;
                        debug!("Relay metrics: {} pool: {:?}", summary.to_json(), engine.pool().stats());
                    }
                }
            }
        }
    })
}
