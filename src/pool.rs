//! Outbound connection pool.
//!
//! Connections are keyed by [`Route`] and handed out as [`Lease`]s. A lease
//! holds one permit from its route's semaphore and one from the global
//! semaphore, so the caps are enforced by waiting rather than failing: a
//! lease request past either cap suspends until another exchange releases.
//! Idle keep-alive connections are parked per route and checked for liveness
//! before reuse. Dropping a lease without [`ConnectionPool::release`] discards
//! the connection.

use crate::body::OutboundBody;
use crate::config::PoolConfig;
use crate::error::ProxyError;
use hyper::body::Incoming;
use hyper::client::conn::http1::{self, SendRequest};
use hyper::{Request, Response, Uri};
use hyper_util::rt::TokioIo;
use log::{debug, warn};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;

/// Upstream identity used as the pooling key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Route {
    scheme: String,
    host: String,
    port: u16,
}

impl Route {
    pub fn new(scheme: &str, host: &str, port: u16) -> Self {
        Self {
            scheme: scheme.to_ascii_lowercase(),
            host: host.to_ascii_lowercase(),
            port,
        }
    }

    pub fn from_uri(uri: &Uri) -> Result<Self, ProxyError> {
        let scheme = uri
            .scheme_str()
            .ok_or_else(|| ProxyError::Uri(format!("{} has no scheme", uri)))?;
        let host = uri
            .host()
            .ok_or_else(|| ProxyError::Uri(format!("{} has no host", uri)))?;
        let port = match uri.port_u16() {
            Some(port) => port,
            None => match scheme.to_ascii_lowercase().as_str() {
                "http" => 80,
                "https" => 443,
                other => return Err(ProxyError::Uri(format!("unsupported scheme: {}", other))),
            },
        };
        Ok(Self::new(scheme, host, port))
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    // IPv6 literals keep their brackets in URIs but not in socket addresses
    fn connect_host(&self) -> &str {
        self.host.trim_start_matches('[').trim_end_matches(']')
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}

struct IdleConnection {
    id: u64,
    sender: SendRequest<OutboundBody>,
    idle_since: Instant,
}

struct RouteSlot {
    permits: Arc<Semaphore>,
    idle: Vec<IdleConnection>,
}

struct PoolInner {
    config: PoolConfig,
    connect_timeout: Duration,
    total: Arc<Semaphore>,
    routes: Mutex<HashMap<Route, RouteSlot>>,
    next_id: AtomicU64,
    opened: AtomicU64,
    peak_route_leases: AtomicUsize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PoolStats {
    pub max_total: usize,
    pub leased: usize,
    pub available: usize,
    pub idle: usize,
    pub opened: u64,
    pub peak_route_leases: usize,
}

#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig, connect_timeout: Duration) -> Self {
        let total = Arc::new(Semaphore::new(config.max_total_connections));
        Self {
            inner: Arc::new(PoolInner {
                config,
                connect_timeout,
                total,
                routes: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                opened: AtomicU64::new(0),
                peak_route_leases: AtomicUsize::new(0),
            }),
        }
    }

    /// Waits for capacity on `route`, then hands out an idle connection or opens a new one.
    pub async fn lease(&self, route: &Route) -> Result<Lease, ProxyError> {
        let route_permits = self.route_permits(route);
        let route_permit = route_permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ProxyError::Connection("connection pool closed".to_string()))?;
        let total_permit = self
            .inner
            .total
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ProxyError::Connection("connection pool closed".to_string()))?;

        let leased = self.inner.config.max_connections_per_route - route_permits.available_permits();
        self.inner.peak_route_leases.fetch_max(leased, Ordering::Relaxed);

        let (id, sender, reused) = match self.checkout_idle(route).await {
            Some((id, sender)) => (id, sender, true),
            None => {
                let sender = self.connect(route).await?;
                let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
                (id, sender, false)
            }
        };
        debug!("Leased connection #{} to {} (reused: {}, leased on route: {})", id, route, reused, leased);

        Ok(Lease {
            id,
            route: route.clone(),
            sender,
            reused,
            _route_permit: route_permit,
            _total_permit: total_permit,
        })
    }

    /// Returns a lease. The connection is parked for reuse only when `reusable`
    /// is set and it is still open; otherwise it is dropped.
    pub fn release(&self, lease: Lease, reusable: bool) {
        let Lease {
            id,
            route,
            sender,
            _route_permit,
            _total_permit,
            ..
        } = lease;

        if reusable && !sender.is_closed() && self.inner.config.max_idle_per_route > 0 {
            let mut routes = self.routes();
            if let Some(slot) = routes.get_mut(&route) {
                if slot.idle.len() < self.inner.config.max_idle_per_route {
                    slot.idle.push(IdleConnection {
                        id,
                        sender,
                        idle_since: Instant::now(),
                    });
                    debug!("Connection #{} to {} returned to pool", id, route);
                    return;
                }
            }
        }
        debug!("Connection #{} to {} discarded", id, route);
    }

    /// Drops idle connections that outlived the idle timeout or were closed by the upstream.
    pub fn evict_expired(&self) -> usize {
        let idle_timeout = self.inner.config.idle_timeout();
        let mut evicted = 0;
        let mut routes = self.routes();
        for slot in routes.values_mut() {
            let before = slot.idle.len();
            slot.idle
                .retain(|conn| !conn.sender.is_closed() && conn.idle_since.elapsed() < idle_timeout);
            evicted += before - slot.idle.len();
        }
        // Outstanding leases and pending lease calls hold clones of the route semaphore
        routes.retain(|_, slot| !slot.idle.is_empty() || Arc::strong_count(&slot.permits) > 1);
        evicted
    }

    pub fn idle_timeout(&self) -> Duration {
        self.inner.config.idle_timeout()
    }

    /// Permits currently free under the total-connections cap.
    pub fn available(&self) -> usize {
        self.inner.total.available_permits()
    }

    pub fn leased_for(&self, route: &Route) -> usize {
        self.routes()
            .get(route)
            .map(|slot| self.inner.config.max_connections_per_route - slot.permits.available_permits())
            .unwrap_or(0)
    }

    pub fn stats(&self) -> PoolStats {
        let idle = self.routes().values().map(|slot| slot.idle.len()).sum();
        let available = self.available();
        PoolStats {
            max_total: self.inner.config.max_total_connections,
            leased: self.inner.config.max_total_connections - available,
            available,
            idle,
            opened: self.inner.opened.load(Ordering::Relaxed),
            peak_route_leases: self.inner.peak_route_leases.load(Ordering::Relaxed),
        }
    }

    fn routes(&self) -> MutexGuard<'_, HashMap<Route, RouteSlot>> {
        self.inner.routes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn route_permits(&self, route: &Route) -> Arc<Semaphore> {
        let mut routes = self.routes();
        routes
            .entry(route.clone())
            .or_insert_with(|| RouteSlot {
                permits: Arc::new(Semaphore::new(self.inner.config.max_connections_per_route)),
                idle: Vec::new(),
            })
            .permits
            .clone()
    }

    async fn checkout_idle(&self, route: &Route) -> Option<(u64, SendRequest<OutboundBody>)> {
        let idle_timeout = self.inner.config.idle_timeout();
        loop {
            let candidate = self.routes().get_mut(route).and_then(|slot| slot.idle.pop())?;
            if candidate.sender.is_closed() || candidate.idle_since.elapsed() >= idle_timeout {
                debug!("Dropping stale idle connection #{} to {}", candidate.id, route);
                continue;
            }
            let mut sender = candidate.sender;
            match sender.ready().await {
                Ok(()) => return Some((candidate.id, sender)),
                Err(e) => debug!("Idle connection #{} to {} unusable: {}", candidate.id, route, e),
            }
        }
    }

    async fn connect(&self, route: &Route) -> Result<SendRequest<OutboundBody>, ProxyError> {
        if route.scheme() != "http" {
            return Err(ProxyError::Connection(format!(
                "unsupported upstream scheme '{}' for {}",
                route.scheme(),
                route
            )));
        }

        let stream = timeout(
            self.inner.connect_timeout,
            TcpStream::connect((route.connect_host(), route.port())),
        )
        .await
        .map_err(|_| ProxyError::Timeout(format!("connecting to {}", route)))?
        .map_err(|e| ProxyError::Connection(format!("{}: {}", route, e)))?;
        if let Err(e) = stream.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY for {}: {}", route, e);
        }

        let (sender, conn) = http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|e| ProxyError::Connection(format!("handshake with {} failed: {}", route, e)))?;
        self.inner.opened.fetch_add(1, Ordering::Relaxed);

        let label = route.to_string();
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!("Upstream connection to {} ended: {}", label, e);
            }
        });

        Ok(sender)
    }
}

/// Exclusive use of one upstream connection by one exchange.
pub struct Lease {
    id: u64,
    route: Route,
    sender: SendRequest<OutboundBody>,
    reused: bool,
    _route_permit: OwnedSemaphorePermit,
    _total_permit: OwnedSemaphorePermit,
}

impl Lease {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn route(&self) -> &Route {
        &self.route
    }

    pub fn is_reused(&self) -> bool {
        self.reused
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    pub async fn send(&mut self, request: Request<OutboundBody>) -> Result<Response<Incoming>, ProxyError> {
        self.sender.ready().await.map_err(ProxyError::from_upstream)?;
        self.sender
            .send_request(request)
            .await
            .map_err(ProxyError::from_upstream)
    }
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("id", &self.id)
            .field("route", &self.route)
            .field("reused", &self.reused)
            .finish()
    }
}
