use crate::error::ProxyError;
use crate::metrics::RelayMetrics;
use crate::pool::ConnectionPool;
use crate::relay::{Exchange, Phase, ResponseSink};
use log::{debug, error, info};
use std::sync::Arc;

/// Terminal result of an exchange.
#[derive(Debug)]
pub enum Outcome {
    /// Upstream body fully relayed; carries the upstream status line, e.g. `HTTP/1.1 200 OK`
    Success { status_line: String },
    Failure(ProxyError),
    Cancelled(String),
}

impl Outcome {
    pub fn phase(&self) -> Phase {
        match self {
            Outcome::Success { .. } => Phase::Completed,
            Outcome::Failure(_) => Phase::Failed,
            Outcome::Cancelled(_) => Phase::Cancelled,
        }
    }
}

/// Single finalization point for every exchange.
pub struct CompletionHandler {
    pool: ConnectionPool,
    metrics: Arc<RelayMetrics>,
}

impl CompletionHandler {
    pub fn new(pool: ConnectionPool, metrics: Arc<RelayMetrics>) -> Self {
        Self { pool, metrics }
    }

    /// Finalizes `exchange` with `outcome` if nothing has finalized it yet.
    ///
    /// Returns whether this call performed the finalization; later calls for
    /// the same exchange are no-ops and return false.
    pub async fn on_outcome<S: ResponseSink>(&self, exchange: &mut Exchange<S>, outcome: Outcome) -> bool {
        if !exchange.begin_finalize() {
            debug!("{}: already finalized, ignoring {:?}", exchange.request_line, outcome);
            return false;
        }
        exchange.phase = outcome.phase();

        match &outcome {
            Outcome::Success { status_line } => {
                let line = exchange.outbound_line.as_deref().unwrap_or(exchange.request_line.as_str());
                info!("request completed: {} -> {}", line, status_line);
                self.metrics.record_completed();
            }
            Outcome::Failure(e) => {
                error!("request failed: {}: {}", exchange.request_line, e);
                self.metrics.record_failed();
            }
            Outcome::Cancelled(reason) => {
                info!("request cancelled: {} ({})", exchange.request_line, reason);
                self.metrics.record_cancelled();
            }
        }
        self.metrics.record_response_bytes(exchange.bytes_relayed);

        // Only a fully read response leaves the connection at a message boundary
        if let Some(lease) = exchange.lease.take() {
            let reusable = matches!(outcome, Outcome::Success { .. });
            self.pool.release(lease, reusable);
        }

        exchange.sink.complete(&outcome).await;
        if let Outcome::Failure(e) = outcome {
            exchange.error = Some(e);
        }
        true
    }
}
