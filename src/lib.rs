pub mod body;
pub mod builder;
pub mod completion;
pub mod config;
pub mod error;
pub mod headers;
pub mod inbound;
pub mod logging;
pub mod metrics;
pub mod pool;
pub mod relay;
pub mod rewrite;
pub mod server;

pub use completion::{CompletionHandler, Outcome};
pub use config::{Config, ProxyMode};
pub use error::ProxyError;
pub use relay::{Exchange, ExchangeReport, Phase, RelayEngine, ResponseSink};
pub use server::{ProxyFactory, ProxyServer};
