use hyper::StatusCode;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Rewrite error: {0}")]
    Rewrite(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Upstream protocol error: {0}")]
    UpstreamProtocol(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Exchange cancelled: {0}")]
    Cancelled(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("URL parsing error: {0}")]
    Url(#[from] url::ParseError),

    #[error("HTTP error: {0}")]
    Http(#[from] http::Error),

    #[error("Hyper error: {0}")]
    Hyper(String),

    #[error("URI error: {0}")]
    Uri(String),
}

impl ProxyError {
    /// Status sent to the caller when the exchange fails before response headers went out.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::Rewrite(_) | ProxyError::Uri(_) | ProxyError::Url(_) => StatusCode::BAD_REQUEST,
            ProxyError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::Connection(_) | ProxyError::UpstreamProtocol(_) | ProxyError::Hyper(_) => {
                StatusCode::BAD_GATEWAY
            }
            ProxyError::Io(_) | ProxyError::Config(_) | ProxyError::Http(_) | ProxyError::Cancelled(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self, ProxyError::Cancelled(_))
    }

    /// Classifies an error reported by the hyper client side of an exchange.
    pub fn from_upstream(err: hyper::Error) -> Self {
        if err.is_parse() || err.is_incomplete_message() || err.is_parse_status() {
            ProxyError::UpstreamProtocol(err.to_string())
        } else if err.is_timeout() {
            ProxyError::Timeout(err.to_string())
        } else if err.is_canceled() || err.is_closed() {
            ProxyError::Connection(format!("upstream connection closed: {}", err))
        } else {
            ProxyError::Hyper(err.to_string())
        }
    }
}
