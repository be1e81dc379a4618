use std::error::Error as StdError;
use std::io;
use thiserror::Error;

pub type BoxError = Box<dyn StdError + Send + Sync>;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("HTTP error: {0}")]
    Http(String),

    /// The upstream could not be reached or dropped the exchange.
    #[error("Connection error to {target}: {source}")]
    Connection {
        target: String,
        #[source]
        source: BoxError,
    },

    #[error("Upstream {target} timed out after {millis}ms")]
    Timeout { target: String, millis: u64 },

    /// Neither `target` nor `forward` resolved to a location.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Failure on an established relay, after protocols were switched.
    #[error("Relay error: {0}")]
    Relay(#[source] io::Error),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("URL parsing error: {0}")]
    Url(#[from] url::ParseError),

    #[error("Hyper error: {0}")]
    Hyper(#[from] hyper::Error),

    #[error("URI error: {0}")]
    Uri(String),
}

impl ProxyError {
    pub fn connection(target: impl Into<String>, source: impl Into<BoxError>) -> Self {
        ProxyError::Connection {
            target: target.into(),
            source: source.into(),
        }
    }

    /// The `io::ErrorKind` buried in the error's source chain, if any.
    ///
    /// Connector errors from hyper wrap the socket error a few levels deep,
    /// so this walks the whole chain rather than checking only the top.
    pub fn io_kind(&self) -> Option<io::ErrorKind> {
        match self {
            ProxyError::Io(e) | ProxyError::Relay(e) => return Some(e.kind()),
            ProxyError::Timeout { .. } => return Some(io::ErrorKind::TimedOut),
            _ => {}
        }

        let mut current: Option<&(dyn StdError + 'static)> = StdError::source(self);
        while let Some(err) = current {
            if let Some(io_err) = err.downcast_ref::<io::Error>() {
                return Some(io_err.kind());
            }
            current = err.source();
        }
        None
    }

    /// True for failures that happen on live I/O, as opposed to bad
    /// configuration. Only these are handed to per-call callbacks.
    pub fn is_io(&self) -> bool {
        !matches!(self, ProxyError::Config(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_kind_walks_source_chain() {
        let refused = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        let err = ProxyError::connection("http://127.0.0.1:1", refused);
        assert_eq!(err.io_kind(), Some(io::ErrorKind::ConnectionRefused));
    }

    #[test]
    fn test_io_kind_for_timeout_and_config() {
        let timeout = ProxyError::Timeout {
            target: "backend".to_string(),
            millis: 50,
        };
        assert_eq!(timeout.io_kind(), Some(io::ErrorKind::TimedOut));

        let config = ProxyError::Config("Must provide a proper URL as target".to_string());
        assert_eq!(config.io_kind(), None);
        assert!(!config.is_io());
    }
}
