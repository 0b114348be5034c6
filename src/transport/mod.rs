mod framing;
mod pubsub;
mod reply;
mod request;

pub use pubsub::Publisher;
pub use pubsub::Subscriber;
pub use reply::ReplyListener;
pub use reply::RequestHandler;
pub use request::ConnectionCache;
pub use request::RequestConnection;
pub use request::RequestError;

pub(crate) use framing::read_frames;
pub(crate) use framing::write_frames;

/// Errors shared across the transport patterns.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("invalid endpoint '{0}': expected tcp://host:port")]
    InvalidEndpoint(String),
    #[error("I/O failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("peer closed the connection")]
    Closed,
    #[error("malformed frame: {0}")]
    Frame(&'static str),
}

/// Accepts `tcp://host:port`, `tcp://*:port` (bind-anywhere), or a bare
/// `host:port`, and returns the `host:port` form the socket APIs take.
pub(crate) fn socket_addr_of(endpoint: &str) -> Result<String, TransportError> {
    let hostport = endpoint.strip_prefix("tcp://").unwrap_or(endpoint);
    if hostport.is_empty() || !hostport.contains(':') {
        return Err(TransportError::InvalidEndpoint(endpoint.to_string()));
    }

    Ok(hostport.replacen('*', "0.0.0.0", 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_forms() {
        assert_eq!(socket_addr_of("tcp://a:7001").unwrap(), "a:7001");
        assert_eq!(socket_addr_of("tcp://*:5555").unwrap(), "0.0.0.0:5555");
        assert_eq!(socket_addr_of("127.0.0.1:80").unwrap(), "127.0.0.1:80");
        assert!(socket_addr_of("tcp://").is_err());
        assert!(socket_addr_of("no-port").is_err());
    }
}
