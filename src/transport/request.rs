use crate::transport::{read_frames, socket_addr_of, write_frames, TransportError};
use crate::wire::{self, Envelope};
use bytes::Bytes;
use std::collections::HashMap;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),
    #[error("no reply within {0:?}")]
    Timeout(Duration),
    #[error("reply was not a valid envelope: {0}")]
    Decode(#[from] wire::DecodeError),
    #[error("request could not be encoded: {0}")]
    Encode(#[from] wire::EncodeError),
}

/// Tracks the lifecycle of one outbound connection so a replica can start
/// even when its peers are not up yet: calls reconnect on demand and a
/// failed or timed-out exchange discards the socket.
enum Conn {
    Connected(TcpStream),
    Disconnected,
}

pub struct RequestConnection {
    logger: slog::Logger,
    endpoint: String,
    conn: Conn,
}

impl RequestConnection {
    pub fn new(logger: slog::Logger, endpoint: impl Into<String>) -> Self {
        RequestConnection {
            logger,
            endpoint: endpoint.into(),
            conn: Conn::Disconnected,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// One synchronous exchange: send the envelope, await the reply. The
    /// timeout covers connect, send, and receive together.
    pub async fn call(&mut self, request: &Envelope, timeout: Duration) -> Result<Envelope, RequestError> {
        let raw = Bytes::from(wire::encode(request)?);

        let exchange = tokio::time::timeout(timeout, self.exchange(raw)).await;
        match exchange {
            Ok(Ok(reply_raw)) => Ok(wire::decode(&reply_raw)?),
            Ok(Err(e)) => {
                self.conn = Conn::Disconnected;
                Err(e.into())
            }
            Err(_elapsed) => {
                // The socket may carry a late reply that would desync the
                // next exchange, so it is discarded with the timeout.
                self.conn = Conn::Disconnected;
                Err(RequestError::Timeout(timeout))
            }
        }
    }

    async fn exchange(&mut self, raw: Bytes) -> Result<Bytes, TransportError> {
        if let Conn::Disconnected = self.conn {
            let stream = TcpStream::connect(socket_addr_of(&self.endpoint)?).await?;
            slog::debug!(self.logger, "Connected to '{}'", self.endpoint);
            self.conn = Conn::Connected(stream);
        }

        let stream = match &mut self.conn {
            Conn::Connected(stream) => stream,
            Conn::Disconnected => unreachable!("connection established above"),
        };

        write_frames(stream, &[raw]).await?;
        match read_frames(stream).await? {
            Some(mut frames) if !frames.is_empty() => Ok(frames.remove(0)),
            Some(_) => Err(TransportError::Frame("empty reply message")),
            None => Err(TransportError::Closed),
        }
    }
}

/// Owning map of `endpoint -> RequestConnection`: one cached outbound
/// connection per peer, taken out of the map for the duration of a call and
/// returned only on success, so failed sockets are evicted explicitly.
pub struct ConnectionCache {
    logger: slog::Logger,
    conns: Mutex<HashMap<String, RequestConnection>>,
}

impl ConnectionCache {
    pub fn new(logger: slog::Logger) -> Self {
        ConnectionCache {
            logger,
            conns: Mutex::new(HashMap::new()),
        }
    }

    pub async fn call(
        &self,
        endpoint: &str,
        request: &Envelope,
        timeout: Duration,
    ) -> Result<Envelope, RequestError> {
        let mut conn = {
            let mut conns = self.conns.lock().await;
            conns
                .remove(endpoint)
                .unwrap_or_else(|| RequestConnection::new(self.logger.clone(), endpoint))
        };

        let result = conn.call(request, timeout).await;
        if result.is_ok() {
            self.conns.lock().await.insert(endpoint.to_string(), conn);
        }

        result
    }
}
