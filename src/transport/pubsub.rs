use crate::transport::{read_frames, socket_addr_of, write_frames, TransportError};
use crate::wire::{self, Envelope};
use bytes::Bytes;
use tokio::net::TcpStream;
use tokio::sync::Mutex;

// Control-frame leads on the subscriber side, mirroring the forwarder's
// verbose subscription events.
pub(crate) const SUBSCRIBE: u8 = 1;
pub(crate) const UNSUBSCRIBE: u8 = 0;

enum Conn {
    Connected(TcpStream),
    Disconnected,
}

/// Publisher pushes `[topic, envelope]` messages into the forwarder.
/// Publishing is best-effort: a failed send drops the socket and surfaces
/// the error; the next publish reconnects.
pub struct Publisher {
    logger: slog::Logger,
    endpoint: String,
    conn: Mutex<Conn>,
}

impl Publisher {
    pub fn new(logger: slog::Logger, endpoint: impl Into<String>) -> Self {
        Publisher {
            logger,
            endpoint: endpoint.into(),
            conn: Mutex::new(Conn::Disconnected),
        }
    }

    pub async fn publish(&self, topic: &str, envelope: &Envelope) -> Result<(), TransportError> {
        let payload = Bytes::from(wire::encode(envelope).map_err(|_| TransportError::Frame("unencodable envelope"))?);
        let frames = [Bytes::copy_from_slice(topic.as_bytes()), payload];

        let mut conn = self.conn.lock().await;
        if let Conn::Disconnected = *conn {
            let stream = TcpStream::connect(socket_addr_of(&self.endpoint)?).await?;
            slog::debug!(self.logger, "Publisher connected to '{}'", self.endpoint);
            *conn = Conn::Connected(stream);
        }

        let stream = match &mut *conn {
            Conn::Connected(stream) => stream,
            Conn::Disconnected => unreachable!("connection established above"),
        };

        if let Err(e) = write_frames(stream, &frames).await {
            *conn = Conn::Disconnected;
            return Err(e.into());
        }
        Ok(())
    }
}

/// Subscriber asserts prefix subscriptions on connect and then yields
/// `(topic, envelope)` pairs until the forwarder goes away.
pub struct Subscriber {
    stream: TcpStream,
}

impl Subscriber {
    pub async fn connect(endpoint: &str, prefixes: &[&str]) -> Result<Self, TransportError> {
        let mut stream = TcpStream::connect(socket_addr_of(endpoint)?).await?;
        for prefix in prefixes {
            let mut control = Vec::with_capacity(1 + prefix.len());
            control.push(SUBSCRIBE);
            control.extend_from_slice(prefix.as_bytes());
            write_frames(&mut stream, &[Bytes::from(control)]).await?;
        }

        Ok(Subscriber { stream })
    }

    pub async fn unsubscribe(&mut self, prefix: &str) -> Result<(), TransportError> {
        let mut control = Vec::with_capacity(1 + prefix.len());
        control.push(UNSUBSCRIBE);
        control.extend_from_slice(prefix.as_bytes());
        write_frames(&mut self.stream, &[Bytes::from(control)]).await?;
        Ok(())
    }

    /// `Ok(None)` means the forwarder closed the connection; callers decide
    /// whether to reconnect.
    pub async fn next(&mut self) -> Result<Option<(String, Envelope)>, TransportError> {
        let frames = match read_frames(&mut self.stream).await? {
            Some(frames) => frames,
            None => return Ok(None),
        };
        if frames.len() < 2 {
            return Err(TransportError::Frame("published message needs [topic, payload]"));
        }

        let topic = String::from_utf8(frames[0].to_vec())
            .map_err(|_| TransportError::Frame("topic is not UTF-8"))?;
        let envelope = wire::decode(&frames[1]).map_err(|_| TransportError::Frame("payload is not an envelope"))?;

        Ok(Some((topic, envelope)))
    }
}
