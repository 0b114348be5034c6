use crate::shutdown::ShutdownSignal;
use crate::transport::{read_frames, socket_addr_of, write_frames, TransportError};
use bytes::Bytes;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

/// The serving side of a request/reply endpoint. Implementors must always
/// produce reply bytes — a malformed request gets a valid error envelope
/// back, never a dropped connection.
#[async_trait::async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn handle(&self, raw: Bytes) -> Bytes;
}

/// ReplyListener accepts framed requests and feeds them through a shared
/// handler, one task per connection.
pub struct ReplyListener {
    logger: slog::Logger,
    listener: TcpListener,
}

impl ReplyListener {
    /// Bind failure here is the one startup error treated as fatal; callers
    /// exit non-zero on it.
    pub async fn bind(logger: slog::Logger, endpoint: &str) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(socket_addr_of(endpoint)?).await?;
        slog::info!(logger, "Listening on '{}'", endpoint);

        Ok(ReplyListener { logger, listener })
    }

    /// The bound endpoint as a full URI. With a `:0` bind request this
    /// carries the real port, which is what tests and the directory see.
    pub fn local_endpoint(&self) -> Result<String, TransportError> {
        Ok(format!("tcp://{}", self.listener.local_addr()?))
    }

    pub async fn serve<H: RequestHandler>(self, handler: Arc<H>, mut shutdown: ShutdownSignal) {
        // Dropping the sender on exit tears down every connection task, so
        // a stopped endpoint really stops answering.
        let (closed_tx, closed_rx) = watch::channel(());

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    slog::info!(self.logger, "Reply listener shutting down");
                    drop(closed_tx);
                    return;
                }
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let logger = self.logger.new(slog::o!("Peer" => peer.to_string()));
                            let handler = handler.clone();
                            tokio::spawn(serve_connection(logger, stream, handler, closed_rx.clone()));
                        }
                        Err(e) => {
                            slog::warn!(self.logger, "Accept failure: {}", e);
                        }
                    }
                }
            }
        }
    }
}

async fn serve_connection<H: RequestHandler>(
    logger: slog::Logger,
    mut stream: TcpStream,
    handler: Arc<H>,
    mut closed: watch::Receiver<()>,
) {
    loop {
        let frames = tokio::select! {
            // Err means the listener dropped the sender: endpoint is down.
            _ = closed.changed() => return,
            read = read_frames(&mut stream) => match read {
                Ok(Some(frames)) => frames,
                Ok(None) => return,
                Err(e) => {
                    slog::debug!(logger, "Connection closed with error: {}", e);
                    return;
                }
            }
        };

        // Request/reply traffic is single-frame; extra frames are ignored.
        let request = frames.into_iter().next().unwrap_or_default();
        let reply = handler.handle(request).await;
        if let Err(e) = write_frames(&mut stream, &[reply]).await {
            slog::debug!(logger, "Failed to send reply: {}", e);
            return;
        }
    }
}
