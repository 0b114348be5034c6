use crate::config::ForwarderConfig;
use crate::shutdown::{self, ShutdownHandle, ShutdownSignal};
use crate::transport::{read_frames, socket_addr_of, write_frames, TransportError};
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

// Control-frame lead bytes from subscribers, surfaced verbosely in the log.
const SUBSCRIBE: u8 = 1;
const UNSUBSCRIBE: u8 = 0;

#[derive(Debug, thiserror::Error)]
pub enum ForwarderStartError {
    #[error("failed to bind forwarder endpoint: {0}")]
    Bind(#[from] TransportError),
    #[error("failed to bind forwarder endpoint: {0}")]
    Io(#[from] std::io::Error),
}

pub struct ForwarderHandle {
    pub xsub_endpoint: String,
    pub xpub_endpoint: String,
    _shutdown_handles: Vec<ShutdownHandle>,
}

struct SubscriberEntry {
    prefixes: HashSet<Vec<u8>>,
    tx: mpsc::UnboundedSender<(Bytes, Bytes)>,
}

type Subscribers = Arc<Mutex<HashMap<u64, SubscriberEntry>>>;

/// The event forwarder: publishers push `[topic, payload]` on one side,
/// subscribers assert topic prefixes on the other and receive the matching
/// traffic. Nothing is filtered on the publisher side — the upstream view
/// is a standing wildcard — and subscription events are logged verbosely.
pub async fn start_forwarder(
    logger: slog::Logger,
    config: ForwarderConfig,
) -> Result<ForwarderHandle, ForwarderStartError> {
    let xsub = TcpListener::bind(socket_addr_of(&config.xsub_addr)?).await?;
    let xpub = TcpListener::bind(socket_addr_of(&config.xpub_addr)?).await?;
    let xsub_endpoint = format!("tcp://{}", xsub.local_addr()?);
    let xpub_endpoint = format!("tcp://{}", xpub.local_addr()?);
    slog::info!(logger, "Forwarder up: xsub '{}' xpub '{}'", xsub_endpoint, xpub_endpoint);

    let subscribers: Subscribers = Arc::new(Mutex::new(HashMap::new()));

    let (xsub_handle, xsub_shutdown) = shutdown::shutdown_signal();
    tokio::spawn(accept_publishers(
        logger.new(slog::o!("Side" => "xsub")),
        xsub,
        subscribers.clone(),
        xsub_shutdown,
    ));

    let (xpub_handle, xpub_shutdown) = shutdown::shutdown_signal();
    tokio::spawn(accept_subscribers(
        logger.new(slog::o!("Side" => "xpub")),
        xpub,
        subscribers,
        xpub_shutdown,
    ));

    Ok(ForwarderHandle {
        xsub_endpoint,
        xpub_endpoint,
        _shutdown_handles: vec![xsub_handle, xpub_handle],
    })
}

async fn accept_publishers(
    logger: slog::Logger,
    listener: TcpListener,
    subscribers: Subscribers,
    mut shutdown: ShutdownSignal,
) {
    loop {
        tokio::select! {
            _ = &mut shutdown => return,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let logger = logger.new(slog::o!("Publisher" => peer.to_string()));
                    tokio::spawn(drain_publisher(logger, stream, subscribers.clone()));
                }
                Err(e) => slog::warn!(logger, "Accept failure: {}", e),
            }
        }
    }
}

async fn drain_publisher(logger: slog::Logger, mut stream: TcpStream, subscribers: Subscribers) {
    loop {
        let frames = match read_frames(&mut stream).await {
            Ok(Some(frames)) => frames,
            Ok(None) => return,
            Err(e) => {
                slog::debug!(logger, "Publisher connection error: {}", e);
                return;
            }
        };
        if frames.len() < 2 {
            slog::debug!(logger, "Dropping message without [topic, payload]");
            continue;
        }

        let topic = frames[0].clone();
        let payload = frames[1].clone();

        let mut stale = Vec::new();
        {
            let subs = subscribers.lock().expect("subscriber map mutex guard poison");
            for (id, entry) in subs.iter() {
                let interested = entry.prefixes.iter().any(|prefix| topic.starts_with(&prefix[..]));
                if interested && entry.tx.send((topic.clone(), payload.clone())).is_err() {
                    stale.push(*id);
                }
            }
        }
        if !stale.is_empty() {
            let mut subs = subscribers.lock().expect("subscriber map mutex guard poison");
            for id in stale {
                subs.remove(&id);
            }
        }
    }
}

async fn accept_subscribers(
    logger: slog::Logger,
    listener: TcpListener,
    subscribers: Subscribers,
    mut shutdown: ShutdownSignal,
) {
    let mut next_id: u64 = 0;
    loop {
        tokio::select! {
            _ = &mut shutdown => return,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let id = next_id;
                    next_id += 1;
                    let logger = logger.new(slog::o!("Subscriber" => peer.to_string()));
                    tokio::spawn(serve_subscriber(logger, id, stream, subscribers.clone()));
                }
                Err(e) => slog::warn!(logger, "Accept failure: {}", e),
            }
        }
    }
}

async fn serve_subscriber(logger: slog::Logger, id: u64, stream: TcpStream, subscribers: Subscribers) {
    let (mut read_half, mut write_half) = stream.into_split();

    let (tx, mut rx) = mpsc::unbounded_channel::<(Bytes, Bytes)>();
    subscribers
        .lock()
        .expect("subscriber map mutex guard poison")
        .insert(
            id,
            SubscriberEntry {
                prefixes: HashSet::new(),
                tx,
            },
        );

    // Outbound half: matched messages flow out as they arrive.
    let writer_logger = logger.clone();
    let writer = tokio::spawn(async move {
        while let Some((topic, payload)) = rx.recv().await {
            if let Err(e) = write_frames(&mut write_half, &[topic, payload]).await {
                slog::debug!(writer_logger, "Subscriber write failed: {}", e);
                return;
            }
        }
    });

    // Inbound half: subscription control frames.
    loop {
        let frames = match read_frames(&mut read_half).await {
            Ok(Some(frames)) => frames,
            Ok(None) => break,
            Err(e) => {
                slog::debug!(logger, "Subscriber connection error: {}", e);
                break;
            }
        };
        let Some(control) = frames.first() else { continue };
        if control.is_empty() {
            continue;
        }

        let event = control[0];
        let prefix = control[1..].to_vec();
        let shown = String::from_utf8_lossy(&prefix).to_string();

        let mut subs = subscribers.lock().expect("subscriber map mutex guard poison");
        let Some(entry) = subs.get_mut(&id) else { break };
        match event {
            SUBSCRIBE => {
                slog::info!(logger, "Subscribe to topic prefix '{}'", shown);
                entry.prefixes.insert(prefix);
            }
            UNSUBSCRIBE => {
                slog::info!(logger, "Unsubscribe from topic prefix '{}'", shown);
                entry.prefixes.remove(&prefix);
            }
            other => {
                slog::debug!(logger, "Unknown control event {}", other);
            }
        }
    }

    subscribers
        .lock()
        .expect("subscriber map mutex guard poison")
        .remove(&id);
    writer.abort();
}
