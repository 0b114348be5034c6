use crate::config::RouterConfig;
use crate::shutdown::{self, ShutdownHandle, ShutdownSignal};
use crate::transport::{read_frames, socket_addr_of, write_frames, TransportError};
use bytes::Bytes;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, Mutex};

/// One client request in flight: the raw frame plus the slot its reply
/// belongs in.
struct Job {
    request: Bytes,
    reply_tx: oneshot::Sender<Bytes>,
}

#[derive(Debug, thiserror::Error)]
pub enum RouterStartError {
    #[error("failed to bind router endpoint: {0}")]
    Bind(#[from] TransportError),
    #[error("failed to bind router endpoint: {0}")]
    Io(#[from] std::io::Error),
}

pub struct RouterHandle {
    pub frontend_endpoint: String,
    pub backend_endpoint: String,
    _shutdown_handles: Vec<ShutdownHandle>,
}

/// The request router: clients talk to the frontend, replicas connect back
/// to the backend as workers. Requests round-robin across whichever workers
/// are free, and each reply travels back on the requesting connection. The
/// router never looks inside a frame.
pub async fn start_router(logger: slog::Logger, config: RouterConfig) -> Result<RouterHandle, RouterStartError> {
    let frontend = TcpListener::bind(socket_addr_of(&config.frontend_addr)?).await?;
    let backend = TcpListener::bind(socket_addr_of(&config.backend_addr)?).await?;
    let frontend_endpoint = format!("tcp://{}", frontend.local_addr()?);
    let backend_endpoint = format!("tcp://{}", backend.local_addr()?);
    slog::info!(
        logger,
        "Router up: frontend '{}' backend '{}'",
        frontend_endpoint,
        backend_endpoint
    );

    let (job_tx, job_rx) = mpsc::unbounded_channel::<Job>();
    // Workers pull from a shared queue; the mutex is the round-robin.
    let job_queue = JobQueue {
        tx: job_tx.clone(),
        rx: Arc::new(Mutex::new(job_rx)),
    };

    let (frontend_handle, frontend_shutdown) = shutdown::shutdown_signal();
    tokio::spawn(accept_clients(
        logger.new(slog::o!("Side" => "frontend")),
        frontend,
        job_tx,
        frontend_shutdown,
    ));

    let (backend_handle, backend_shutdown) = shutdown::shutdown_signal();
    tokio::spawn(accept_workers(
        logger.new(slog::o!("Side" => "backend")),
        backend,
        job_queue,
        backend_shutdown,
    ));

    Ok(RouterHandle {
        frontend_endpoint,
        backend_endpoint,
        _shutdown_handles: vec![frontend_handle, backend_handle],
    })
}

async fn accept_clients(
    logger: slog::Logger,
    listener: TcpListener,
    job_tx: mpsc::UnboundedSender<Job>,
    mut shutdown: ShutdownSignal,
) {
    loop {
        tokio::select! {
            _ = &mut shutdown => return,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let logger = logger.new(slog::o!("Client" => peer.to_string()));
                    tokio::spawn(serve_client(logger, stream, job_tx.clone()));
                }
                Err(e) => slog::warn!(logger, "Accept failure: {}", e),
            }
        }
    }
}

async fn serve_client(logger: slog::Logger, mut stream: TcpStream, job_tx: mpsc::UnboundedSender<Job>) {
    loop {
        let frames = match read_frames(&mut stream).await {
            Ok(Some(frames)) => frames,
            Ok(None) => return,
            Err(e) => {
                slog::debug!(logger, "Client connection error: {}", e);
                return;
            }
        };
        let request = frames.into_iter().next().unwrap_or_default();

        let (reply_tx, reply_rx) = oneshot::channel();
        if job_tx.send(Job { request, reply_tx }).is_err() {
            // Backend side is gone; nothing useful to tell the client.
            return;
        }

        let reply = match reply_rx.await {
            Ok(reply) => reply,
            Err(_) => {
                slog::warn!(logger, "Worker died mid-request; dropping client");
                return;
            }
        };
        if let Err(e) = write_frames(&mut stream, &[reply]).await {
            slog::debug!(logger, "Could not deliver reply: {}", e);
            return;
        }
    }
}

#[derive(Clone)]
struct JobQueue {
    tx: mpsc::UnboundedSender<Job>,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<Job>>>,
}

async fn accept_workers(logger: slog::Logger, listener: TcpListener, queue: JobQueue, mut shutdown: ShutdownSignal) {
    loop {
        tokio::select! {
            _ = &mut shutdown => return,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    slog::info!(logger, "Worker connected from {}", peer);
                    let logger = logger.new(slog::o!("Worker" => peer.to_string()));
                    tokio::spawn(drive_worker(logger, stream, queue.clone()));
                }
                Err(e) => slog::warn!(logger, "Accept failure: {}", e),
            }
        }
    }
}

async fn drive_worker(logger: slog::Logger, mut stream: TcpStream, queue: JobQueue) {
    loop {
        let job = match queue.rx.lock().await.recv().await {
            Some(job) => job,
            None => return,
        };

        if let Err(e) = write_frames(&mut stream, &[job.request.clone()]).await {
            // The request never reached this worker, so another can safely
            // take it; only this worker dies.
            slog::warn!(logger, "Worker send failed: {}; requeueing request", e);
            let _ = queue.tx.send(job);
            return;
        }

        match read_frames(&mut stream).await {
            Ok(Some(mut frames)) if !frames.is_empty() => {
                let _ = job.reply_tx.send(frames.remove(0));
            }
            Ok(_) | Err(_) => {
                // The worker may or may not have applied the request; a
                // retry could double-apply, so the client sees the failure.
                slog::warn!(logger, "Worker reply failed; dropping request");
                return;
            }
        }
    }
}
