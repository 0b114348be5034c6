use crate::config::{ConfigError, OptionsValidated, ReplicaConfig};
use crate::replica::chat_log::{ChatLog, ChatState, LogEntry};
use crate::replica::context::ReplicaContext;
use crate::replica::coordinator::CurrentCoordinator;
use crate::replica::directory_client::DirectoryClient;
use crate::replica::election;
use crate::replica::heartbeat;
use crate::replica::service::{self, ReplicaService};
use crate::replica::storage::LogStorage;
use crate::replica::sub_loop;
use crate::replica::sync;
use crate::shutdown::{self, ShutdownHandle};
use crate::timers::RealClock;
use crate::transport::{Publisher, ReplyListener, TransportError};
use crate::wire::LamportClock;
use std::convert::TryFrom;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum ReplicaStartError {
    #[error("configuration rejected: {0}")]
    Config(#[from] ConfigError),
    #[error("failed to bind reply endpoint: {0}")]
    Bind(#[from] TransportError),
}

/// A running replica. All loops stop when the handle drops. The inspection
/// methods exist for operators' tooling and the integration tests; clients
/// go through the wire.
pub struct ReplicaHandle {
    ctx: Arc<ReplicaContext>,
    _shutdown_handles: Vec<ShutdownHandle>,
}

impl ReplicaHandle {
    pub fn name(&self) -> &str {
        &self.ctx.name
    }

    pub fn rank(&self) -> u64 {
        self.ctx.rank()
    }

    pub fn endpoint(&self) -> &str {
        &self.ctx.endpoint
    }

    pub fn log_len(&self) -> usize {
        self.ctx.log_len()
    }

    pub fn log_entries(&self) -> Vec<LogEntry> {
        self.ctx.log_entries()
    }

    pub fn chat_state(&self) -> ChatState {
        self.ctx.state_snapshot()
    }

    pub fn current_coordinator(&self) -> Option<String> {
        match self.ctx.coordinator.current() {
            CurrentCoordinator::Me => Some(self.ctx.name.clone()),
            CurrentCoordinator::Other(name) => Some(name),
            CurrentCoordinator::Unknown => None,
        }
    }

    pub fn is_coordinator(&self) -> bool {
        self.ctx.coordinator.is_me()
    }
}

/// Bring a replica up: load the durable log, bind the reply endpoint,
/// register with the directory, adopt a provisional coordinator, catch up
/// from it, then start the serving, subscription, heartbeat, and probe
/// loops.
pub async fn start_replica(logger: slog::Logger, config: ReplicaConfig) -> Result<ReplicaHandle, ReplicaStartError> {
    let options = OptionsValidated::try_from(config.options.clone())?;
    let logger = logger.new(slog::o!("ReplicaName" => config.name.clone()));

    // Durable state comes back before any endpoint exists.
    let storage = LogStorage::new(logger.clone(), &config.data_dir);
    let log = ChatLog::from_entries(storage.load());
    if !log.is_empty() {
        slog::info!(logger, "Loaded {} log entries from disk", log.len());
    }

    let listener = ReplyListener::bind(logger.clone(), &config.endpoint).await?;
    let endpoint = announced_endpoint(&config.endpoint, &listener)?;

    let clock = Arc::new(LamportClock::new());
    let directory = Arc::new(DirectoryClient::new(
        logger.clone(),
        clock.clone(),
        &config.ref_addr,
        options.directory_timeout,
    ));

    // Registration failure is not fatal: we serve with local state and the
    // heartbeat loop re-admits us once the directory is back. Until then we
    // carry the weakest possible rank so we never claim coordinatorship.
    let rank = match directory.register(&config.name, &endpoint).await {
        Ok(rank) => rank,
        Err(e) => {
            slog::warn!(logger, "Directory registration failed ({}); continuing unregistered", e);
            u64::MAX
        }
    };
    slog::info!(logger, "Replica up: name='{}' rank={} endpoint='{}'", config.name, rank, endpoint);

    let publisher = Publisher::new(logger.clone(), config.proxy_pub_addr.clone());
    let ctx = Arc::new(ReplicaContext::new(
        logger.clone(),
        config.name.clone(),
        rank,
        endpoint,
        clock,
        log,
        storage,
        publisher,
        options,
    ));

    match directory.list().await {
        Ok(peers) => ctx
            .peers
            .lock()
            .expect("peer table mutex guard poison")
            .replace_all(peers),
        Err(e) => slog::warn!(logger, "Initial directory list failed: {}", e),
    }

    election::choose_initial_coordinator(&ctx);
    sync::initial_sync(&ctx).await;

    let service = Arc::new(ReplicaService::new(ctx.clone()));
    let mut shutdown_handles = Vec::new();

    let (handle, signal) = shutdown::shutdown_signal();
    tokio::spawn(listener.serve(service.clone(), signal));
    shutdown_handles.push(handle);

    let (handle, signal) = shutdown::shutdown_signal();
    tokio::spawn(sub_loop::run(ctx.clone(), config.proxy_sub_addr.clone(), signal));
    shutdown_handles.push(handle);

    let (handle, signal) = shutdown::shutdown_signal();
    heartbeat::spawn_heartbeat_loop(ctx.clone(), directory, RealClock, signal);
    shutdown_handles.push(handle);

    let (handle, signal) = shutdown::shutdown_signal();
    election::spawn_probe_loop(ctx.clone(), RealClock, signal);
    shutdown_handles.push(handle);

    if let Some(backend_addr) = config.broker_dealer_addr.clone() {
        let (handle, signal) = shutdown::shutdown_signal();
        tokio::spawn(service::run_router_worker(service, backend_addr, signal));
        shutdown_handles.push(handle);
    }

    Ok(ReplicaHandle {
        ctx,
        _shutdown_handles: shutdown_handles,
    })
}

/// What we tell the directory. A `:0` bind request announces the resolved
/// port; anything else announces the configured address verbatim, because
/// the bind-side view (`0.0.0.0`, `*`) is not what peers should dial.
fn announced_endpoint(configured: &str, listener: &ReplyListener) -> Result<String, TransportError> {
    if configured.ends_with(":0") {
        listener.local_endpoint()
    } else {
        Ok(format!(
            "tcp://{}",
            configured.strip_prefix("tcp://").unwrap_or(configured)
        ))
    }
}
