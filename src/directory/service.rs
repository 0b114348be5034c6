use crate::config::{ConfigError, DirectoryConfig, OptionsValidated};
use crate::directory::registry::Registry;
use crate::shutdown::{self, ShutdownHandle};
use crate::timers::{self, RealClock};
use crate::transport::{ReplyListener, RequestHandler, TransportError};
use crate::wire::{self, envelope_data, Envelope, LamportClock};
use bytes::Bytes;
use serde::Deserialize;
use serde_json::json;
use std::convert::TryFrom;
use std::sync::{Arc, Mutex};

#[derive(Debug, thiserror::Error)]
pub enum DirectoryStartError {
    #[error("configuration rejected: {0}")]
    Config(#[from] ConfigError),
    #[error("failed to bind reply endpoint: {0}")]
    Bind(#[from] TransportError),
}

/// Owns the serving loop and the reaper. Dropping the handle stops both.
pub struct DirectoryHandle {
    pub endpoint: String,
    _shutdown_handles: Vec<ShutdownHandle>,
}

pub async fn start_directory(
    logger: slog::Logger,
    config: DirectoryConfig,
) -> Result<DirectoryHandle, DirectoryStartError> {
    let options = OptionsValidated::try_from(config.options.clone())?;

    let listener = ReplyListener::bind(logger.clone(), &config.bind_addr).await?;
    let endpoint = listener.local_endpoint().map_err(DirectoryStartError::Bind)?;

    let service = Arc::new(DirectoryService {
        logger: logger.clone(),
        registry: Mutex::new(Registry::new(logger.clone())),
        clock: LamportClock::new(),
    });

    let (serve_shutdown_handle, serve_shutdown) = shutdown::shutdown_signal();
    tokio::spawn(listener.serve(service.clone(), serve_shutdown));

    let (reap_shutdown_handle, reap_shutdown) = shutdown::shutdown_signal();
    let reaper_service = service.clone();
    let liveness_ms = options.liveness_window.as_millis() as i64;
    let _reaper = timers::spawn_ticker(options.reap_period, RealClock, reap_shutdown, move || {
        let service = reaper_service.clone();
        async move {
            let now = chrono::Utc::now().timestamp_millis();
            service
                .registry
                .lock()
                .expect("directory registry mutex poison")
                .reap(now, liveness_ms);
        }
    });

    slog::info!(logger, "Directory up at '{}'", endpoint);
    Ok(DirectoryHandle {
        endpoint,
        _shutdown_handles: vec![serve_shutdown_handle, reap_shutdown_handle],
    })
}

struct DirectoryService {
    logger: slog::Logger,
    registry: Mutex<Registry>,
    clock: LamportClock,
}

/// Presence announcements; `addr` is the legacy spelling of `endpoint`.
#[derive(Deserialize)]
struct PresenceData {
    #[serde(default)]
    user: String,
    #[serde(default, alias = "addr")]
    endpoint: String,
}

#[async_trait::async_trait]
impl RequestHandler for DirectoryService {
    async fn handle(&self, raw: Bytes) -> Bytes {
        let request = match wire::decode(&raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                slog::warn!(self.logger, "Undecodable request: {}", e);
                return self.reply(envelope_data(json!({"error": "malformed envelope"})));
            }
        };

        self.clock.observe(request.clock);

        let data = match request.service.as_str() {
            "rank" => match self.parse_presence(&request) {
                Ok(presence) => {
                    let rank = self.observe(&presence);
                    envelope_data(json!({ "rank": rank }))
                }
                Err(error) => envelope_data(json!({ "error": error })),
            },
            "heartbeat" => match self.parse_presence(&request) {
                Ok(presence) => {
                    self.observe(&presence);
                    envelope_data(json!({"status": "ok"}))
                }
                Err(error) => envelope_data(json!({ "error": error })),
            },
            "list" => {
                let records = self
                    .registry
                    .lock()
                    .expect("directory registry mutex poison")
                    .list();
                let list: Vec<_> = records
                    .iter()
                    .map(|r| json!({"name": r.name, "rank": r.rank, "endpoint": r.endpoint}))
                    .collect();
                envelope_data(json!({ "list": list }))
            }
            other => {
                slog::debug!(self.logger, "Unknown service '{}'", other);
                envelope_data(json!({"error": "unknown service"}))
            }
        };

        self.reply(data)
    }
}

impl DirectoryService {
    fn parse_presence(&self, request: &Envelope) -> Result<PresenceData, &'static str> {
        let presence: PresenceData =
            serde_json::from_value(serde_json::Value::Object(request.data.clone()))
                .map_err(|_| "malformed presence data")?;
        if presence.user.is_empty() {
            return Err("missing user");
        }

        Ok(presence)
    }

    fn observe(&self, presence: &PresenceData) -> u64 {
        let now = chrono::Utc::now().timestamp_millis();
        self.registry
            .lock()
            .expect("directory registry mutex poison")
            .observe(&presence.user, &presence.endpoint, now)
    }

    /// Every reply, including errors, is a fully formed `ref` envelope.
    fn reply(&self, data: serde_json::Map<String, serde_json::Value>) -> Bytes {
        let envelope = Envelope::new("ref", data, self.clock.tick());
        match wire::encode(&envelope) {
            Ok(raw) => Bytes::from(raw),
            Err(e) => {
                // Out of moves; an empty reply at least keeps REQ/REP in step.
                slog::error!(self.logger, "Failed to encode reply: {}", e);
                Bytes::new()
            }
        }
    }
}
