use crate::replica::chat_log::{EntryKind, LogEntry};
use crate::replica::context::ReplicaContext;
use crate::replica::coordinator::CurrentCoordinator;
use crate::replica::election;
use crate::shutdown::ShutdownSignal;
use crate::transport::{read_frames, socket_addr_of, write_frames, RequestHandler};
use crate::wire::{self, envelope_data, Envelope};
use bytes::Bytes;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::time::Duration;

const WORKER_RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// The replica's single request dispatch. Both the bound reply endpoint
/// (router + direct peer calls) and the router back-connection workers feed
/// every framed request through here.
pub(crate) struct ReplicaService {
    ctx: Arc<ReplicaContext>,
}

#[derive(Deserialize)]
struct LoginData {
    #[serde(default)]
    user: String,
}

#[derive(Deserialize)]
struct ChannelData {
    name: String,
}

#[derive(Deserialize)]
struct PublishData {
    user: String,
    channel: String,
    message: String,
}

#[derive(Deserialize)]
struct DirectMessageData {
    src: String,
    dst: String,
    message: String,
}

#[derive(Deserialize)]
struct SubscriptionData {
    user: String,
    channel: String,
}

#[derive(Deserialize)]
struct ElectionData {
    #[serde(default)]
    from: String,
}

#[async_trait::async_trait]
impl RequestHandler for ReplicaService {
    async fn handle(&self, raw: Bytes) -> Bytes {
        let reply = match wire::decode(&raw) {
            Ok(request) => {
                self.ctx.clock.observe(request.clock);
                self.dispatch(request).await
            }
            Err(e) => {
                slog::warn!(self.ctx.logger, "Undecodable request: {}", e);
                self.reply(
                    "erro",
                    envelope_data(json!({"status": "erro", "description": "malformed envelope"})),
                )
            }
        };

        match wire::encode(&reply) {
            Ok(raw) => Bytes::from(raw),
            Err(e) => {
                slog::error!(self.ctx.logger, "Failed to encode reply: {}", e);
                Bytes::new()
            }
        }
    }
}

impl ReplicaService {
    pub(crate) fn new(ctx: Arc<ReplicaContext>) -> Self {
        ReplicaService { ctx }
    }

    async fn dispatch(&self, request: Envelope) -> Envelope {
        match request.service.as_str() {
            "login" => self.handle_login(&request).await,
            "channels" => self.handle_list_channels(),
            "channel" => self.handle_create_channel(&request).await,
            "publish" => self.handle_publish(&request).await,
            "message" => self.handle_direct_message(&request).await,
            "subscribe" => self.handle_subscription(&request, true).await,
            "unsubscribe" => self.handle_subscription(&request, false).await,
            "heartbeat" => self.reply("ok", Map::new()),
            "ping" => self.reply("ping", envelope_data(json!({"status": "ok"}))),
            "election" => self.handle_election(&request),
            "sync_request" => self.handle_sync_request(),
            other => {
                slog::debug!(self.ctx.logger, "Unknown service '{}'", other);
                self.reply(
                    other,
                    envelope_data(json!({"status": "erro", "message": "unknown service"})),
                )
            }
        }
    }

    async fn handle_login(&self, request: &Envelope) -> Envelope {
        let data: LoginData = match parse(request) {
            Ok(data) => data,
            Err(reply_data) => return self.reply("login", reply_data),
        };
        if data.user.is_empty() {
            return self.reply(
                "login",
                envelope_data(json!({"status": "erro", "description": "invalid user"})),
            );
        }

        let user = data.user;
        let entry = self.ctx.record_if_new(
            EntryKind::UserCreated,
            envelope_data(json!({ "user": user })),
            |state| !state.users.contains(&user),
        );
        if let Some(entry) = entry {
            slog::info!(self.ctx.logger, "User '{}' logged in", user);
            self.replicate(&entry).await;
        }

        self.reply("login", envelope_data(json!({"status": "ok"})))
    }

    fn handle_list_channels(&self) -> Envelope {
        let channels: Vec<String> = self.ctx.state_snapshot().channels.into_iter().collect();
        self.reply("channels", envelope_data(json!({ "channels": channels })))
    }

    async fn handle_create_channel(&self, request: &Envelope) -> Envelope {
        let data: ChannelData = match parse(request) {
            Ok(data) => data,
            Err(reply_data) => return self.reply("channel", reply_data),
        };

        let name = data.name;
        let entry = self.ctx.record_if_new(
            EntryKind::ChannelCreated,
            envelope_data(json!({ "name": name })),
            |state| !state.channels.contains(&name),
        );
        if let Some(entry) = entry {
            slog::info!(self.ctx.logger, "Channel '{}' created", name);
            self.replicate(&entry).await;
        }

        self.reply("channel", envelope_data(json!({"status": "ok"})))
    }

    async fn handle_publish(&self, request: &Envelope) -> Envelope {
        let data: PublishData = match parse(request) {
            Ok(data) => data,
            Err(reply_data) => return self.reply("publish", reply_data),
        };

        let entry = self.ctx.record(
            EntryKind::MessagePublished,
            envelope_data(json!({
                "user": data.user,
                "channel": data.channel,
                "message": data.message,
            })),
        );
        self.fan_out(&data.channel, "publish", &entry).await;
        self.replicate(&entry).await;

        self.reply("publish", envelope_data(json!({"status": "ok"})))
    }

    async fn handle_direct_message(&self, request: &Envelope) -> Envelope {
        let data: DirectMessageData = match parse(request) {
            Ok(data) => data,
            Err(reply_data) => return self.reply("message", reply_data),
        };

        let entry = self.ctx.record(
            EntryKind::DirectMessage,
            envelope_data(json!({
                "src": data.src,
                "dst": data.dst,
                "message": data.message,
            })),
        );
        // Direct messages travel the same bridge, addressed by recipient.
        self.fan_out(&data.dst, "message", &entry).await;
        self.replicate(&entry).await;

        self.reply("message", envelope_data(json!({"status": "ok"})))
    }

    async fn handle_subscription(&self, request: &Envelope, subscribe: bool) -> Envelope {
        let service = if subscribe { "subscribe" } else { "unsubscribe" };
        let data: SubscriptionData = match parse(request) {
            Ok(data) => data,
            Err(reply_data) => return self.reply(service, reply_data),
        };

        let (user, channel) = (data.user, data.channel);
        let kind = if subscribe {
            EntryKind::Subscribed
        } else {
            EntryKind::Unsubscribed
        };
        let entry = self.ctx.record_if_new(
            kind,
            envelope_data(json!({"user": user, "channel": channel})),
            |state| {
                let currently_in = state
                    .subscriptions
                    .get(&channel)
                    .map_or(false, |subscribers| subscribers.contains(&user));
                currently_in != subscribe
            },
        );
        if let Some(entry) = entry {
            self.replicate(&entry).await;
        }

        self.reply(service, envelope_data(json!({"status": "ok"})))
    }

    fn handle_election(&self, request: &Envelope) -> Envelope {
        let from = parse::<ElectionData>(request).map(|d| d.from).unwrap_or_default();
        slog::info!(self.ctx.logger, "Election bid received from '{}'", from);

        // Answer first so the weaker bidder stands down, then push our own
        // bid up the rank order.
        let ctx = self.ctx.clone();
        tokio::spawn(async move {
            election::start_election(&ctx).await;
        });

        self.reply("election", envelope_data(json!({"election": "OK"})))
    }

    fn handle_sync_request(&self) -> Envelope {
        if !self.ctx.coordinator.is_me() {
            let believed = match self.ctx.coordinator.current() {
                CurrentCoordinator::Other(name) => Value::String(name),
                _ => Value::Null,
            };
            return self.reply(
                "sync_response",
                envelope_data(json!({
                    "status": "erro",
                    "message": "not coordinator",
                    "coordinator": believed,
                })),
            );
        }

        let entries = self.ctx.log_entries();
        slog::info!(self.ctx.logger, "Serving sync_request with {} log entries", entries.len());
        let logs = serde_json::to_value(entries).unwrap_or(Value::Array(Vec::new()));
        self.reply("sync_response", envelope_data(json!({ "logs": logs })))
    }

    /// Deliver to subscribers of `topic` through the forwarder.
    async fn fan_out(&self, topic: &str, service: &str, entry: &LogEntry) {
        let mut data = entry.data.clone();
        data.insert("timestamp".to_string(), Value::String(entry.timestamp.clone()));
        let envelope = Envelope::new(service, data, self.ctx.clock.tick());

        if let Err(e) = self.ctx.publisher.publish(topic, &envelope).await {
            slog::warn!(self.ctx.logger, "Fan-out on topic '{}' failed: {}", topic, e);
        }
    }

    /// Offer the entry to every peer on the `replicate` topic. Best-effort:
    /// a missed delivery is repaired by the next startup catch-up.
    async fn replicate(&self, entry: &LogEntry) {
        let data = match serde_json::to_value(entry) {
            Ok(Value::Object(map)) => map,
            _ => return,
        };
        let envelope = Envelope::new("replicate", data, self.ctx.clock.tick());

        if let Err(e) = self.ctx.publisher.publish("replicate", &envelope).await {
            slog::warn!(self.ctx.logger, "Replication publish failed: {}", e);
        }
    }

    fn reply(&self, service: &str, data: Map<String, Value>) -> Envelope {
        Envelope::new(service, data, self.ctx.clock.tick())
    }
}

/// Deserialize the request's `data` into the service's typed record. The
/// error branch carries ready-made reply data naming the problem.
fn parse<T: serde::de::DeserializeOwned>(request: &Envelope) -> Result<T, Map<String, Value>> {
    serde_json::from_value(Value::Object(request.data.clone())).map_err(|_| {
        envelope_data(json!({
            "status": "erro",
            "description": "missing or malformed required fields",
        }))
    })
}

/// Connect back to the request router and serve as one of its workers,
/// answering through the same dispatch as the bound endpoint. Reconnects
/// forever; the router being down never stops a replica.
pub(crate) async fn run_router_worker(
    service: Arc<ReplicaService>,
    backend_addr: String,
    mut shutdown: ShutdownSignal,
) {
    let logger = service.ctx.logger.new(slog::o!("Loop" => "router-worker"));

    loop {
        let connect = async {
            match socket_addr_of(&backend_addr) {
                Ok(addr) => TcpStream::connect(addr).await.map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            }
        };

        let mut stream = tokio::select! {
            _ = &mut shutdown => return,
            connected = connect => match connected {
                Ok(stream) => {
                    slog::info!(logger, "Connected to router at '{}'", backend_addr);
                    stream
                }
                Err(e) => {
                    slog::warn!(logger, "Router connect failed: {}; retrying", e);
                    tokio::select! {
                        _ = &mut shutdown => return,
                        _ = tokio::time::sleep(WORKER_RECONNECT_DELAY) => continue,
                    }
                }
            }
        };

        loop {
            let frames = tokio::select! {
                _ = &mut shutdown => return,
                read = read_frames(&mut stream) => match read {
                    Ok(Some(frames)) => frames,
                    Ok(None) => {
                        slog::warn!(logger, "Router closed the connection; reconnecting");
                        break;
                    }
                    Err(e) => {
                        slog::warn!(logger, "Router read failed: {}; reconnecting", e);
                        break;
                    }
                }
            };

            let request = frames.into_iter().next().unwrap_or_default();
            let reply = service.handle(request).await;
            if let Err(e) = write_frames(&mut stream, &[reply]).await {
                slog::warn!(logger, "Router write failed: {}; reconnecting", e);
                break;
            }
        }
    }
}
