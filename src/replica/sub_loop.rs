use crate::replica::chat_log::LogEntry;
use crate::replica::context::ReplicaContext;
use crate::replica::peers::PeerInfo;
use crate::shutdown::ShutdownSignal;
use crate::transport::Subscriber;
use crate::wire::Envelope;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::time::Duration;

const RECONNECT_DELAY: Duration = Duration::from_secs(1);

#[derive(Deserialize)]
struct CoordinatorAnnouncement {
    coordinator: String,
    rank: Option<u64>,
    #[serde(default, alias = "addr")]
    endpoint: String,
}

/// The replication loop: subscribe to `replicate` (cluster-wide log
/// appends) and `servers` (coordinator announcements) and fold both into
/// local state. Reconnects to the forwarder until shut down.
pub(crate) async fn run(ctx: Arc<ReplicaContext>, sub_addr: String, mut shutdown: ShutdownSignal) {
    let logger = ctx.logger.new(slog::o!("Loop" => "subscription"));

    loop {
        let mut subscriber = tokio::select! {
            _ = &mut shutdown => return,
            connected = Subscriber::connect(&sub_addr, &["replicate", "servers"]) => match connected {
                Ok(subscriber) => {
                    slog::info!(logger, "Subscribed at '{}'", sub_addr);
                    subscriber
                }
                Err(e) => {
                    slog::warn!(logger, "Forwarder connect failed: {}; retrying", e);
                    tokio::select! {
                        _ = &mut shutdown => return,
                        _ = tokio::time::sleep(RECONNECT_DELAY) => continue,
                    }
                }
            }
        };

        loop {
            let (topic, envelope) = tokio::select! {
                _ = &mut shutdown => return,
                received = subscriber.next() => match received {
                    Ok(Some(message)) => message,
                    Ok(None) => {
                        slog::warn!(logger, "Forwarder closed the stream; reconnecting");
                        break;
                    }
                    Err(e) => {
                        slog::warn!(logger, "Subscription receive failed: {}; reconnecting", e);
                        break;
                    }
                }
            };

            ctx.clock.observe(envelope.clock);

            match topic.as_str() {
                "replicate" => apply_replication(&ctx, &logger, envelope),
                "servers" => apply_coordinator_update(&ctx, &logger, envelope),
                // Prefix subscriptions can over-match (e.g. a channel named
                // "servers-chat"); anything else is not for this loop.
                _ => {}
            }
        }
    }
}

fn apply_replication(ctx: &ReplicaContext, logger: &slog::Logger, envelope: Envelope) {
    let entry: LogEntry = match serde_json::from_value(Value::Object(envelope.data)) {
        Ok(entry) => entry,
        Err(e) => {
            slog::warn!(logger, "Replicate envelope without a valid entry: {}", e);
            return;
        }
    };

    let id = entry.id.clone();
    if ctx.apply_replicated(entry) {
        slog::debug!(logger, "Applied replicated entry '{}'", id);
    }
}

fn apply_coordinator_update(ctx: &ReplicaContext, logger: &slog::Logger, envelope: Envelope) {
    let announcement: CoordinatorAnnouncement = match serde_json::from_value(Value::Object(envelope.data)) {
        Ok(announcement) => announcement,
        Err(e) => {
            slog::warn!(logger, "Coordinator announcement missing fields: {}", e);
            return;
        }
    };

    slog::info!(logger, "Coordinator announced: '{}'", announcement.coordinator);
    ctx.coordinator.accept_coordinator(&announcement.coordinator);

    // The winner also tells us where it lives, which may be fresher than
    // our last directory list.
    if let Some(rank) = announcement.rank {
        if !announcement.endpoint.is_empty() {
            ctx.peers
                .lock()
                .expect("peer table mutex guard poison")
                .upsert(PeerInfo {
                    name: announcement.coordinator,
                    rank,
                    endpoint: announcement.endpoint,
                });
        }
    }
}
