use crate::replica::chat_log::LogEntry;
use crate::replica::context::ReplicaContext;
use crate::replica::coordinator::CurrentCoordinator;
use crate::wire::{envelope_data, Envelope};
use serde_json::json;
use std::sync::Arc;

/// Startup catch-up: pull the coordinator's full log and adopt it. Every
/// failure path is best-effort — the replica continues with whatever local
/// state it loaded.
pub(crate) async fn initial_sync(ctx: &Arc<ReplicaContext>) {
    let coordinator = match ctx.coordinator.current() {
        CurrentCoordinator::Me => return,
        CurrentCoordinator::Other(name) => name,
        CurrentCoordinator::Unknown => {
            slog::info!(ctx.logger, "No coordinator known; skipping initial sync");
            return;
        }
    };

    let peer = ctx
        .peers
        .lock()
        .expect("peer table mutex guard poison")
        .get(&coordinator);
    let Some(peer) = peer else {
        slog::warn!(ctx.logger, "Coordinator '{}' has no known endpoint; skipping sync", coordinator);
        return;
    };

    slog::info!(ctx.logger, "Requesting log sync from '{}' at '{}'", peer.name, peer.endpoint);
    let request = Envelope::new("sync_request", envelope_data(json!({})), ctx.clock.tick());
    let reply = match ctx.conns.call(&peer.endpoint, &request, ctx.opts.sync_timeout).await {
        Ok(reply) => reply,
        Err(e) => {
            slog::warn!(ctx.logger, "Sync failed ({}); continuing with local state", e);
            return;
        }
    };
    ctx.observe_reply(&reply);

    let Some(raw_logs) = reply.data.get("logs").cloned() else {
        slog::warn!(
            ctx.logger,
            "Sync reply carried no logs (status: {}); continuing with local state",
            reply.str_field("status").unwrap_or("?")
        );
        return;
    };

    let entries: Vec<LogEntry> = match serde_json::from_value(raw_logs) {
        Ok(entries) => entries,
        Err(e) => {
            slog::warn!(ctx.logger, "Sync reply logs were malformed: {}", e);
            return;
        }
    };

    let adopted = ctx.replace_log(entries);
    slog::info!(ctx.logger, "Synchronized {} log entries from '{}'", adopted, coordinator);
}
