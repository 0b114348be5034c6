use crate::replica::context::ReplicaContext;
use crate::replica::coordinator::CurrentCoordinator;
use crate::shutdown::ShutdownSignal;
use crate::timers::{self, Clock};
use crate::wire::{envelope_data, Envelope};
use serde_json::json;
use std::sync::Arc;

/// The coordinator-liveness loop: every probe period, a replica that is not
/// the coordinator pings it directly; a timeout, transport error, or the
/// coordinator missing from the latest directory list starts an election.
pub(crate) fn spawn_probe_loop<C>(ctx: Arc<ReplicaContext>, clock: C, shutdown: ShutdownSignal)
where
    C: Clock + Send + Sync + 'static,
{
    let period = ctx.opts.coord_probe_period;
    let _ticker = timers::spawn_ticker(period, clock, shutdown, move || {
        let ctx = ctx.clone();
        async move {
            probe_once(&ctx).await;
        }
    });
}

async fn probe_once(ctx: &Arc<ReplicaContext>) {
    let coordinator = match ctx.coordinator.current() {
        CurrentCoordinator::Me => return,
        CurrentCoordinator::Other(name) => name,
        // No coordinator, or a bid that never resolved: elect.
        CurrentCoordinator::Unknown => {
            start_election(ctx).await;
            return;
        }
    };

    let peer = ctx
        .peers
        .lock()
        .expect("peer table mutex guard poison")
        .get(&coordinator);
    let Some(peer) = peer else {
        slog::warn!(
            ctx.logger,
            "Coordinator '{}' is gone from the directory; starting election",
            coordinator
        );
        start_election(ctx).await;
        return;
    };

    let ping = Envelope::new("ping", envelope_data(json!({"from": ctx.name})), ctx.clock.tick());
    match ctx.conns.call(&peer.endpoint, &ping, ctx.opts.ping_timeout).await {
        Ok(reply) => ctx.observe_reply(&reply),
        Err(e) => {
            slog::warn!(
                ctx.logger,
                "Coordinator '{}' unreachable ({}); starting election",
                coordinator,
                e
            );
            start_election(ctx).await;
        }
    }
}

/// One bully round. Strength is a lower rank — the longest-registered
/// replica holds the authoritative log, so it must end up coordinating.
/// Bids go to every stronger peer; any acknowledgement ends our bid, and
/// total silence means we are the strongest survivor and announce
/// ourselves.
pub(crate) async fn start_election(ctx: &Arc<ReplicaContext>) {
    ctx.coordinator.transition_to_candidate();

    let targets = ctx
        .peers
        .lock()
        .expect("peer table mutex guard poison")
        .stronger_than(ctx.rank());
    slog::info!(
        ctx.logger,
        "Starting election: {} stronger peer(s) to challenge",
        targets.len()
    );

    let mut acknowledged = false;
    for target in targets {
        let bid = Envelope::new(
            "election",
            envelope_data(json!({"from": ctx.name})),
            ctx.clock.tick(),
        );
        match ctx.conns.call(&target.endpoint, &bid, ctx.opts.election_timeout).await {
            Ok(reply) => {
                ctx.observe_reply(&reply);
                slog::info!(
                    ctx.logger,
                    "'{}' (rank {}) acknowledged; standing down",
                    target.name,
                    target.rank
                );
                acknowledged = true;
                break;
            }
            Err(e) => {
                slog::debug!(ctx.logger, "No answer from '{}': {}", target.name, e);
            }
        }
    }

    if acknowledged {
        // Stay Candidate; the winner's announcement arrives on "servers",
        // and if it never does the next probe retries the election.
        return;
    }

    declare_coordinator(ctx).await;
}

async fn declare_coordinator(ctx: &Arc<ReplicaContext>) {
    ctx.coordinator.transition_to_leader();
    slog::info!(ctx.logger, "No stronger peer answered; '{}' is coordinator", ctx.name);

    let announcement = Envelope::new(
        "election",
        envelope_data(json!({
            "coordinator": ctx.name,
            "rank": ctx.rank(),
            "endpoint": ctx.endpoint,
        })),
        ctx.clock.tick(),
    );
    if let Err(e) = ctx.publisher.publish("servers", &announcement).await {
        slog::warn!(ctx.logger, "Could not announce coordinatorship: {}", e);
    }
}

/// Startup rule, same direction as the bully: the lowest rank in the
/// directory's view (ourselves included) is the provisional coordinator.
/// A fresh replica therefore syncs from the longest-lived one instead of
/// anointing itself.
pub(crate) fn choose_initial_coordinator(ctx: &ReplicaContext) {
    let strongest = ctx
        .peers
        .lock()
        .expect("peer table mutex guard poison")
        .strongest();

    let coordinator = match strongest {
        Some(peer) if peer.rank < ctx.rank() => peer.name,
        _ => ctx.name.clone(),
    };

    slog::info!(ctx.logger, "Provisional coordinator: '{}'", coordinator);
    ctx.coordinator.accept_coordinator(&coordinator);
}
