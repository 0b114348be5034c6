use crate::replica::context::ReplicaContext;
use crate::replica::directory_client::DirectoryClient;
use crate::shutdown::ShutdownSignal;
use crate::timers::{self, Clock};
use std::sync::Arc;

/// The presence loop: heartbeat the directory every period, then refresh
/// the peer table from a `list` call so elections only target replicas the
/// directory still believes in. Failures are logged and the loop keeps
/// retrying; the directory being down never stops a replica.
pub(crate) fn spawn_heartbeat_loop<C>(
    ctx: Arc<ReplicaContext>,
    directory: Arc<DirectoryClient>,
    clock: C,
    shutdown: ShutdownSignal,
) where
    C: Clock + Send + Sync + 'static,
{
    let period = ctx.opts.heartbeat_period;
    let _ticker = timers::spawn_ticker(period, clock, shutdown, move || {
        let ctx = ctx.clone();
        let directory = directory.clone();
        async move {
            beat_once(&ctx, &directory).await;
        }
    });
}

pub(crate) async fn beat_once(ctx: &ReplicaContext, directory: &DirectoryClient) {
    if let Err(e) = directory.heartbeat(&ctx.name, &ctx.endpoint).await {
        slog::warn!(ctx.logger, "Heartbeat to directory failed: {}", e);
        return;
    }

    match directory.list().await {
        Ok(peers) => {
            // A directory restart renumbers everyone; adopt whatever rank
            // it now has on file for us.
            if let Some(me) = peers.iter().find(|p| p.name == ctx.name) {
                ctx.set_rank(me.rank);
            }
            ctx.peers
                .lock()
                .expect("peer table mutex guard poison")
                .replace_all(peers);
        }
        Err(e) => {
            slog::warn!(ctx.logger, "Directory list refresh failed: {}", e);
        }
    }
}
