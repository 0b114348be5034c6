use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// What the directory knows about one replica. `name` is the primary key;
/// `rank` is assigned exactly once and never reused. `last_seen` is a unix
/// timestamp in milliseconds; it never leaves this process.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReplicaRecord {
    pub name: String,
    pub rank: u64,
    pub endpoint: String,
    pub last_seen: i64,
}

/// Registry is the directory's whole state: the record map plus the
/// monotonic rank counter. Pure bookkeeping; the wire loop lives in
/// `service.rs`.
pub(super) struct Registry {
    logger: slog::Logger,
    records: HashMap<String, ReplicaRecord>,
    next_rank: u64,
}

impl Registry {
    pub(super) fn new(logger: slog::Logger) -> Self {
        Registry {
            logger,
            records: HashMap::new(),
            next_rank: 1,
        }
    }

    /// Shared presence update behind both `rank` and `heartbeat`: admit the
    /// replica if unknown (a replica that skipped registration still gets a
    /// rank), refresh `last_seen`, adopt a changed endpoint. Returns the
    /// replica's rank.
    pub(super) fn observe(&mut self, name: &str, endpoint: &str, now: i64) -> u64 {
        if let Some(record) = self.records.get_mut(name) {
            record.last_seen = now;
            if !endpoint.is_empty() && endpoint != record.endpoint {
                slog::info!(
                    self.logger,
                    "Replica '{}' re-announced at '{}' (was '{}')",
                    name,
                    endpoint,
                    record.endpoint
                );
                record.endpoint = endpoint.to_string();
            }
            return record.rank;
        }

        let rank = self.next_rank;
        self.next_rank += 1;
        slog::info!(self.logger, "Registered replica '{}' rank={} endpoint='{}'", name, rank, endpoint);
        self.records.insert(
            name.to_string(),
            ReplicaRecord {
                name: name.to_string(),
                rank,
                endpoint: endpoint.to_string(),
                last_seen: now,
            },
        );

        rank
    }

    pub(super) fn list(&self) -> Vec<ReplicaRecord> {
        self.records.values().cloned().collect()
    }

    /// Evict every record silent for longer than the liveness window.
    /// Ranks are consumed, never returned.
    pub(super) fn reap(&mut self, now: i64, liveness_window_ms: i64) {
        let logger = &self.logger;
        self.records.retain(|name, record| {
            let alive = now - record.last_seen <= liveness_window_ms;
            if !alive {
                slog::info!(logger, "Evicting silent replica '{}' (rank {})", name, record.rank);
            }
            alive
        });
    }
}
