use crate::config::OptionsValidated;
use crate::replica::chat_log::{ChatLog, ChatState, EntryKind, LogEntry};
use crate::replica::coordinator::CoordinatorState;
use crate::replica::peers::PeerTracker;
use crate::replica::storage::LogStorage;
use crate::transport::{ConnectionCache, Publisher};
use crate::wire::{Envelope, LamportClock};
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Everything the replica's loops and handlers share, threaded through by
/// `Arc` instead of process globals. Lock discipline: one mutex over log +
/// projections + their file, one over the peer table, one inside the
/// coordinator state, one inside the clock; all held only for short
/// critical sections and never across awaits.
pub(crate) struct ReplicaContext {
    pub(crate) logger: slog::Logger,
    pub(crate) name: String,
    rank: AtomicU64,
    pub(crate) endpoint: String,
    pub(crate) clock: Arc<LamportClock>,
    chat: Mutex<ChatStore>,
    pub(crate) coordinator: CoordinatorState,
    pub(crate) peers: Mutex<PeerTracker>,
    pub(crate) publisher: Publisher,
    pub(crate) conns: ConnectionCache,
    pub(crate) opts: OptionsValidated,
}

struct ChatStore {
    log: ChatLog,
    storage: LogStorage,
}

impl ReplicaContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        logger: slog::Logger,
        name: String,
        rank: u64,
        endpoint: String,
        clock: Arc<LamportClock>,
        log: ChatLog,
        storage: LogStorage,
        publisher: Publisher,
        opts: OptionsValidated,
    ) -> Self {
        let conns = ConnectionCache::new(logger.clone());
        ReplicaContext {
            logger,
            coordinator: CoordinatorState::new(name.clone()),
            name,
            rank: AtomicU64::new(rank),
            endpoint,
            clock,
            chat: Mutex::new(ChatStore { log, storage }),
            peers: Mutex::new(PeerTracker::new()),
            publisher,
            conns,
            opts,
        }
    }

    pub(crate) fn rank(&self) -> u64 {
        self.rank.load(Ordering::SeqCst)
    }

    /// The directory can renumber us (e.g. after it restarted and our
    /// heartbeat re-admitted us); the list refresh writes the new rank back.
    pub(crate) fn set_rank(&self, rank: u64) {
        let previous = self.rank.swap(rank, Ordering::SeqCst);
        if previous != rank {
            slog::info!(self.logger, "Rank changed {} -> {}", previous, rank);
        }
    }

    pub(crate) fn observe_reply(&self, reply: &Envelope) {
        self.clock.observe(reply.clock);
    }

    /// Append a local state change if `changes` says the projection would
    /// actually move, persist, and hand back the entry for replication.
    pub(crate) fn record_if_new<F>(&self, kind: EntryKind, data: Map<String, Value>, changes: F) -> Option<LogEntry>
    where
        F: FnOnce(&ChatState) -> bool,
    {
        let mut chat = self.chat.lock().expect("chat log mutex guard poison");
        if !changes(chat.log.state()) {
            return None;
        }

        let clock = self.clock.tick();
        let entry = LogEntry {
            id: format!("{}-{}", self.name, clock),
            kind,
            timestamp: chrono::Utc::now().to_rfc3339(),
            clock,
            data,
        };
        chat.log.apply(entry.clone());
        self.persist_locked(&mut chat);

        Some(entry)
    }

    /// Message traffic always appends; there is no projection to consult.
    pub(crate) fn record(&self, kind: EntryKind, data: Map<String, Value>) -> LogEntry {
        self.record_if_new(kind, data, |_| true)
            .expect("unconditional record cannot be a no-op")
    }

    /// Apply an entry received on the `replicate` topic. Returns false for
    /// an id we already hold.
    pub(crate) fn apply_replicated(&self, entry: LogEntry) -> bool {
        let mut chat = self.chat.lock().expect("chat log mutex guard poison");
        if !chat.log.apply(entry) {
            return false;
        }

        self.persist_locked(&mut chat);
        true
    }

    /// Startup catch-up: adopt the coordinator's log wholesale (deduplicated
    /// by id in its order) and rebuild projections from it.
    pub(crate) fn replace_log(&self, entries: Vec<LogEntry>) -> usize {
        let mut chat = self.chat.lock().expect("chat log mutex guard poison");
        chat.log = ChatLog::from_entries(entries);
        self.persist_locked(&mut chat);
        chat.log.len()
    }

    pub(crate) fn log_len(&self) -> usize {
        self.chat.lock().expect("chat log mutex guard poison").log.len()
    }

    pub(crate) fn log_entries(&self) -> Vec<LogEntry> {
        self.chat
            .lock()
            .expect("chat log mutex guard poison")
            .log
            .entries()
            .to_vec()
    }

    pub(crate) fn state_snapshot(&self) -> ChatState {
        self.chat
            .lock()
            .expect("chat log mutex guard poison")
            .log
            .state()
            .clone()
    }

    fn persist_locked(&self, chat: &mut ChatStore) {
        // In-memory state stays authoritative over a sick disk.
        if let Err(e) = chat.storage.persist(chat.log.entries()) {
            slog::warn!(self.logger, "Log persistence failed: {}", e);
        }
    }
}
