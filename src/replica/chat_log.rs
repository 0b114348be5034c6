use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashSet};

/// One durable state change. `id` is unique per entry; applying the same id
/// twice is a no-op, which is what makes best-effort replication safe.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct LogEntry {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: EntryKind,
    #[serde(default)]
    pub timestamp: String,
    #[serde(default)]
    pub clock: u64,
    #[serde(default)]
    pub data: Map<String, Value>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    UserCreated,
    ChannelCreated,
    MessagePublished,
    DirectMessage,
    Subscribed,
    Unsubscribed,
}

/// The projections rebuilt by replaying the log. BTree collections so two
/// replicas that applied the same entries serialize identically.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChatState {
    pub users: BTreeSet<String>,
    pub channels: BTreeSet<String>,
    pub subscriptions: BTreeMap<String, BTreeSet<String>>,
}

/// Append-only log plus its projections. Entries are never mutated or
/// removed below the current length; the only wholesale replacement is
/// startup catch-up from the coordinator.
pub struct ChatLog {
    entries: Vec<LogEntry>,
    seen: HashSet<String>,
    state: ChatState,
}

impl ChatLog {
    pub fn new() -> Self {
        ChatLog {
            entries: Vec::new(),
            seen: HashSet::new(),
            state: ChatState::default(),
        }
    }

    /// Rebuild from a persisted or synced sequence, deduplicating by id and
    /// keeping first occurrences in order.
    pub fn from_entries(entries: Vec<LogEntry>) -> Self {
        let mut log = ChatLog::new();
        for entry in entries {
            log.apply(entry);
        }
        log
    }

    /// Append and project. Returns false (and changes nothing) for a
    /// duplicate id.
    pub fn apply(&mut self, entry: LogEntry) -> bool {
        if !self.seen.insert(entry.id.clone()) {
            return false;
        }

        Self::project(&mut self.state, &entry);
        self.entries.push(entry);
        true
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn state(&self) -> &ChatState {
        &self.state
    }

    fn project(state: &mut ChatState, entry: &LogEntry) {
        let field = |key: &str| entry.data.get(key).and_then(Value::as_str).map(str::to_string);

        match entry.kind {
            EntryKind::UserCreated => {
                if let Some(user) = field("user") {
                    state.users.insert(user);
                }
            }
            EntryKind::ChannelCreated => {
                if let Some(name) = field("name") {
                    state.channels.insert(name);
                }
            }
            EntryKind::Subscribed => {
                if let (Some(channel), Some(user)) = (field("channel"), field("user")) {
                    state.subscriptions.entry(channel).or_default().insert(user);
                }
            }
            EntryKind::Unsubscribed => {
                if let (Some(channel), Some(user)) = (field("channel"), field("user")) {
                    if let Some(subscribers) = state.subscriptions.get_mut(&channel) {
                        subscribers.remove(&user);
                        if subscribers.is_empty() {
                            state.subscriptions.remove(&channel);
                        }
                    }
                }
            }
            // Message entries are history, not projection state.
            EntryKind::MessagePublished | EntryKind::DirectMessage => {}
        }
    }
}

impl Default for ChatLog {
    fn default() -> Self {
        Self::new()
    }
}
