mod chat_log;
mod context;
mod coordinator;
mod directory_client;
mod election;
mod heartbeat;
mod peers;
mod service;
mod storage;
mod sub_loop;
mod sync;
mod wiring;

pub use chat_log::ChatState;
pub use chat_log::EntryKind;
pub use chat_log::LogEntry;
pub use peers::PeerInfo;
pub use wiring::start_replica;
pub use wiring::ReplicaHandle;
pub use wiring::ReplicaStartError;
