mod config;
mod directory;
mod forwarder;
mod logging;
mod replica;
mod router;
mod shutdown;
mod timers;
mod transport;
mod wire;

pub use config::ConfigError;
pub use config::DirectoryConfig;
pub use config::ForwarderConfig;
pub use config::Options;
pub use config::ReplicaConfig;
pub use config::RouterConfig;
pub use directory::start_directory;
pub use directory::DirectoryHandle;
pub use directory::DirectoryStartError;
pub use directory::ReplicaRecord;
pub use forwarder::start_forwarder;
pub use forwarder::ForwarderHandle;
pub use forwarder::ForwarderStartError;
pub use logging::root_logger;
pub use logging::test_logger;
pub use replica::start_replica;
pub use replica::ChatState;
pub use replica::EntryKind;
pub use replica::LogEntry;
pub use replica::PeerInfo;
pub use replica::ReplicaHandle;
pub use replica::ReplicaStartError;
pub use router::start_router;
pub use router::RouterHandle;
pub use router::RouterStartError;
pub use transport::Publisher;
pub use transport::RequestConnection;
pub use transport::RequestError;
pub use transport::Subscriber;
pub use transport::TransportError;
pub use wire::decode;
pub use wire::encode;
pub use wire::envelope_data;
pub use wire::DecodeError;
pub use wire::EncodeError;
pub use wire::Envelope;
pub use wire::LamportClock;
