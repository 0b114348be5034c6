mod registry;
mod service;

pub use registry::ReplicaRecord;
pub use service::start_directory;
pub use service::DirectoryHandle;
pub use service::DirectoryStartError;
