use crate::replica::peers::PeerInfo;
use crate::transport::{RequestConnection, RequestError};
use crate::wire::{envelope_data, Envelope, LamportClock};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::Duration;

#[derive(Debug, thiserror::Error)]
pub(crate) enum DirectoryCallError {
    #[error("directory request failed: {0}")]
    Request(#[from] RequestError),
    #[error("directory reply missing field '{0}'")]
    MalformedReply(&'static str),
}

/// Client side of the directory protocol: registration, heartbeats, and
/// list queries, all over one cached request connection.
pub(crate) struct DirectoryClient {
    logger: slog::Logger,
    clock: Arc<LamportClock>,
    conn: Mutex<RequestConnection>,
    timeout: Duration,
}

impl DirectoryClient {
    pub(crate) fn new(
        logger: slog::Logger,
        clock: Arc<LamportClock>,
        ref_addr: &str,
        timeout: Duration,
    ) -> Self {
        let conn = RequestConnection::new(logger.clone(), ref_addr);
        DirectoryClient {
            logger,
            clock,
            conn: Mutex::new(conn),
            timeout,
        }
    }

    /// First contact: announce name + endpoint, receive our rank.
    pub(crate) async fn register(&self, name: &str, endpoint: &str) -> Result<u64, DirectoryCallError> {
        let reply = self
            .call("rank", envelope_data(json!({"user": name, "endpoint": endpoint})))
            .await?;

        reply
            .data
            .get("rank")
            .and_then(serde_json::Value::as_u64)
            .ok_or(DirectoryCallError::MalformedReply("rank"))
    }

    pub(crate) async fn heartbeat(&self, name: &str, endpoint: &str) -> Result<(), DirectoryCallError> {
        self.call("heartbeat", envelope_data(json!({"user": name, "endpoint": endpoint})))
            .await?;
        Ok(())
    }

    pub(crate) async fn list(&self) -> Result<Vec<PeerInfo>, DirectoryCallError> {
        let reply = self.call("list", envelope_data(json!({}))).await?;

        let raw_list = reply
            .data
            .get("list")
            .cloned()
            .ok_or(DirectoryCallError::MalformedReply("list"))?;

        // Individually malformed records are skipped, not fatal; the
        // directory answers for replicas we may predate.
        let mut peers = Vec::new();
        if let serde_json::Value::Array(items) = raw_list {
            for item in items {
                match serde_json::from_value::<PeerInfo>(item) {
                    Ok(peer) => peers.push(peer),
                    Err(e) => slog::debug!(self.logger, "Skipping malformed list item: {}", e),
                }
            }
        }

        Ok(peers)
    }

    async fn call(
        &self,
        service: &str,
        data: serde_json::Map<String, serde_json::Value>,
    ) -> Result<Envelope, DirectoryCallError> {
        let request = Envelope::new(service, data, self.clock.tick());
        let reply = self.conn.lock().await.call(&request, self.timeout).await?;
        self.clock.observe(reply.clock);
        Ok(reply)
    }
}
