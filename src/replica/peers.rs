use serde::Deserialize;
use std::collections::HashMap;

/// Identity and location of one fleet member, as reported by the directory.
/// `endpoint` is the full URI; `addr` is accepted as its legacy alias.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct PeerInfo {
    pub name: String,
    pub rank: u64,
    #[serde(default, alias = "addr")]
    pub endpoint: String,
}

/// The replica's view of the fleet, refreshed from directory `list` calls
/// and patched by coordinator announcements. Includes this replica itself
/// once the directory lists it.
pub(crate) struct PeerTracker {
    peers: HashMap<String, PeerInfo>,
}

impl PeerTracker {
    pub(crate) fn new() -> Self {
        PeerTracker { peers: HashMap::new() }
    }

    pub(crate) fn replace_all(&mut self, peers: Vec<PeerInfo>) {
        self.peers = peers.into_iter().map(|p| (p.name.clone(), p)).collect();
    }

    pub(crate) fn upsert(&mut self, peer: PeerInfo) {
        self.peers.insert(peer.name.clone(), peer);
    }

    pub(crate) fn get(&self, name: &str) -> Option<PeerInfo> {
        self.peers.get(name).cloned()
    }

    pub(crate) fn contains(&self, name: &str) -> bool {
        self.peers.contains_key(name)
    }

    /// Election targets: strictly stronger members, where strength is a
    /// LOWER rank (the oldest registration carries the authoritative log).
    /// Excludes self because a rank never undercuts itself.
    pub(crate) fn stronger_than(&self, rank: u64) -> Vec<PeerInfo> {
        let mut targets: Vec<PeerInfo> = self.peers.values().filter(|p| p.rank < rank).cloned().collect();
        targets.sort_by_key(|p| p.rank);
        targets
    }

    /// The lowest-ranked member on record.
    pub(crate) fn strongest(&self) -> Option<PeerInfo> {
        self.peers.values().min_by_key(|p| p.rank).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(name: &str, rank: u64) -> PeerInfo {
        PeerInfo {
            name: name.to_string(),
            rank,
            endpoint: format!("tcp://{}:7001", name),
        }
    }

    #[test]
    fn stronger_than_filters_to_lower_ranks_and_sorts() {
        let mut tracker = PeerTracker::new();
        tracker.replace_all(vec![peer("a", 1), peer("c", 3), peer("b", 2)]);

        let targets = tracker.stronger_than(3);
        let names: Vec<&str> = targets.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert!(tracker.stronger_than(1).is_empty());
    }

    #[test]
    fn replace_all_drops_evicted_peers() {
        let mut tracker = PeerTracker::new();
        tracker.replace_all(vec![peer("a", 1), peer("b", 2)]);
        tracker.replace_all(vec![peer("b", 2)]);

        assert!(!tracker.contains("a"));
        assert_eq!(tracker.strongest().map(|p| p.name), Some("b".to_string()));
    }

    #[test]
    fn legacy_addr_alias_deserializes() {
        let peer: PeerInfo =
            serde_json::from_str(r#"{"name": "a", "rank": 1, "addr": "tcp://a:7001"}"#).expect("decode");
        assert_eq!(peer.endpoint, "tcp://a:7001");
    }
}
