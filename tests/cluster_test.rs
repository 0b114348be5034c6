//! End-to-end tests wiring real components over localhost TCP with the
//! protocol timings shrunk to millisecond scales.

use fleetchat::{
    envelope_data, start_directory, start_forwarder, start_replica, start_router, test_logger,
    DirectoryConfig, DirectoryHandle, Envelope, EntryKind, ForwarderConfig, ForwarderHandle,
    LamportClock, Options, ReplicaConfig, RequestConnection, RouterConfig, Subscriber,
};
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::{sleep, Duration, Instant};

const CALL_TIMEOUT: Duration = Duration::from_secs(1);

fn fast_options() -> Options {
    Options {
        heartbeat_period: Some(Duration::from_millis(150)),
        coord_probe_period: Some(Duration::from_millis(200)),
        ping_timeout: Some(Duration::from_millis(100)),
        election_timeout: Some(Duration::from_millis(150)),
        sync_timeout: Some(Duration::from_millis(500)),
        reap_period: Some(Duration::from_millis(150)),
        liveness_window: Some(Duration::from_millis(600)),
        directory_timeout: Some(Duration::from_millis(500)),
    }
}

async fn start_backbone() -> (DirectoryHandle, ForwarderHandle) {
    let directory = start_directory(
        test_logger(),
        DirectoryConfig {
            bind_addr: "tcp://127.0.0.1:0".to_string(),
            options: fast_options(),
        },
    )
    .await
    .expect("directory should start");

    let forwarder = start_forwarder(
        test_logger(),
        ForwarderConfig {
            xsub_addr: "tcp://127.0.0.1:0".to_string(),
            xpub_addr: "tcp://127.0.0.1:0".to_string(),
        },
    )
    .await
    .expect("forwarder should start");

    (directory, forwarder)
}

fn replica_config(
    name: &str,
    directory: &DirectoryHandle,
    forwarder: &ForwarderHandle,
    data_dir: &std::path::Path,
    broker_dealer_addr: Option<String>,
) -> ReplicaConfig {
    ReplicaConfig {
        name: name.to_string(),
        endpoint: "tcp://127.0.0.1:0".to_string(),
        ref_addr: directory.endpoint.clone(),
        proxy_pub_addr: forwarder.xsub_endpoint.clone(),
        proxy_sub_addr: forwarder.xpub_endpoint.clone(),
        broker_dealer_addr,
        data_dir: data_dir.to_path_buf(),
        options: fast_options(),
    }
}

async fn call(endpoint: &str, service: &str, data: serde_json::Value, clock: &LamportClock) -> Envelope {
    let mut conn = RequestConnection::new(test_logger(), endpoint);
    let request = Envelope::new(service, envelope_data(data), clock.tick());
    let reply = conn
        .call(&request, CALL_TIMEOUT)
        .await
        .unwrap_or_else(|e| panic!("call '{}' to {} failed: {}", service, endpoint, e));
    clock.observe(reply.clock);
    reply
}

/// Poll until `predicate` holds or the deadline passes.
async fn wait_until<F: FnMut() -> bool>(what: &str, deadline: Duration, mut predicate: F) {
    let give_up = Instant::now() + deadline;
    loop {
        if predicate() {
            return;
        }
        assert!(Instant::now() < give_up, "timed out waiting for: {}", what);
        sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test]
async fn directory_assigns_stable_ranks_and_evicts_silent_replicas() {
    let (directory, _forwarder) = start_backbone().await;
    let clock = LamportClock::new();

    let a = call(
        &directory.endpoint,
        "rank",
        json!({"user": "a", "endpoint": "tcp://a:7001"}),
        &clock,
    )
    .await;
    assert_eq!(a.service, "ref");
    assert_eq!(a.data.get("rank").and_then(|v| v.as_u64()), Some(1));

    // Re-announcing keeps the rank.
    let a_again = call(
        &directory.endpoint,
        "rank",
        json!({"user": "a", "endpoint": "tcp://a:7001"}),
        &clock,
    )
    .await;
    assert_eq!(a_again.data.get("rank").and_then(|v| v.as_u64()), Some(1));

    let b = call(
        &directory.endpoint,
        "rank",
        json!({"user": "b", "endpoint": "tcp://b:7002"}),
        &clock,
    )
    .await;
    assert_eq!(b.data.get("rank").and_then(|v| v.as_u64()), Some(2));

    // Nobody heartbeats: liveness window + reap period later, both are gone.
    sleep(Duration::from_millis(1200)).await;
    let listing = call(&directory.endpoint, "list", json!({}), &clock).await;
    let list = listing.data.get("list").and_then(|v| v.as_array()).cloned().unwrap_or_default();
    assert!(list.is_empty(), "expected empty list, got {:?}", list);

    // Ranks are consumed, never reissued.
    let a_back = call(
        &directory.endpoint,
        "rank",
        json!({"user": "a", "endpoint": "tcp://a:7001"}),
        &clock,
    )
    .await;
    assert_eq!(a_back.data.get("rank").and_then(|v| v.as_u64()), Some(3));
}

#[tokio::test]
async fn directory_answers_malformed_bytes_with_an_error_envelope() {
    let (directory, _forwarder) = start_backbone().await;

    let addr = directory.endpoint.strip_prefix("tcp://").expect("tcp endpoint").to_string();
    let mut stream = tokio::net::TcpStream::connect(&addr).await.expect("connect");

    // One frame of garbage, hand-rolled: [count=1][len][bytes].
    let garbage = b"\xff\xfenot-an-envelope";
    let mut message = Vec::new();
    message.extend_from_slice(&1u32.to_be_bytes());
    message.extend_from_slice(&(garbage.len() as u32).to_be_bytes());
    message.extend_from_slice(garbage);
    stream.write_all(&message).await.expect("send garbage");

    let mut count_buf = [0u8; 4];
    stream.read_exact(&mut count_buf).await.expect("reply frame count");
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await.expect("reply frame len");
    let mut payload = vec![0u8; u32::from_be_bytes(len_buf) as usize];
    stream.read_exact(&mut payload).await.expect("reply payload");

    let reply = fleetchat::decode(&payload).expect("valid envelope even for garbage input");
    assert_eq!(reply.service, "ref");
    assert!(reply.data.contains_key("error"));

    // And the endpoint is still serving.
    let clock = LamportClock::new();
    let listing = call(&directory.endpoint, "list", json!({}), &clock).await;
    assert!(listing.data.contains_key("list"));
}

#[tokio::test]
async fn publish_fans_out_to_subscribers_and_replicates() {
    let (directory, forwarder) = start_backbone().await;
    let dir_a = tempfile::tempdir().expect("tempdir");
    let dir_b = tempfile::tempdir().expect("tempdir");

    let a = start_replica(test_logger(), replica_config("a", &directory, &forwarder, dir_a.path(), None))
        .await
        .expect("replica a");
    let b = start_replica(test_logger(), replica_config("b", &directory, &forwarder, dir_b.path(), None))
        .await
        .expect("replica b");

    let mut subscriber = Subscriber::connect(&forwarder.xpub_endpoint, &["geral"])
        .await
        .expect("subscriber");
    // Let the subscription and the replicas' own loops settle.
    sleep(Duration::from_millis(300)).await;

    let clock = LamportClock::new();
    let reply = call(
        a.endpoint(),
        "publish",
        json!({"user": "alice", "channel": "geral", "message": "hi"}),
        &clock,
    )
    .await;
    assert_eq!(reply.str_field("status"), Some("ok"));

    let (topic, event) = tokio::time::timeout(Duration::from_secs(2), subscriber.next())
        .await
        .expect("fan-out within deadline")
        .expect("subscription healthy")
        .expect("stream open");
    assert_eq!(topic, "geral");
    assert_eq!(event.service, "publish");
    assert_eq!(event.str_field("message"), Some("hi"));
    assert_eq!(event.str_field("user"), Some("alice"));

    // Replication is asynchronous through the forwarder.
    wait_until("replica b to apply the replicated entry", Duration::from_secs(2), || {
        b.log_len() == 1
    })
    .await;
    let entries = b.log_entries();
    assert_eq!(entries[0].kind, EntryKind::MessagePublished);
    assert_eq!(entries[0].data.get("message").and_then(|v| v.as_str()), Some("hi"));
    assert_eq!(a.log_len(), 1);
}

#[tokio::test]
async fn router_carries_requests_to_workers_and_replies_back() {
    let (directory, forwarder) = start_backbone().await;
    let router = start_router(
        test_logger(),
        RouterConfig {
            frontend_addr: "tcp://127.0.0.1:0".to_string(),
            backend_addr: "tcp://127.0.0.1:0".to_string(),
        },
    )
    .await
    .expect("router");

    let dir_a = tempfile::tempdir().expect("tempdir");
    let dir_b = tempfile::tempdir().expect("tempdir");
    let a = start_replica(
        test_logger(),
        replica_config("a", &directory, &forwarder, dir_a.path(), Some(router.backend_endpoint.clone())),
    )
    .await
    .expect("replica a");
    let b = start_replica(
        test_logger(),
        replica_config("b", &directory, &forwarder, dir_b.path(), Some(router.backend_endpoint.clone())),
    )
    .await
    .expect("replica b");

    // Workers connect in the background.
    sleep(Duration::from_millis(300)).await;

    let clock = LamportClock::new();
    let reply = call(
        &router.frontend_endpoint,
        "channel",
        json!({"name": "random"}),
        &clock,
    )
    .await;
    assert_eq!(reply.str_field("status"), Some("ok"));

    // Whichever worker served it, replication makes both agree.
    wait_until("both replicas to know the channel", Duration::from_secs(2), || {
        a.chat_state().channels.contains("random") && b.chat_state().channels.contains("random")
    })
    .await;

    // A handful of further requests all round-trip.
    for _ in 0..4 {
        let listing = call(&router.frontend_endpoint, "channels", json!({}), &clock).await;
        let channels = listing.data.get("channels").and_then(|v| v.as_array()).cloned();
        assert_eq!(channels, Some(vec![json!("random")]));
    }
}

#[tokio::test]
async fn fresh_replica_catches_up_from_the_coordinator() {
    let (directory, forwarder) = start_backbone().await;
    let dir_a = tempfile::tempdir().expect("tempdir");

    let a = start_replica(test_logger(), replica_config("a", &directory, &forwarder, dir_a.path(), None))
        .await
        .expect("replica a");
    assert!(a.is_coordinator(), "first replica coordinates alone");

    let clock = LamportClock::new();
    call(a.endpoint(), "login", json!({"user": "alice"}), &clock).await;
    call(a.endpoint(), "channel", json!({"name": "geral"}), &clock).await;
    call(
        a.endpoint(),
        "subscribe",
        json!({"user": "alice", "channel": "geral"}),
        &clock,
    )
    .await;
    for i in 0..3 {
        call(
            a.endpoint(),
            "publish",
            json!({"user": "alice", "channel": "geral", "message": format!("msg-{}", i)}),
            &clock,
        )
        .await;
    }
    assert_eq!(a.log_len(), 6);

    // D registers, sees A as the lowest rank, and pulls A's log during
    // startup, before its own loops even spin up.
    let dir_d = tempfile::tempdir().expect("tempdir");
    let d = start_replica(test_logger(), replica_config("d", &directory, &forwarder, dir_d.path(), None))
        .await
        .expect("replica d");

    assert_eq!(d.current_coordinator(), Some("a".to_string()));
    assert_eq!(d.log_len(), a.log_len());
    assert_eq!(d.chat_state(), a.chat_state());
    assert!(d.chat_state().users.contains("alice"));
}

#[tokio::test]
async fn coordinator_loss_elects_the_strongest_survivor() {
    let (directory, forwarder) = start_backbone().await;
    let dir_a = tempfile::tempdir().expect("tempdir");
    let dir_b = tempfile::tempdir().expect("tempdir");
    let dir_c = tempfile::tempdir().expect("tempdir");

    let a = start_replica(test_logger(), replica_config("a", &directory, &forwarder, dir_a.path(), None))
        .await
        .expect("replica a");
    let b = start_replica(test_logger(), replica_config("b", &directory, &forwarder, dir_b.path(), None))
        .await
        .expect("replica b");
    let c = start_replica(test_logger(), replica_config("c", &directory, &forwarder, dir_c.path(), None))
        .await
        .expect("replica c");

    assert!(a.is_coordinator());
    assert_eq!(b.current_coordinator(), Some("a".to_string()));
    assert_eq!(c.current_coordinator(), Some("a".to_string()));

    // Kill the coordinator. Probes fail, the bully runs, and the lowest
    // surviving rank (b) announces itself; c accepts the announcement.
    drop(a);
    wait_until("b to win the election", Duration::from_secs(5), || b.is_coordinator()).await;
    wait_until("c to accept b as coordinator", Duration::from_secs(5), || {
        c.current_coordinator() == Some("b".to_string()) && !c.is_coordinator()
    })
    .await;
}

#[tokio::test]
async fn replica_restart_recovers_its_log_from_disk() {
    let (directory, forwarder) = start_backbone().await;
    let data_dir = tempfile::tempdir().expect("tempdir");

    let clock = LamportClock::new();
    {
        let a = start_replica(test_logger(), replica_config("a", &directory, &forwarder, data_dir.path(), None))
            .await
            .expect("replica a");
        call(a.endpoint(), "channel", json!({"name": "durable"}), &clock).await;
        call(a.endpoint(), "login", json!({"user": "alice"}), &clock).await;
        assert_eq!(a.log_len(), 2);
    }

    // Same name, same data directory: state is back before any sync could
    // have happened (there is no other replica to sync from).
    let a = start_replica(test_logger(), replica_config("a", &directory, &forwarder, data_dir.path(), None))
        .await
        .expect("replica a restarted");
    assert_eq!(a.log_len(), 2);
    assert!(a.chat_state().channels.contains("durable"));
    assert!(a.chat_state().users.contains("alice"));
}
