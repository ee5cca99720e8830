// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use loki_write::proto::PushRequest;
use loki_write::{
    label_set, wal, ClientError, Config, Consumer, Entry, Manager, Registry,
    RESERVED_LABEL_TENANT_ID,
};
use mockito::{Mock, Server, ServerGuard};
use reqwest::Url;
use tokio::time::{sleep, timeout, Duration};

const PUSH_PATH: &str = "/loki/api/v1/push";

type Captured = Arc<Mutex<Vec<PushRequest>>>;

fn config(server: &ServerGuard) -> Config {
    let mut config = Config::new(Url::parse(&format!("{}{PUSH_PATH}", server.url())).unwrap());
    config.batch_wait = Duration::from_millis(50);
    config.backoff.min_backoff = Duration::from_millis(1);
    config.backoff.max_backoff = Duration::from_millis(5);
    config
}

fn entry(line: &str) -> Entry {
    Entry::new(label_set([("app", "test")]), SystemTime::now(), line)
}

/// Accepts pushes and keeps every decoded request.
async fn capturing_mock(server: &mut ServerGuard, captured: &Captured) -> Mock {
    let sink = Arc::clone(captured);
    server
        .mock("POST", PUSH_PATH)
        .match_header("content-type", "application/x-protobuf")
        .match_header("content-encoding", "snappy")
        .with_status(204)
        .with_body_from_request(move |request| {
            let body = request.body().unwrap();
            sink.lock()
                .unwrap()
                .push(PushRequest::decode_snappy(body).unwrap());
            Vec::new()
        })
        .expect_at_least(1)
        .create_async()
        .await
}

fn lines(captured: &Captured) -> Vec<String> {
    captured
        .lock()
        .unwrap()
        .iter()
        .flat_map(|request| request.streams.iter())
        .flat_map(|stream| stream.entries.iter())
        .map(|entry| entry.line.clone())
        .collect()
}

async fn wait_for_lines(captured: &Captured, count: usize) {
    let waiting = async {
        while lines(captured).len() < count {
            sleep(Duration::from_millis(10)).await;
        }
    };
    if timeout(Duration::from_secs(5), waiting).await.is_err() {
        panic!("timed out waiting for {count} delivered lines");
    }
}

async fn wait_for_hit(mock: &Mock) {
    let waiting = async {
        while !mock.matched_async().await {
            sleep(Duration::from_millis(10)).await;
        }
    };
    if timeout(Duration::from_secs(5), waiting).await.is_err() {
        panic!("timed out waiting for a push");
    }
}

async fn send(manager: &Manager, lines: &[&str]) {
    let tx = manager.chan();
    for line in lines {
        tx.send(entry(line)).await.unwrap();
    }
}

#[tokio::test]
async fn full_batches_are_sent_separately() {
    let mut server = Server::new_async().await;
    let captured = Captured::default();
    let mock = capturing_mock(&mut server, &captured).await;

    let mut config = config(&server);
    config.batch_size = 10;
    let manager = Manager::new(&Registry::new(), wal::Config::default(), vec![config]).unwrap();
    send(&manager, &["line1", "line2", "line3"]).await;
    manager.stop().await;

    mock.assert_async().await;
    let requests = captured.lock().unwrap().clone();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].entry_count(), 2);
    assert_eq!(requests[1].entry_count(), 1);
    assert_eq!(lines(&captured), ["line1", "line2", "line3"]);
}

#[tokio::test]
async fn server_errors_are_retried_then_dropped() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", PUSH_PATH)
        .with_status(500)
        .with_body("ingester unavailable")
        .expect(3)
        .create_async()
        .await;

    let registry = Registry::new();
    let mut config = config(&server);
    config.backoff.max_retries = 3;
    let manager = Manager::new(&registry, wal::Config::default(), vec![config]).unwrap();
    send(&manager, &["doomed"]).await;
    manager.stop().await;

    mock.assert_async().await;
    let encoded = registry.encode().unwrap();
    assert!(
        encoded.contains(r#"reason="ingester_error"} 1"#),
        "{encoded}"
    );
    assert!(encoded.contains(r#"reason="rate_limited"} 0"#));
}

#[tokio::test]
async fn client_errors_are_dropped_without_retry() {
    let dir = tempfile::tempdir().unwrap();
    let mut server = Server::new_async().await;
    let rejecting = server
        .mock("POST", PUSH_PATH)
        .with_status(400)
        .with_body("entry too far behind")
        .expect(1)
        .create_async()
        .await;

    let registry = Registry::new();
    let mut config = config(&server);
    config.backoff.max_retries = 5;
    let host = config.host();
    let first = Manager::new(&registry, wal_config(dir.path()), vec![config.clone()]).unwrap();
    send(&first, &["malformed"]).await;
    wait_for_hit(&rejecting).await;
    // let the marker see the rejected segment as idle
    sleep(Duration::from_millis(200)).await;
    first.stop_and_drain().await;

    rejecting.assert_async().await;
    let encoded = registry.encode().unwrap();
    assert!(
        encoded.contains(r#"reason="ingester_error"} 1"#),
        "{encoded}"
    );
    assert!(
        encoded.contains(&format!(
            "loki_write_batch_retries_total{{host=\"{host}\",tenant=\"\"}} 0"
        )),
        "{encoded}"
    );

    // the rejected batch counts as handled, a restart does not send it again
    rejecting.remove_async().await;
    let captured = Captured::default();
    let _accepting = capturing_mock(&mut server, &captured).await;
    let second = Manager::new(&Registry::new(), wal_config(dir.path()), vec![config]).unwrap();
    send(&second, &["valid"]).await;
    second.stop_and_drain().await;

    assert_eq!(lines(&captured), ["valid"]);
}

#[tokio::test]
async fn rate_limited_batches_can_be_dropped_immediately() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", PUSH_PATH)
        .with_status(429)
        .expect(1)
        .create_async()
        .await;

    let registry = Registry::new();
    let mut config = config(&server);
    config.backoff.max_retries = 5;
    config.drop_rate_limited_batches = true;
    let manager = Manager::new(&registry, wal::Config::default(), vec![config]).unwrap();
    send(&manager, &["throttled"]).await;
    manager.stop().await;

    mock.assert_async().await;
    let encoded = registry.encode().unwrap();
    assert!(encoded.contains(r#"reason="rate_limited"} 1"#), "{encoded}");
}

#[tokio::test]
async fn every_client_receives_every_entry() {
    let mut server = Server::new_async().await;
    let captured = Captured::default();
    let mock = capturing_mock(&mut server, &captured).await;

    let mut first = config(&server);
    first.name = Some("first".to_string());
    let mut second = config(&server);
    second.name = Some("second".to_string());
    let manager =
        Manager::new(&Registry::new(), wal::Config::default(), vec![first, second]).unwrap();
    assert_eq!(manager.client_names(), ["first", "second"]);

    send(&manager, &["shared"]).await;
    manager.stop().await;

    mock.assert_async().await;
    assert_eq!(lines(&captured), ["shared", "shared"]);
}

#[tokio::test]
async fn entries_of_a_stream_keep_their_order() {
    let mut server = Server::new_async().await;
    let captured = Captured::default();
    let _mock = capturing_mock(&mut server, &captured).await;

    let mut config = config(&server);
    config.batch_size = 32;
    config.queue.min_shards = 4;
    let manager = Manager::new(&Registry::new(), wal::Config::default(), vec![config]).unwrap();

    let expected: Vec<String> = (0..200).map(|i| format!("line-{i:03}")).collect();
    let refs: Vec<&str> = expected.iter().map(String::as_str).collect();
    send(&manager, &refs).await;
    manager.stop().await;

    assert_eq!(lines(&captured), expected);
}

#[tokio::test]
async fn tenant_label_selects_the_org_header() {
    let mut server = Server::new_async().await;
    let tenant_mock = server
        .mock("POST", PUSH_PATH)
        .match_header("X-Scope-OrgID", "team-a")
        .with_status(204)
        .expect(1)
        .create_async()
        .await;

    let mut config = config(&server);
    config.tenant_id = "default".to_string();
    let manager = Manager::new(&Registry::new(), wal::Config::default(), vec![config]).unwrap();
    manager
        .chan()
        .send(Entry::new(
            label_set([("app", "test"), (RESERVED_LABEL_TENANT_ID, "team-a")]),
            SystemTime::now(),
            "scoped",
        ))
        .await
        .unwrap();
    manager.stop().await;

    tenant_mock.assert_async().await;
}

#[tokio::test]
async fn invalid_client_lists_are_rejected() {
    let server = Server::new_async().await;
    let registry = Registry::new();

    assert!(matches!(
        Manager::new(&registry, wal::Config::default(), Vec::new()),
        Err(ClientError::NoClients)
    ));

    let config = config(&server);
    assert!(matches!(
        Manager::new(&registry, wal::Config::default(), vec![config.clone(), config]),
        Err(ClientError::DuplicateClient(_))
    ));
}

#[tokio::test]
async fn managers_can_share_a_registry() {
    let server = Server::new_async().await;
    let registry = Registry::new();
    let first = Manager::new(&registry, wal::Config::default(), vec![config(&server)]).unwrap();
    let second = Manager::new(&registry, wal::Config::default(), vec![config(&server)]).unwrap();
    first.stop().await;
    second.stop().await;
    assert!(registry.encode().unwrap().contains("loki_write_sent_entries"));
}

fn wal_config(dir: &std::path::Path) -> wal::Config {
    wal::Config {
        enabled: true,
        dir: dir.to_path_buf(),
        max_segment_age: Duration::from_millis(20),
        watch: wal::WatchConfig {
            min_read_frequency: Duration::from_millis(5),
            max_read_frequency: Duration::from_millis(50),
            drain_timeout: Duration::from_secs(5),
        },
    }
}

#[tokio::test]
async fn wal_delivers_every_entry_once() {
    let dir = tempfile::tempdir().unwrap();
    let mut server = Server::new_async().await;
    let captured = Captured::default();
    let _mock = capturing_mock(&mut server, &captured).await;

    let manager = Manager::new(
        &Registry::new(),
        wal_config(dir.path()),
        vec![config(&server)],
    )
    .unwrap();
    assert!(manager.wal_enabled());

    let expected: Vec<String> = (0..20).map(|i| format!("durable-{i}")).collect();
    let refs: Vec<&str> = expected.iter().map(String::as_str).collect();
    send(&manager, &refs).await;
    manager.stop_and_drain().await;

    assert_eq!(lines(&captured), expected);
}

#[tokio::test]
async fn restart_resumes_after_marked_segments() {
    let dir = tempfile::tempdir().unwrap();
    let mut server = Server::new_async().await;
    let captured = Captured::default();
    let _mock = capturing_mock(&mut server, &captured).await;

    let first = Manager::new(
        &Registry::new(),
        wal_config(dir.path()),
        vec![config(&server)],
    )
    .unwrap();
    send(&first, &["before-1", "before-2"]).await;
    wait_for_lines(&captured, 2).await;
    // let the marker see the delivered segment as idle
    sleep(Duration::from_millis(200)).await;
    first.stop_and_drain().await;
    captured.lock().unwrap().clear();

    let second = Manager::new(
        &Registry::new(),
        wal_config(dir.path()),
        vec![config(&server)],
    )
    .unwrap();
    send(&second, &["after"]).await;
    second.stop_and_drain().await;

    assert_eq!(lines(&captured), ["after"]);
}

#[tokio::test]
async fn undelivered_entries_are_replayed_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let mut server = Server::new_async().await;
    let failing = server
        .mock("POST", PUSH_PATH)
        .with_status(500)
        .expect_at_least(1)
        .create_async()
        .await;

    let mut config = config(&server);
    config.name = Some("durable".to_string());
    config.backoff.max_retries = 0;
    let mut impatient = config.clone();
    impatient.queue.drain_timeout = Duration::from_millis(100);
    let first = Manager::new(&Registry::new(), wal_config(dir.path()), vec![impatient]).unwrap();
    send(&first, &["pending-1", "pending-2", "pending-3"]).await;
    wait_for_hit(&failing).await;
    first.stop().await;
    failing.assert_async().await;

    failing.remove_async().await;
    let captured = Captured::default();
    let _accepting = capturing_mock(&mut server, &captured).await;
    let second = Manager::new(&Registry::new(), wal_config(dir.path()), vec![config]).unwrap();
    second.stop_and_drain().await;

    assert_eq!(lines(&captured), ["pending-1", "pending-2", "pending-3"]);
}
