// SPDX-License-Identifier: MIT OR Apache-2.0

//! End-to-end scenarios against in-process mock nodes: bootstrap over
//! CCCP and HTTP, NOT_MY_VBUCKET rerouting, timeout error precedence,
//! the SASL PLAIN guard, and the redirect cap.

use std::collections::HashMap;
use std::time::Duration;

use couchbase_client::confmon::ConfigEvent;
use couchbase_client::testkit::MockNode;
use couchbase_client::{CouchClient, CouchError, ErrorKind};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// A two-node config whose kv endpoints are real local mock ports.
/// `master` picks which node owns every vbucket.
fn local_config(rev: i64, port_a: u16, port_b: u16, master: usize) -> String {
    let (m, r) = (master, 1 - master);
    let rows: Vec<String> = (0..8).map(|_| format!("[{m},{r}]")).collect();
    format!(
        r#"{{
            "rev": {rev},
            "name": "default",
            "nodeLocator": "vbucket",
            "nodesExt": [
                {{"services": {{"kv": {port_a}, "mgmt": 8091}}, "hostname": "127.0.0.1"}},
                {{"services": {{"kv": {port_b}, "mgmt": 8091}}, "hostname": "127.0.0.1"}}
            ],
            "vBucketServerMap": {{
                "hashAlgorithm": "CRC",
                "numReplicas": 1,
                "serverList": ["127.0.0.1:{port_a}", "127.0.0.1:{port_b}"],
                "vBucketMap": [{rows}]
            }}
        }}"#,
        rows = rows.join(",")
    )
}

fn connstr(seed_ports: &[u16]) -> String {
    let hosts: Vec<String> = seed_ports
        .iter()
        .map(|p| format!("127.0.0.1:{p}"))
        .collect();
    format!(
        "couchbase://{}/default?sasl_mech_force=PLAIN&bucket_cred=[\"user\",\"pass\"]&config_node_timeout=2&config_total_timeout=5",
        hosts.join(",")
    )
}

async fn client_for(seed_ports: &[u16]) -> CouchClient {
    CouchClient::with_env(&connstr(seed_ports), &HashMap::new())
        .await
        .expect("client construction")
}

#[tokio::test]
async fn bootstrap_cccp_publishes_once_and_builds_pipelines() {
    let node_a = MockNode::start().await;
    let node_b = MockNode::start().await;
    node_a
        .set_cluster_config(local_config(1, node_a.port(), node_b.port(), 0).into_bytes())
        .await;

    // Seed list: A (reachable), plus a dead port standing in for C.
    let client = client_for(&[node_a.port(), 1]).await;
    let mut events = client.monitor().subscribe();

    client.connect().await.expect("bootstrap");

    let config = client.current_config().expect("config accepted");
    assert_eq!(config.rev, Some(1));
    assert_eq!(config.nodes.len(), 2);

    let mut new_configs = 0;
    let mut stopped = false;
    while let Ok(event) = events.try_recv() {
        match event {
            ConfigEvent::GotNewConfig(_) => new_configs += 1,
            ConfigEvent::MonitorStopped => stopped = true,
            _ => {}
        }
    }
    assert_eq!(new_configs, 1, "exactly one publish for the bootstrap");
    assert!(stopped, "monitor returns to stopped after success");

    // Data path works through the published topology.
    node_a.put(b"greeting", b"hello").await;
    node_b.put(b"greeting", b"hello").await;
    let doc = client.get("greeting").await.expect("get");
    assert_eq!(&doc.value[..], b"hello");

    client.shutdown().await;
}

#[tokio::test]
async fn bootstrap_http_stream_when_cccp_disabled() {
    // A streaming config server: one chunked response carrying two
    // documents separated in time.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let http_port = listener.local_addr().unwrap().port();
    let doc1 = local_config(7, 11210, 11211, 0);
    let doc2 = local_config(8, 11210, 11211, 0);
    tokio::spawn(async move {
        loop {
            let Ok((mut sock, _)) = listener.accept().await else {
                return;
            };
            let (doc1, doc2) = (doc1.clone(), doc2.clone());
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                let _ = sock.read(&mut buf).await;
                let _ = sock
                    .write_all(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n")
                    .await;
                let payload = format!("{doc1}\n\n\n\n");
                let chunk = format!("{:x}\r\n{payload}\r\n", payload.len());
                let _ = sock.write_all(chunk.as_bytes()).await;
                // The stream stays open; a fresher config arrives later.
                tokio::time::sleep(Duration::from_millis(200)).await;
                let payload = format!("{doc2}\n\n\n\n");
                let chunk = format!("{:x}\r\n{payload}\r\n", payload.len());
                let _ = sock.write_all(chunk.as_bytes()).await;
                tokio::time::sleep(Duration::from_secs(5)).await;
            });
        }
    });

    let mut env = HashMap::new();
    env.insert("LCB_NO_CCCP".to_string(), "1".to_string());
    let connstr = format!(
        "http://127.0.0.1:{http_port}/default?config_node_timeout=2&config_total_timeout=5"
    );
    let client = CouchClient::with_env(&connstr, &env).await.unwrap();
    client.connect().await.expect("http bootstrap");

    assert_eq!(client.current_config().unwrap().rev, Some(7));

    // The held-open stream keeps feeding the monitor.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(client.current_config().unwrap().rev, Some(8));

    client.shutdown().await;
}

#[tokio::test]
async fn nmv_reroutes_to_new_master_with_single_callback() {
    let node_a = MockNode::start().await;
    let node_b = MockNode::start().await;
    // Initial topology: everything mastered on A.
    node_a
        .set_cluster_config(local_config(1, node_a.port(), node_b.port(), 0).into_bytes())
        .await;

    let client = client_for(&[node_a.port()]).await;
    client.connect().await.expect("bootstrap");

    // A rejects the key, shipping a config that moves every vbucket to B.
    let moved = local_config(2, node_a.port(), node_b.port(), 1);
    node_a.script_nmv(b"wanderer", Some(moved.into_bytes())).await;
    node_b.put(b"wanderer", b"made it").await;

    let doc = client.get("wanderer").await.expect("rerouted get");
    assert_eq!(&doc.value[..], b"made it");

    // The NMV config propagates through the monitor shortly after.
    let mut adopted = false;
    for _ in 0..50 {
        if client.current_config().unwrap().rev == Some(2) {
            adopted = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(adopted, "NMV config body was not adopted");

    client.shutdown().await;
}

#[tokio::test]
async fn timeout_surfaces_network_error_not_timeout() {
    let node_a = MockNode::start().await;
    // Topology routes every key at a dead port.
    node_a
        .set_cluster_config(local_config(1, 1, 1, 0).into_bytes())
        .await;

    let connstr = format!(
        "couchbase://127.0.0.1:{}/default?sasl_mech_force=PLAIN&bucket_cred=[\"user\",\"pass\"]&operation_timeout=0.5&config_node_timeout=2&config_total_timeout=5",
        node_a.port()
    );
    let client = CouchClient::with_env(&connstr, &HashMap::new())
        .await
        .unwrap();
    client.connect().await.expect("bootstrap");

    let err = client.get("unreachable").await.unwrap_err();
    // Every attempt died on connect; the surfaced error is the network
    // failure, never the generic timeout that ended the retries.
    assert_eq!(err.kind(), ErrorKind::Network);

    client.shutdown().await;
}

#[tokio::test]
async fn plain_only_server_fails_negotiation_without_auth_frame() {
    let node = MockNode::start().await;
    node.set_mechs("PLAIN").await;
    node.set_cluster_config(local_config(1, node.port(), node.port(), 0).into_bytes())
        .await;

    // No sasl_mech_force: the client must refuse the PLAIN downgrade.
    let connstr = format!(
        "couchbase://127.0.0.1:{}/default?bucket_cred=[\"user\",\"pass\"]&config_node_timeout=1&config_total_timeout=2",
        node.port()
    );
    let client = CouchClient::with_env(&connstr, &HashMap::new())
        .await
        .unwrap();
    let err = client.connect().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Auth);

    // The guard fired before any credentials went on the wire.
    assert_eq!(node.auth_attempts().await, 0);

    client.shutdown().await;
}

#[tokio::test]
async fn redirect_cap_enforced_through_client() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let Ok((mut sock, _)) = listener.accept().await else {
                return;
            };
            let mut buf = [0u8; 2048];
            let _ = sock.read(&mut buf).await;
            let redirect = format!(
                "HTTP/1.1 302 Found\r\nLocation: http://127.0.0.1:{port}/next\r\nContent-Length: 0\r\n\r\n"
            );
            let _ = sock.write_all(redirect.as_bytes()).await;
        }
    });

    let connstr = "couchbase://127.0.0.1/default?max_redirects=2".to_string();
    let client = CouchClient::with_env(&connstr, &HashMap::new())
        .await
        .unwrap();

    let request = couchbase_client::HttpRequest::new(
        couchbase_client::RequestType::Raw,
        http::Method::GET,
        "/view",
    )
    .with_host("127.0.0.1", port);
    let err = client.http_request(request).await.unwrap_err();
    assert_eq!(err, CouchError::TooManyRedirects(2));

    client.shutdown().await;
}

#[tokio::test]
async fn full_data_surface_roundtrip() {
    let node_a = MockNode::start().await;
    let node_b = MockNode::start().await;
    node_a
        .set_cluster_config(local_config(1, node_a.port(), node_b.port(), 0).into_bytes())
        .await;

    let client = client_for(&[node_a.port()]).await;
    client.connect().await.expect("bootstrap");

    // Mutations land on the master (A).
    let stored = client.upsert("doc", &b"{\"v\":1}"[..]).await.expect("upsert");
    assert!(stored.cas != 0);

    let fetched = client.get("doc").await.expect("get");
    assert_eq!(&fetched.value[..], b"{\"v\":1}");

    // Insert on an existing key reports KeyExists.
    assert_eq!(
        client.insert("doc", &b"x"[..]).await.unwrap_err(),
        CouchError::KeyExists
    );

    let counted = client
        .counter("tally", 5, 10, Duration::ZERO)
        .await
        .expect("counter");
    assert_eq!(counted.counter_value(), Some(10));
    let counted = client
        .counter("tally", 5, 10, Duration::ZERO)
        .await
        .expect("counter");
    assert_eq!(counted.counter_value(), Some(15));

    client.remove("doc", 0).await.expect("remove");
    assert_eq!(
        client.get("doc").await.unwrap_err(),
        CouchError::KeyNotFound
    );

    client.shutdown().await;
}
