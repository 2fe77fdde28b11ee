//! Frontend Integration Tests
//!
//! Runs the HTTP, WebSocket and TCP JSON frontends on ephemeral ports and talks
//! to them as a client would.

use futures_util::{SinkExt, StreamExt};
use giles::archiver::{Archiver, ArchiverOptions};
use giles::frontends::{http, tcpjson, websocket};
use giles::metadata::MemoryMetadataStore;
use giles::tsengine::MemoryTimeseries;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::Message;

const UUID: &str = "d24325e6-1d7d-11e2-ad69-a7c2fa8dba61";

fn archiver() -> Arc<Archiver> {
    Arc::new(
        Archiver::new(
            Arc::new(MemoryMetadataStore::new()),
            Arc::new(MemoryTimeseries::new()),
            ArchiverOptions::default(),
        )
        .unwrap(),
    )
}

fn payload(room: &str, t: u64, v: f64) -> Value {
    json!({
        "/meter": {
            "uuid": UUID,
            "Metadata": { "Room": room },
            "Properties": { "UnitofTime": "s", "UnitofMeasure": "W" },
            "Readings": [[t, v]]
        }
    })
}

async fn listener() -> (TcpListener, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

#[tokio::test]
async fn test_http_add_and_query() {
    let archiver = archiver();
    let (listener, addr) = listener().await;
    let (stop, shutdown) = watch::channel(false);
    let server = tokio::spawn(http::serve(listener, Arc::clone(&archiver), shutdown));

    let client = reqwest::Client::new();
    let key = "ab".repeat(32);
    let added: Value = client
        .post(format!("http://{}/add/{}", addr, key))
        .json(&payload("410", 1_351_043_674, 4.4))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(added, json!({ "accepted": 1 }));

    let tags: Value = client
        .post(format!("http://{}/api/query", addr))
        .body("select Metadata/Room where has Metadata/Room")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(tags, json!([{ "Metadata": { "Room": "410" } }]));

    let bad = client
        .post(format!("http://{}/api/query", addr))
        .body("select * wher has x")
        .send()
        .await
        .unwrap();
    assert_eq!(bad.status(), reqwest::StatusCode::BAD_REQUEST);
    let body: Value = bad.json().await.unwrap();
    assert_eq!(body["position"], 9);

    let bad_key = client
        .post(format!("http://{}/add/nothex", addr))
        .json(&payload("410", 1_351_043_675, 1.0))
        .send()
        .await
        .unwrap();
    assert_eq!(bad_key.status(), reqwest::StatusCode::BAD_REQUEST);

    let health: Value = client.get(format!("http://{}/health", addr)).send().await.unwrap().json().await.unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["streams"], 1);

    drop(client);
    stop.send(true).unwrap();
    server.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_websocket_republish() {
    let archiver = archiver();
    let (listener, addr) = listener().await;
    let (stop, shutdown) = watch::channel(false);
    let server = tokio::spawn(websocket::serve(listener, Arc::clone(&archiver), 8, shutdown));

    giles::frontends::ingest_payload(&archiver, &payload("410", 1_351_043_674, 4.4), None)
        .await
        .unwrap();

    let (mut socket, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws/republish", addr))
        .await
        .unwrap();
    socket.send(Message::Text("select * where has Metadata/Room".into())).await.unwrap();

    let snapshot = match socket.next().await.unwrap().unwrap() {
        Message::Text(text) => serde_json::from_str::<Value>(&text).unwrap(),
        other => panic!("unexpected frame {:?}", other),
    };
    assert_eq!(snapshot[0]["uuid"], UUID);

    giles::frontends::ingest_payload(&archiver, &payload("410", 1_351_043_675, 5.5), None)
        .await
        .unwrap();
    let live = match socket.next().await.unwrap().unwrap() {
        Message::Text(text) => serde_json::from_str::<Value>(&text).unwrap(),
        other => panic!("unexpected frame {:?}", other),
    };
    assert_eq!(live[0]["Readings"][0], json!([1_351_043_675u64, 5.5]));

    socket.close(None).await.unwrap();
    stop.send(true).unwrap();
    server.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_tcpjson_lines() {
    let archiver = archiver();
    let (listener, addr) = listener().await;
    let (stop, shutdown) = watch::channel(false);
    let server = tokio::spawn(tcpjson::serve(listener, Arc::clone(&archiver), shutdown));

    let socket = TcpStream::connect(addr).await.unwrap();
    let (reader, mut writer) = socket.into_split();
    let mut lines = BufReader::new(reader).lines();

    let mut line = payload("410", 1_351_043_674, 4.4).to_string();
    line.push('\n');
    writer.write_all(line.as_bytes()).await.unwrap();
    let reply: Value = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
    assert_eq!(reply, json!({ "accepted": 1 }));

    writer.write_all(b"{\"query\": \"select distinct Metadata/Room\"}\n").await.unwrap();
    let reply: Value = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
    assert_eq!(reply, json!(["410"]));

    writer.write_all(b"not json\n").await.unwrap();
    let reply: Value = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
    assert!(reply["error"].is_string());

    stop.send(true).unwrap();
    server.await.unwrap().unwrap();
}
