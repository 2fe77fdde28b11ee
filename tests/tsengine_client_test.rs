//! Engine Client Integration Tests
//!
//! Drives `BtrdbClient` over real TCP against a mock engine that speaks the
//! framed protocol.

mod common;

use common::{MockEngine, FAILING_UUID, HANGUP_UUID, MISMATCH_UUID, RECORDS_PER_FRAME, SILENT_UUID};
use giles::archiver::{Archiver, ArchiverOptions};
use giles::core::{parse_smap_json, Reading, StreamId};
use giles::error::GilesError;
use giles::metadata::MemoryMetadataStore;
use giles::pool::{Backoff, ConnectionPool, TcpConnector};
use giles::tsengine::wire::Command;
use giles::tsengine::{BtrdbClient, TimeseriesStore};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

async fn client(engine: &MockEngine) -> Arc<BtrdbClient<TcpConnector>> {
    client_with(engine, 4).await
}

async fn client_with(engine: &MockEngine, connections: usize) -> Arc<BtrdbClient<TcpConnector>> {
    let connector = TcpConnector::new(engine.addr.to_string());
    let pool = ConnectionPool::new(connector, connections, Backoff::default()).await.unwrap();
    Arc::new(BtrdbClient::new(Arc::new(pool)))
}

#[tokio::test]
async fn test_single_insert_round_trip() {
    let engine = MockEngine::start().await;
    let client = client(&engine).await;
    let archiver = Archiver::new(
        Arc::new(MemoryMetadataStore::new()),
        client.clone(),
        ArchiverOptions::default(),
    )
    .unwrap();

    let payload = json!({
        "/sensor0": {
            "uuid": "d24325e6-1d7d-11e2-ad69-a7c2fa8dba61",
            "Properties": { "UnitofTime": "ns", "StreamType": "numeric" },
            "Readings": [[1_351_043_674_000_000_000u64, 4.4]]
        }
    });
    let msg = parse_smap_json(&payload, None).unwrap().remove(0);
    let uuid = msg.uuid;
    archiver.add_data(msg).await.unwrap();
    archiver.commit(uuid).await.unwrap();

    let t = 1_351_043_674_000_000_000u64;
    let data = client.get_data(&[uuid], t, t).await.unwrap();
    assert_eq!(data.len(), 1);
    assert_eq!(data[0].uuid, uuid);
    assert_eq!(data[0].readings, vec![Reading::new(t, 4.4)]);

    let inserts = engine.inserts();
    assert_eq!(inserts, vec![(1, *uuid.as_bytes())]);
    assert_eq!(client.stats().inserted_readings, 1);
}

#[tokio::test]
async fn test_nearest_and_delete() {
    let engine = MockEngine::start().await;
    let client = client(&engine).await;
    let id = StreamId::new_v4();
    let readings: Vec<Reading> = (1..=5u64).map(|i| Reading::new(i * 10, i as f64)).collect();
    client.add_buffer(id, &readings).await.unwrap();

    let before = client.prev(&[id], 30).await.unwrap();
    assert_eq!(before[0].readings, vec![Reading::new(20, 2.0)]);
    let after = client.next(&[id], 30).await.unwrap();
    assert_eq!(after[0].readings, vec![Reading::new(30, 3.0)]);
    let none = client.prev(&[id], 10).await.unwrap();
    assert!(none[0].readings.is_empty());

    client.delete_data(&[id], 20, 40).await.unwrap();
    let left = client.get_data(&[id], 0, 100).await.unwrap();
    assert_eq!(left[0].readings, vec![Reading::new(10, 1.0), Reading::new(50, 5.0)]);

    assert!(engine
        .requests()
        .iter()
        .any(|r| matches!(r.command, Command::DeleteValues { start: 20, end: 40, .. })));
}

#[tokio::test]
async fn test_engine_status_is_transient() {
    let engine = MockEngine::start().await;
    let client = client(&engine).await;
    let failing = StreamId::from_bytes(FAILING_UUID);

    let err = client.add_buffer(failing, &[Reading::new(1, 1.0)]).await.unwrap_err();
    assert!(matches!(err, GilesError::TransientEngine(_)));
    assert_eq!(client.stats().failures, 1);

    // The connection stays usable after a status error.
    let live = client.pool().live_count();
    let ok = StreamId::new_v4();
    client.add_buffer(ok, &[Reading::new(1, 1.0)]).await.unwrap();
    assert_eq!(client.pool().live_count(), live);
}

#[tokio::test]
async fn test_unreachable_engine_fails_startup() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let backoff = Backoff {
        initial: std::time::Duration::from_millis(5),
        ceiling: std::time::Duration::from_millis(20),
    };
    let result = ConnectionPool::new(TcpConnector::new(addr.to_string()), 2, backoff).await;
    assert!(matches!(result, Err(GilesError::FatalStartup(_))));
}

#[tokio::test]
async fn test_multi_frame_records_are_collected() {
    let engine = MockEngine::start().await;
    let client = client(&engine).await;
    let id = StreamId::new_v4();
    let readings: Vec<Reading> = (1..=5u64).map(|i| Reading::new(i, i as f64)).collect();
    client.add_buffer(id, &readings).await.unwrap();

    let frames_before = engine.frames_sent();
    let data = client.get_data(&[id], 0, 10).await.unwrap();
    assert_eq!(data[0].readings, readings);
    // Five records at two per frame arrive as three frames, the last one final.
    assert_eq!(engine.frames_sent() - frames_before, (5 + RECORDS_PER_FRAME - 1) / RECORDS_PER_FRAME);
}

#[tokio::test]
async fn test_multi_stream_request_uses_one_connection() {
    let engine = MockEngine::start().await;
    // One slot, opened lazily: every request must share it.
    let client = client_with(&engine, 1).await;
    let ids: Vec<StreamId> = (0..3).map(|_| StreamId::new_v4()).collect();
    for (i, id) in ids.iter().enumerate() {
        client.add_buffer(*id, &[Reading::new(10, i as f64)]).await.unwrap();
    }

    let data = client.get_data(&ids, 0, 100).await.unwrap();
    assert_eq!(data.iter().map(|d| d.uuid).collect::<Vec<_>>(), ids);
    assert_eq!(data[2].readings, vec![Reading::new(10, 2.0)]);
    let prev = client.prev(&ids, 11).await.unwrap();
    assert!(prev.iter().all(|d| d.readings.len() == 1));
    client.delete_data(&ids, 0, 100).await.unwrap();

    assert_eq!(engine.connections(), 1);
    assert_eq!(client.pool().live_count(), 1);
}

#[tokio::test]
async fn test_io_failure_closes_connection_and_pool_heals() {
    let engine = MockEngine::start().await;
    let client = client_with(&engine, 2).await;
    assert_eq!(client.pool().live_count(), 1);

    let hangup = StreamId::from_bytes(HANGUP_UUID);
    let err = client.get_data(&[hangup], 0, 10).await.unwrap_err();
    assert!(matches!(err, GilesError::TransientEngine(_)));
    assert_eq!(client.pool().live_count(), 0);
    assert_eq!(client.pool().stats().discarded.load(std::sync::atomic::Ordering::SeqCst), 1);

    let id = StreamId::new_v4();
    client.add_buffer(id, &[Reading::new(5, 1.0)]).await.unwrap();
    let data = client.get_data(&[id], 0, 10).await.unwrap();
    assert_eq!(data[0].readings, vec![Reading::new(5, 1.0)]);
    assert_eq!(client.pool().live_count(), 1);
    assert_eq!(engine.connections(), 2);
}

#[tokio::test]
async fn test_mismatched_response_kind_is_rejected() {
    let engine = MockEngine::start().await;
    let client = client_with(&engine, 2).await;
    let live = client.pool().live_count();

    let mismatch = StreamId::from_bytes(MISMATCH_UUID);
    let err = client.add_buffer(mismatch, &[Reading::new(1, 1.0)]).await.unwrap_err();
    assert!(matches!(err, GilesError::TransientEngine(_)));
    assert_eq!(client.stats().inserted_readings, 0);
    // The connection is no longer trusted.
    assert_eq!(client.pool().live_count(), live - 1);
}

#[tokio::test]
async fn test_cancelled_request_releases_its_connection() {
    let engine = MockEngine::start().await;
    let client = client_with(&engine, 1).await;
    let silent = StreamId::from_bytes(SILENT_UUID);

    let first = tokio::time::timeout(Duration::from_millis(200), client.get_data(&[silent], 0, 10)).await;
    assert!(first.is_err());
    assert_eq!(client.pool().live_count(), 0);

    let id = StreamId::new_v4();
    let second = tokio::time::timeout(Duration::from_secs(2), client.add_buffer(id, &[Reading::new(1, 1.0)])).await;
    assert!(matches!(second, Ok(Ok(()))));
    assert_eq!(client.pool().live_count(), 1);
}
