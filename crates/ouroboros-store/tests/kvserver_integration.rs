//! KV server backend against an in-process server

mod common;

use common::{open_kvserver, MockKvServer};
use ouroboros_store::{Atomicity, BulkOperation, Database, StoreError};
use serde_json::json;

#[tokio::test]
async fn test_sequential_bulk_stops_at_first_failure() {
    let fixture = open_kvserver().await;
    let server = fixture.server.as_ref().unwrap();
    server.fail_on("c");

    let result = fixture
        .db
        .do_bulk(vec![
            BulkOperation::set("a", "1"),
            BulkOperation::set("user:1", "x"),
            BulkOperation::set("c", "3"),
            BulkOperation::set("d", "4"),
        ])
        .await;

    match result {
        Err(StoreError::PartialBulk {
            applied,
            total,
            source,
        }) => {
            assert_eq!(applied, 2);
            assert_eq!(total, 4);
            match *source {
                StoreError::Backend(msg) => assert!(msg.contains("write to c refused")),
                other => panic!("Expected Backend error, got {:?}", other),
            }
        }
        other => panic!("Expected PartialBulk, got {:?}", other),
    }

    // Committed prefix is not rolled back
    assert_eq!(server.raw_get("a"), Some(b"1".to_vec()));
    assert_eq!(server.raw_get("user:1"), Some(b"x".to_vec()));
    assert_eq!(server.raw_get("d"), None);
    assert_eq!(
        fixture.db.find_keys("user:*", None).await.unwrap().len(),
        1
    );
}

#[tokio::test]
async fn test_index_stored_as_sorted_list() {
    let fixture = open_kvserver().await;
    let server = fixture.server.as_ref().unwrap();

    fixture.db.set("user:2", "b").await.unwrap();
    fixture.db.set("user:1", "a").await.unwrap();
    fixture.db.set("user:1", "a2").await.unwrap();

    let raw = server.raw_get("index:keys:user").unwrap();
    let list: Vec<String> = serde_json::from_slice(&raw).unwrap();
    assert_eq!(list, vec!["user:1".to_string(), "user:2".to_string()]);

    fixture.db.remove("user:1").await.unwrap();
    fixture.db.remove("user:2").await.unwrap();
    // Empty entry is deleted, not left as "[]"
    assert_eq!(server.raw_get("index:keys:user"), None);
}

#[tokio::test]
async fn test_failed_index_write_leaves_drift() {
    let fixture = open_kvserver().await;
    let server = fixture.server.as_ref().unwrap();
    server.fail_on("index:keys:user");

    let result = fixture
        .db
        .do_bulk(vec![BulkOperation::set("user:1", "x")])
        .await;
    // Primary write landed, its index write did not
    assert_eq!(result.as_ref().err().and_then(StoreError::applied), Some(0));
    assert_eq!(fixture.db.get("user:1").await.unwrap(), Some(b"x".to_vec()));
    assert!(fixture.db.find_keys("user:*", None).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_corrupt_index_entry_is_reported() {
    let fixture = open_kvserver().await;
    let server = fixture.server.as_ref().unwrap();
    server
        .data
        .lock()
        .insert("index:keys:user".to_string(), b"not a list".to_vec());

    assert!(matches!(
        fixture.db.find_keys("user:*", None).await,
        Err(StoreError::Deserialization(_))
    ));
}

#[tokio::test]
async fn test_namespace_prefix() {
    let (server, port) = MockKvServer::start().await;
    let db = Database::new("kvserver").unwrap();
    db.init(json!({"port": port, "namespace": "app"})).await.unwrap();

    db.set("user:1", "a").await.unwrap();
    assert_eq!(server.raw_get("app:user:1"), Some(b"a".to_vec()));
    assert!(server.raw_get("app:index:keys:user").is_some());
    assert_eq!(server.raw_get("user:1"), None);

    let report = db
        .do_bulk(vec![BulkOperation::remove("user:1")])
        .await
        .unwrap();
    assert_eq!(report.atomicity, Atomicity::Sequential);
    assert!(db.find_keys("user:*", None).await.unwrap().is_empty());

    db.close().await.unwrap();
}

#[tokio::test]
async fn test_init_against_closed_port() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let db = Database::new("kvserver").unwrap();
    let result = db
        .init(json!({"port": port, "connect_timeout_ms": 500}))
        .await;
    assert!(matches!(result, Err(StoreError::Connection(_))));
    assert!(matches!(db.get("k").await, Err(StoreError::Closed)));
}
