//! Integration tests for cirrus-server: start a server, connect a client and
//! exercise the protocol end to end.

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::{Value, json};
use tempfile::{TempDir, tempdir};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::time::{Duration, sleep};

use cirrus_core::backends::embedded::EmbeddedDocumentService;
use cirrus_core::backends::firestore::FirestoreDocumentService;
use cirrus_core::{BackendKind, Document, DocumentService, Key, Operator, QueryExpression};
use cirrus_server::client::CirrusClient;
use cirrus_server::server::CirrusServer;

/// Spawn a server on `socket_path` in a background tokio task.
async fn spawn_server(service: Arc<dyn DocumentService>, socket_path: PathBuf) {
    let server = CirrusServer::new(service, socket_path);
    tokio::spawn(async move {
        server.run().await.unwrap();
    });

    // Give the server a moment to bind.
    sleep(Duration::from_millis(50)).await;
}

/// Start a server on a temp socket and return the socket path.
async fn start_test_server(service: Arc<dyn DocumentService>) -> (TempDir, PathBuf) {
    let dir = tempdir().unwrap();
    let socket_path = dir.path().join("test.sock");
    spawn_server(service, socket_path.clone()).await;
    (dir, socket_path)
}

/// Like [`start_test_server`], backed by an embedded store in the same
/// temp directory.
async fn embedded_server() -> (TempDir, PathBuf) {
    let dir = tempdir().unwrap();
    let svc = EmbeddedDocumentService::new(dir.path().join("collections")).unwrap();
    let socket_path = dir.path().join("test.sock");
    spawn_server(Arc::new(svc), socket_path.clone()).await;
    (dir, socket_path)
}

async fn roundtrip(
    reader: &mut BufReader<OwnedReadHalf>,
    writer: &mut OwnedWriteHalf,
    line: &str,
) -> Value {
    writer.write_all(line.as_bytes()).await.unwrap();
    writer.write_all(b"\n").await.unwrap();
    let mut out = String::new();
    reader.read_line(&mut out).await.unwrap();
    serde_json::from_str(&out).unwrap()
}

fn doc(v: Value) -> Document {
    v.as_object().cloned().unwrap()
}

#[tokio::test]
async fn test_crud() {
    let (_dir, sock) = embedded_server().await;
    let mut client = CirrusClient::connect(&sock).await.unwrap();

    assert_eq!(client.backend().await.unwrap(), BackendKind::Embedded);

    let key = Key::new("users", "alice");
    let value = doc(json!({"name": "Alice", "age": 30, "tags": ["admin"]}));
    client.set(&key, None, &value).await.unwrap();
    assert_eq!(client.get(&key, None).await.unwrap(), value);

    client.delete(&key, None).await.unwrap();
    let err = client.get(&key, None).await.unwrap_err();
    assert_eq!(err.server_kind(), Some("NotFound"));
}

#[tokio::test]
async fn test_sub_collection_query_and_paging() {
    let (_dir, sock) = embedded_server().await;
    let mut client = CirrusClient::connect(&sock).await.unwrap();

    let customer = Key::new("customers", "1000");
    for n in 1..=5 {
        client
            .set(
                &customer,
                Some(&Key::new("orders", format!("50{n}"))),
                &doc(json!({"number": n})),
            )
            .await
            .unwrap();
    }

    let exps = [QueryExpression::new("number", Operator::Gt, 1)];
    let first = client
        .query(&customer, "orders", &exps, 3, None)
        .await
        .unwrap();
    assert_eq!(first.documents.len(), 3);
    let token = first.paging_token.expect("first page should carry a token");

    let second = client
        .query(&customer, "orders", &exps, 3, Some(&token))
        .await
        .unwrap();
    assert_eq!(second.documents.len(), 1);
    assert!(second.paging_token.is_none());
}

#[tokio::test]
async fn test_validation_errors() {
    let (_dir, sock) = start_test_server(Arc::new(FirestoreDocumentService::in_memory())).await;
    let mut client = CirrusClient::connect(&sock).await.unwrap();

    let err = client
        .get(&Key::new("users", ""), None)
        .await
        .unwrap_err();
    assert_eq!(err.server_kind(), Some("InvalidArgument"));

    let exps = [
        QueryExpression::new("number", Operator::Gt, 1),
        QueryExpression::new("name", Operator::Lt, "m"),
    ];
    let err = client
        .query(&Key::collection("users"), "", &exps, 0, None)
        .await
        .unwrap_err();
    assert_eq!(err.server_kind(), Some("InvalidArgument"));
}

#[tokio::test]
async fn test_raw_protocol() {
    let (_dir, sock) = start_test_server(Arc::new(FirestoreDocumentService::in_memory())).await;
    let stream = UnixStream::connect(&sock).await.unwrap();
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    let resp = roundtrip(&mut reader, &mut writer, "not json").await;
    assert_eq!(resp["error"], "ParseError");

    let resp = roundtrip(
        &mut reader,
        &mut writer,
        r#"{"op":"query","key":{"collection":"users"},"expressions":[{"operand":"n","operator":"!=","value":1}]}"#,
    )
    .await;
    assert_eq!(resp["error"], "InvalidArgument");
    assert_eq!(
        resp["message"],
        "provide valid query expression operator [==, <, >, <=, >=, startsWith]: !="
    );

    let resp = roundtrip(&mut reader, &mut writer, r#"{"op":"backend"}"#).await;
    assert_eq!(resp, json!({"ok": true, "backend": "firestore"}));

    let resp = roundtrip(
        &mut reader,
        &mut writer,
        r#"{"op":"set","key":{"collection":"users","id":"1"},"value":{"n":1},"timeout_ms":1000}"#,
    )
    .await;
    assert_eq!(resp, json!({"ok": true}));

    let resp = roundtrip(
        &mut reader,
        &mut writer,
        r#"{"op":"query","key":{"collection":"users"}}"#,
    )
    .await;
    assert_eq!(resp, json!({"ok": true, "documents": [{"n": 1}]}));
}

#[tokio::test]
async fn test_oversized_line_closes_connection() {
    let dir = tempdir().unwrap();
    let sock = dir.path().join("test.sock");
    let server = CirrusServer::new(Arc::new(FirestoreDocumentService::in_memory()), sock.clone())
        .with_max_line_bytes(64);
    tokio::spawn(async move {
        server.run().await.unwrap();
    });
    sleep(Duration::from_millis(50)).await;

    let stream = UnixStream::connect(&sock).await.unwrap();
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    let resp = roundtrip(&mut reader, &mut writer, r#"{"op":"backend"}"#).await;
    assert_eq!(resp["backend"], "firestore");

    let long = format!(r#"{{"op":"get","key":{{"collection":"{}","id":"1"}}}}"#, "x".repeat(200));
    let resp = roundtrip(&mut reader, &mut writer, &long).await;
    assert_eq!(resp["error"], "ParseError");
    assert_eq!(resp["message"], "request line exceeds 64 bytes");

    let mut rest = String::new();
    assert_eq!(reader.read_line(&mut rest).await.unwrap(), 0);
}

#[tokio::test]
async fn test_concurrent_clients() {
    let (_dir, sock) = start_test_server(Arc::new(FirestoreDocumentService::in_memory())).await;

    let mut handles = Vec::new();
    for i in 0..4 {
        let sock = sock.clone();
        handles.push(tokio::spawn(async move {
            let mut client = CirrusClient::connect(&sock).await.unwrap();
            let key = Key::new("counters", format!("c{i}"));
            client
                .set(&key, None, &doc(json!({"value": i})))
                .await
                .unwrap();
            client.get(&key, None).await.unwrap()
        }));
    }
    for (i, handle) in handles.into_iter().enumerate() {
        let got = handle.await.unwrap();
        assert_eq!(got["value"], json!(i));
    }

    let mut client = CirrusClient::connect(&sock).await.unwrap();
    let all = client
        .query(&Key::collection("counters"), "", &[], 0, None)
        .await
        .unwrap();
    assert_eq!(all.documents.len(), 4);
}

#[tokio::test]
async fn test_stale_socket_replaced() {
    let dir = tempdir().unwrap();
    let socket_path = dir.path().join("test.sock");
    std::fs::write(&socket_path, b"stale").unwrap();

    spawn_server(
        Arc::new(FirestoreDocumentService::in_memory()),
        socket_path.clone(),
    )
    .await;

    let mut client = CirrusClient::connect(&socket_path).await.unwrap();
    assert_eq!(client.backend().await.unwrap(), BackendKind::Firestore);
}
