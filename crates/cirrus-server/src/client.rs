//! Client library for connecting to a `cirrus-server` via Unix socket.
//!
//! Each method writes one JSON-line request, reads one JSON-line response and
//! converts it into the core types.

use std::path::Path;
use std::time::Duration;

use cirrus_core::{BackendKind, Document, Key, PagingToken, QueryExpression, QueryResult};
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};

use crate::error::ClientError;

/// Result type alias for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;

pub struct CirrusClient {
    reader: BufReader<OwnedReadHalf>,
    writer: BufWriter<OwnedWriteHalf>,
    line_buf: String,
    timeout: Option<Duration>,
}

impl CirrusClient {
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self> {
        let stream = UnixStream::connect(path.as_ref()).await?;
        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(read_half),
            writer: BufWriter::new(write_half),
            line_buf: String::new(),
            timeout: None,
        })
    }

    /// Deadline the server applies to each subsequent request.
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    pub async fn get(&mut self, key: &Key, sub_key: Option<&Key>) -> Result<Document> {
        let resp = self
            .send_request(json!({"op": "get", "key": key, "sub_key": sub_key}))
            .await?;
        field(&resp, "document")
    }

    pub async fn set(&mut self, key: &Key, sub_key: Option<&Key>, value: &Document) -> Result<()> {
        self.send_request(json!({"op": "set", "key": key, "sub_key": sub_key, "value": value}))
            .await?;
        Ok(())
    }

    pub async fn delete(&mut self, key: &Key, sub_key: Option<&Key>) -> Result<()> {
        self.send_request(json!({"op": "delete", "key": key, "sub_key": sub_key}))
            .await?;
        Ok(())
    }

    pub async fn query(
        &mut self,
        key: &Key,
        subcollection: &str,
        expressions: &[QueryExpression],
        limit: usize,
        paging_token: Option<&PagingToken>,
    ) -> Result<QueryResult> {
        let resp = self
            .send_request(json!({
                "op": "query",
                "key": key,
                "subcollection": subcollection,
                "expressions": expressions,
                "limit": limit,
                "paging_token": paging_token,
            }))
            .await?;
        let documents = field(&resp, "documents")?;
        let paging_token = match resp.get("paging_token") {
            None | Some(Value::Null) => None,
            Some(_) => Some(field(&resp, "paging_token")?),
        };
        Ok(QueryResult {
            documents,
            paging_token,
        })
    }

    /// The backend the server is serving.
    pub async fn backend(&mut self) -> Result<BackendKind> {
        let resp = self.send_request(json!({"op": "backend"})).await?;
        field(&resp, "backend")
    }

    async fn send_request(&mut self, mut req: Value) -> Result<Value> {
        if let (Some(timeout), Some(obj)) = (self.timeout, req.as_object_mut()) {
            let ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
            obj.insert("timeout_ms".to_string(), json!(ms));
        }
        let mut data = serde_json::to_vec(&req).map_err(ClientError::Serialization)?;
        data.push(b'\n');
        self.writer.write_all(&data).await?;
        self.writer.flush().await?;

        self.line_buf.clear();
        let n = self.reader.read_line(&mut self.line_buf).await?;
        if n == 0 {
            return Err(ClientError::Disconnected);
        }
        let resp: Value =
            serde_json::from_str(self.line_buf.trim()).map_err(ClientError::Serialization)?;
        check_error(&resp)?;
        Ok(resp)
    }
}

fn check_error(resp: &Value) -> Result<()> {
    if let Some(err) = resp.get("error") {
        let kind = err.as_str().unwrap_or("Unknown").to_string();
        let message = resp
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        return Err(ClientError::Server { kind, message });
    }
    if resp.get("ok").and_then(Value::as_bool) != Some(true) {
        return Err(ClientError::Protocol(format!("unexpected response: {resp}")));
    }
    Ok(())
}

fn field<T: DeserializeOwned>(resp: &Value, name: &str) -> Result<T> {
    let value = resp
        .get(name)
        .ok_or_else(|| ClientError::Protocol(format!("response missing {name:?}")))?;
    serde_json::from_value(value.clone()).map_err(ClientError::Serialization)
}
