//! Unix domain socket server exposing one [`DocumentService`].
//!
//! Each connected client sends JSON-line requests and receives JSON-line
//! responses in order. Connections are served concurrently; the service is
//! shared between them.

use std::path::PathBuf;
use std::sync::Arc;

use cirrus_core::{DocumentService, QueryExpression, RequestContext};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, error, info, warn};

use crate::protocol::{Request, Response};

/// Longest request line accepted before the connection is closed.
pub const DEFAULT_MAX_LINE_BYTES: usize = 1 << 20;

pub struct CirrusServer {
    service: Arc<dyn DocumentService>,
    socket_path: PathBuf,
    max_line_bytes: usize,
}

impl CirrusServer {
    pub fn new(service: Arc<dyn DocumentService>, socket_path: PathBuf) -> Self {
        Self {
            service,
            socket_path,
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
        }
    }

    pub fn with_max_line_bytes(mut self, max_line_bytes: usize) -> Self {
        self.max_line_bytes = max_line_bytes;
        self
    }

    /// Accept connections until SIGINT or SIGTERM.
    ///
    /// A stale socket file is replaced on startup and removed on shutdown.
    pub async fn run(&self) -> std::io::Result<()> {
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)?;
        }

        let listener = UnixListener::bind(&self.socket_path)?;
        info!(
            path = %self.socket_path.display(),
            backend = %self.service.backend(),
            "server listening"
        );

        let accept_loop = async {
            loop {
                match listener.accept().await {
                    Ok((stream, _addr)) => {
                        let service = Arc::clone(&self.service);
                        let max_line_bytes = self.max_line_bytes;
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(service, stream, max_line_bytes).await
                            {
                                warn!(error = %e, "connection handler error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "accept error");
                    }
                }
            }
        };

        tokio::select! {
            _ = accept_loop => {}
            _ = shutdown_signal() => {
                info!("shutdown signal received");
            }
        }

        if self.socket_path.exists() {
            match std::fs::remove_file(&self.socket_path) {
                Ok(()) => info!(path = %self.socket_path.display(), "socket file removed"),
                Err(e) => warn!(error = %e, "failed to remove socket file on shutdown"),
            }
        }
        Ok(())
    }
}

async fn handle_connection(
    service: Arc<dyn DocumentService>,
    stream: UnixStream,
    max_line_bytes: usize,
) -> std::io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();
    let read_limit = u64::try_from(max_line_bytes).unwrap_or(u64::MAX).saturating_add(1);

    loop {
        line.clear();
        let n = (&mut reader).take(read_limit).read_line(&mut line).await?;
        if n == 0 {
            break;
        }
        if n > max_line_bytes && !line.ends_with('\n') {
            warn!(limit = max_line_bytes, "request line too long, closing connection");
            let response = Response::error(
                "ParseError",
                format!("request line exceeds {max_line_bytes} bytes"),
            );
            write_response(&mut writer, &response).await?;
            break;
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<Request>(trimmed) {
            Ok(req) => dispatch(service.as_ref(), req).await,
            Err(e) => Response::error("ParseError", e.to_string()),
        };
        write_response(&mut writer, &response).await?;
    }
    Ok(())
}

async fn write_response(writer: &mut OwnedWriteHalf, response: &Response) -> std::io::Result<()> {
    let mut bytes = match serde_json::to_vec(response) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(error = %e, "failed to encode response");
            let fallback = format!(
                r#"{{"error":"Backend","message":{}}}"#,
                serde_json::Value::String(e.to_string())
            );
            fallback.into_bytes()
        }
    };
    bytes.push(b'\n');
    writer.write_all(&bytes).await?;
    writer.flush().await
}

async fn dispatch(service: &dyn DocumentService, req: Request) -> Response {
    let ctx = match req.timeout() {
        Some(timeout) => RequestContext::with_timeout(timeout),
        None => RequestContext::new(),
    };

    let result = match req {
        Request::Get { key, sub_key, .. } => service
            .get(&ctx, &key, sub_key.as_ref())
            .await
            .map(Response::ok_document),

        Request::Set {
            key,
            sub_key,
            value,
            ..
        } => service
            .set(&ctx, &key, sub_key.as_ref(), &value)
            .await
            .map(|()| Response::ok_empty()),

        Request::Delete { key, sub_key, .. } => service
            .delete(&ctx, &key, sub_key.as_ref())
            .await
            .map(|()| Response::ok_empty()),

        Request::Query {
            key,
            subcollection,
            expressions,
            limit,
            paging_token,
            ..
        } => {
            let expressions: Result<Vec<QueryExpression>, _> =
                expressions.into_iter().map(QueryExpression::try_from).collect();
            match expressions {
                Ok(expressions) => service
                    .query(
                        &ctx,
                        &key,
                        &subcollection,
                        &expressions,
                        limit,
                        paging_token.as_ref(),
                    )
                    .await
                    .map(|r| Response::ok_documents(r.documents, r.paging_token)),
                Err(e) => Err(e.into()),
            }
        }

        Request::Backend => Ok(Response::ok_backend(service.backend())),
    };

    result.unwrap_or_else(|err| {
        debug!(kind = %err.kind(), error = %err, "request failed");
        Response::from(err)
    })
}

/// Wait for ctrl-c, or SIGTERM where available.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to register SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
