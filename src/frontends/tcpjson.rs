//! Newline-delimited JSON over TCP.
//!
//! Each line is either an sMAP payload, answered with `{"accepted": n}`, or a
//! `{"query": "..."}` object, answered with the query result. Every input line
//! gets exactly one output line.

use super::{error_json, ingest_payload, ShutdownSignal};
use crate::archiver::Archiver;
use crate::error::{GilesError, Result};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

pub async fn serve(listener: TcpListener, archiver: Arc<Archiver>, mut shutdown: ShutdownSignal) -> Result<()> {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (socket, peer) = accepted?;
                debug!(target: "giles::tcpjson", %peer, "Accepted connection");
                let archiver = Arc::clone(&archiver);
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(socket, archiver).await {
                        warn!(target: "giles::tcpjson", %peer, error = %e, "Connection ended with error");
                    }
                });
            }
            _ = shutdown.wait_for(|stop| *stop) => return Ok(()),
        }
    }
}

pub async fn start_server(addr: &str, archiver: Arc<Archiver>, shutdown: ShutdownSignal) -> Result<()> {
    let listener = TcpListener::bind(addr).await.map_err(|e| {
        GilesError::FatalStartup(format!("cannot bind tcpjson frontend to {}: {}", addr, e))
    })?;
    info!(target: "giles::tcpjson", %addr, "TCP JSON frontend listening");
    serve(listener, archiver, shutdown).await
}

async fn handle_connection(socket: TcpStream, archiver: Arc<Archiver>) -> Result<()> {
    let (reader, mut writer) = socket.into_split();
    let mut lines = BufReader::new(reader).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let reply = handle_line(&archiver, &line).await;
        let mut out = reply.to_string();
        out.push('\n');
        writer.write_all(out.as_bytes()).await?;
    }
    Ok(())
}

async fn handle_line(archiver: &Archiver, line: &str) -> Value {
    let payload: Value = match serde_json::from_str(line) {
        Ok(payload) => payload,
        Err(e) => return error_json(&GilesError::Json(e)),
    };
    let result = match payload.get("query").and_then(Value::as_str) {
        Some(query) => archiver.handle_query(query).await.map(|r| r.to_json()),
        None => ingest_payload(archiver, &payload, None).await.map(|n| json!({ "accepted": n })),
    };
    result.unwrap_or_else(|e| error_json(&e))
}
