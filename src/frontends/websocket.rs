//! WebSocket republish frontend.
//!
//! A client connects to `/ws/republish` and sends its query as the first text
//! frame. It then receives the current result followed by every matching
//! message as JSON text frames. Closing the socket ends the subscription.

use super::{error_json, wait_for_shutdown, ShutdownSignal};
use crate::archiver::Archiver;
use crate::broker::Subscriber;
use crate::error::{GilesError, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

#[derive(Clone)]
struct WsState {
    archiver: Arc<Archiver>,
    capacity: usize,
}

pub fn create_router(archiver: Arc<Archiver>, capacity: usize) -> Router {
    Router::new()
        .route("/ws/republish", get(republish))
        .layer(TraceLayer::new_for_http())
        .with_state(WsState { archiver, capacity })
}

async fn republish(ws: WebSocketUpgrade, State(state): State<WsState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: WsState) {
    let (mut sink, mut stream) = socket.split();

    let query = loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => break text,
            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return,
            Some(Ok(_)) => continue,
        }
    };

    let (subscriber, mut handle) = Subscriber::channel(state.capacity);
    let archiver = Arc::clone(&state.archiver);
    let serving = tokio::spawn(async move {
        archiver.handle_new_subscriber(subscriber, &query).await;
    });

    loop {
        tokio::select! {
            delivery = handle.recv() => match delivery {
                Some(value) => {
                    if sink.send(Message::Text(value.to_string())).await.is_err() {
                        break;
                    }
                }
                None => {
                    if let Some(err) = handle.error().await {
                        let _ = sink.send(Message::Text(error_json(&err).to_string())).await;
                    }
                    break;
                }
            },
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    handle.close();
    let _ = sink.close().await;
    let _ = serving.await;
    debug!(target: "giles::websocket", "Republish socket closed");
}

pub async fn serve(
    listener: TcpListener,
    archiver: Arc<Archiver>,
    capacity: usize,
    shutdown: ShutdownSignal,
) -> Result<()> {
    let app = create_router(archiver, capacity);
    axum::serve(listener, app).with_graceful_shutdown(wait_for_shutdown(shutdown)).await?;
    Ok(())
}

pub async fn start_server(
    addr: &str,
    archiver: Arc<Archiver>,
    capacity: usize,
    shutdown: ShutdownSignal,
) -> Result<()> {
    let listener = TcpListener::bind(addr).await.map_err(|e| {
        GilesError::FatalStartup(format!("cannot bind websocket frontend to {}: {}", addr, e))
    })?;
    info!(target: "giles::websocket", %addr, "WebSocket frontend listening");
    serve(listener, archiver, capacity, shutdown).await
}
