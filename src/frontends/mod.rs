//! Protocol frontends. Each one is a thin adapter that turns its wire format into
//! calls on the [`Archiver`].

use crate::archiver::Archiver;
use crate::core::{parse_smap_json, EphemeralKey};
use crate::error::{GilesError, Result};
use serde_json::{json, Value};
use tokio::sync::watch;
use tracing::warn;

pub mod bus;
pub mod http;
pub mod tcpjson;
pub mod websocket;

pub use http::{create_server, start_server, ApiError};

/// Flips to `true` once the process is shutting down.
pub type ShutdownSignal = watch::Receiver<bool>;

pub async fn wait_for_shutdown(mut signal: ShutdownSignal) {
    let _ = signal.wait_for(|stop| *stop).await;
}

/// Ingests an sMAP payload. Every message is attempted; the first failure is
/// returned after the rest have been processed.
pub async fn ingest_payload(
    archiver: &Archiver,
    payload: &Value,
    key: Option<&EphemeralKey>,
) -> Result<usize> {
    let messages = parse_smap_json(payload, key)?;
    let mut accepted = 0;
    let mut first_error: Option<GilesError> = None;
    for msg in messages {
        let uuid = msg.uuid;
        match archiver.add_data(msg).await {
            Ok(()) => accepted += 1,
            Err(err) => {
                warn!(target: "giles::frontends", uuid = %uuid, error = %err, "Rejected message");
                first_error.get_or_insert(err);
            }
        }
    }
    match first_error {
        Some(err) => Err(err),
        None => Ok(accepted),
    }
}

pub(crate) fn error_json(err: &GilesError) -> Value {
    match err {
        GilesError::Parse { position, token, message } => json!({
            "error": err.to_string(),
            "position": position,
            "token": token,
            "message": message,
        }),
        _ => json!({ "error": err.to_string() }),
    }
}
