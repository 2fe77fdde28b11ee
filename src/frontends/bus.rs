//! Message bus frontend over MQTT.
//!
//! Payloads published on the ingest topic are sMAP JSON. Payloads on the query
//! topic are query strings; each answer is published on the response topic.

use super::{error_json, ingest_payload, ShutdownSignal};
use crate::archiver::Archiver;
use crate::config::BosswaveSection;
use crate::error::{GilesError, Result};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, Publish, QoS};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const RECONNECT_DELAY: Duration = Duration::from_secs(1);

pub async fn run(config: BosswaveSection, archiver: Arc<Archiver>, mut shutdown: ShutdownSignal) -> Result<()> {
    let mut options = MqttOptions::new(config.client_id.clone(), config.host.clone(), config.port);
    options.set_keep_alive(Duration::from_secs(config.keep_alive_secs.max(5)));

    let (client, mut eventloop) = AsyncClient::new(options, 64);
    for topic in [&config.ingest_topic, &config.query_topic] {
        client
            .subscribe(topic.as_str(), QoS::AtLeastOnce)
            .await
            .map_err(|e| GilesError::FatalStartup(format!("cannot subscribe to {}: {}", topic, e)))?;
    }
    info!(
        target: "giles::bus",
        host = %config.host,
        port = config.port,
        ingest = %config.ingest_topic,
        query = %config.query_topic,
        "Bus frontend started"
    );

    loop {
        tokio::select! {
            event = eventloop.poll() => match event {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let archiver = Arc::clone(&archiver);
                    let client = client.clone();
                    let config = config.clone();
                    tokio::spawn(async move {
                        handle_publish(&config, &client, &archiver, publish).await;
                    });
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(target: "giles::bus", error = %e, "MQTT connection error");
                    tokio::time::sleep(RECONNECT_DELAY).await;
                }
            },
            _ = async { shutdown.wait_for(|stop| *stop).await.map(|_| ()) } => {
                let _ = client.disconnect().await;
                return Ok(());
            }
        }
    }
}

async fn handle_publish(config: &BosswaveSection, client: &AsyncClient, archiver: &Archiver, publish: Publish) {
    if publish.topic == config.ingest_topic {
        let result = match serde_json::from_slice::<Value>(&publish.payload) {
            Ok(payload) => ingest_payload(archiver, &payload, None).await,
            Err(e) => Err(GilesError::Json(e)),
        };
        match result {
            Ok(accepted) => debug!(target: "giles::bus", accepted, "Ingested bus payload"),
            Err(e) => warn!(target: "giles::bus", error = %e, "Rejected bus payload"),
        }
    } else if publish.topic == config.query_topic {
        let query = String::from_utf8_lossy(&publish.payload);
        let reply = match archiver.handle_query(query.trim()).await {
            Ok(response) => response.to_json(),
            Err(e) => error_json(&e),
        };
        if let Err(e) = client
            .publish(config.response_topic.as_str(), QoS::AtLeastOnce, false, reply.to_string().into_bytes())
            .await
        {
            warn!(target: "giles::bus", error = %e, "Failed to publish query response");
        }
    }
}
