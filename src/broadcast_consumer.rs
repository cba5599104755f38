//! Per-replica fanout-exchange consumer (C7).
//!
//! Declares an exclusive, auto-delete queue bound to the broadcast fanout
//! exchange and forwards every delivery to the local WebSocket hub. The
//! reconnect-with-fixed-delay shape is grounded on the general reconnect
//! pattern in `examples/original_source/backend/app/worker.py::start_consuming`
//! (5s on connection failure, 10s on unexpected error); no captured Python
//! variant actually implements the fanout-consumer side, since `worker.py`
//! never publishes to an exchange at all (see `SPEC_FULL.md` §9).

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{Connection, ConnectionProperties, ExchangeKind};
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::models::Anomaly;
use crate::ws_hub::WsHub;

/// Runs the broadcast consumer loop forever, reconnecting on failure.
pub async fn run(config: Arc<Config>, hub: Arc<WsHub>) -> ! {
    loop {
        match run_once(&config, &hub).await {
            Ok(()) => {
                info!("broadcast consumer loop exited cleanly, reconnecting in 5s");
                sleep(Duration::from_secs(5)).await;
            }
            Err(err) => {
                error!("broadcast consumer connection failed: {err:#}; retrying in 10s");
                sleep(Duration::from_secs(10)).await;
            }
        }
    }
}

async fn run_once(config: &Config, hub: &WsHub) -> Result<()> {
    let conn = Connection::connect(&config.broker.amqp_uri(), ConnectionProperties::default())
        .await
        .context("broadcast consumer could not connect to broker")?;
    let channel = conn.create_channel().await.context("could not open channel")?;

    channel
        .exchange_declare(
            &config.broker.broadcast_exchange,
            ExchangeKind::Fanout,
            ExchangeDeclareOptions {
                durable: true,
                ..ExchangeDeclareOptions::default()
            },
            FieldTable::default(),
        )
        .await
        .context("could not declare broadcast exchange")?;

    // Exclusive + auto-delete: this queue exists only for the lifetime of
    // this replica's connection; broadcast delivery is inherently ephemeral
    // per replica, by design.
    let queue = channel
        .queue_declare(
            "",
            QueueDeclareOptions {
                exclusive: true,
                auto_delete: true,
                ..QueueDeclareOptions::default()
            },
            FieldTable::default(),
        )
        .await
        .context("could not declare exclusive broadcast queue")?;

    channel
        .queue_bind(
            queue.name().as_str(),
            &config.broker.broadcast_exchange,
            "",
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await
        .context("could not bind broadcast queue to exchange")?;

    let mut consumer = channel
        .basic_consume(
            queue.name().as_str(),
            "air-quality-broadcast-consumer",
            BasicConsumeOptions::default(),
            FieldTable::default(),
        )
        .await
        .context("could not start consuming broadcasts")?;

    info!("broadcast consumer bound to '{}'", config.broker.broadcast_exchange);

    while let Some(delivery) = consumer.next().await {
        let delivery = delivery.context("error receiving broadcast delivery")?;

        match serde_json::from_slice::<Anomaly>(&delivery.data) {
            Ok(anomaly) => hub.broadcast(anomaly).await,
            Err(err) => {
                // Malformed broadcasts must never block the queue.
                warn!("discarding malformed broadcast message: {err}");
            }
        }

        if let Err(err) = delivery.ack(BasicAckOptions::default()).await {
            warn!("could not ack broadcast delivery: {err:#}");
        }
    }

    Ok(())
}
