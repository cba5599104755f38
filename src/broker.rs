//! Durable-queue publisher and bounded connection pool for RabbitMQ.
//!
//! The pool/publish/retry shape is grounded on
//! `examples/original_source/backend/app/queue_client.py::RabbitMQConnectionPool`/
//! `publish_message`, but transported via `lapin` (the standard tokio-native
//! AMQP 0.9.1 client -- no AMQP client appears anywhere in the example pack)
//! wrapped in a `bb8::Pool` the same way
//! `examples/faradayio-geocode-csv/src/key_value_stores/redis.rs` wraps
//! `bb8-redis`'s `RedisConnectionManager`. Capacity and retry schedule follow
//! `SPEC_FULL.md` §4.4, overriding the Python original's pool size of 5 and
//! flat 2s/3-attempt retry.

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use bb8::{Pool, PooledConnection};
use lapin::options::{
    BasicPublishOptions, ExchangeDeclareOptions, QueueDeclareOptions,
};
use lapin::{
    Channel, Connection, ConnectionProperties, ExchangeKind,
};
use lapin::types::FieldTable;
use lapin::BasicProperties;
use metrics::{counter, describe_counter, describe_histogram, histogram, Unit};
use tokio::time::sleep;
use tracing::{instrument, warn};

use crate::config::BrokerConfig;

/// A `bb8::ManageConnection` for AMQP connections, playing the same role
/// `RedisConnectionManager` plays for `key_value_stores/redis.rs`.
struct AmqpConnectionManager {
    uri: String,
}

#[async_trait]
impl bb8::ManageConnection for AmqpConnectionManager {
    type Connection = Connection;
    type Error = lapin::Error;

    async fn connect(&self) -> Result<Connection, lapin::Error> {
        Connection::connect(&self.uri, ConnectionProperties::default()).await
    }

    async fn is_valid(&self, conn: &mut Connection) -> Result<(), lapin::Error> {
        if conn.status().connected() {
            Ok(())
        } else {
            // Force bb8 to discard and reconnect.
            Connection::connect(&self.uri, ConnectionProperties::default())
                .await
                .map(|fresh| *conn = fresh)
        }
    }

    fn has_broken(&self, conn: &mut Connection) -> bool {
        !conn.status().connected()
    }
}

/// Where a published message should be routed.
pub enum Destination<'a> {
    /// The durable raw queue, routed via the default exchange.
    Queue(&'a str),
    /// A durable fanout exchange.
    FanoutExchange(&'a str),
}

/// A bounded pool of AMQP connections plus a retrying publisher.
pub struct Broker {
    pool: Pool<AmqpConnectionManager>,
    raw_queue: String,
    broadcast_exchange: String,
}

impl Broker {
    #[instrument(name = "Broker::connect", level = "debug", skip_all)]
    pub async fn connect(config: &BrokerConfig) -> Result<Broker> {
        describe_counter!(
            "air_quality.broker.publish.attempts",
            "Number of publish attempts, by destination"
        );
        describe_counter!(
            "air_quality.broker.publish.failures",
            "Number of publish attempts that exhausted all retries"
        );
        describe_histogram!(
            "air_quality.broker.publish.duration_seconds",
            Unit::Seconds,
            "Time required to publish a single message, including retries"
        );

        let manager = AmqpConnectionManager {
            uri: config.amqp_uri(),
        };
        let pool = Pool::builder()
            .max_size(config.pool_capacity)
            .connection_timeout(config.acquire_timeout)
            .build(manager)
            .await
            .context("could not create AMQP connection pool")?;

        let broker = Broker {
            pool,
            raw_queue: config.raw_queue.clone(),
            broadcast_exchange: config.broadcast_exchange.clone(),
        };
        // Declare our topology up front so the first publish doesn't pay
        // the cost, and so a misconfigured broker fails fast at startup.
        let conn = broker.acquire().await?;
        let channel = conn
            .create_channel()
            .await
            .context("could not open AMQP channel")?;
        declare_queue(&channel, &broker.raw_queue).await?;
        declare_fanout_exchange(&channel, &broker.broadcast_exchange).await?;
        Ok(broker)
    }

    async fn acquire(&self) -> Result<PooledConnection<'_, AmqpConnectionManager>> {
        self.pool
            .get()
            .await
            .context("could not acquire AMQP connection from pool")
    }

    /// Publish to the durable raw queue. Retries up to 3 attempts with fixed
    /// backoff (0.5s * attempt).
    pub async fn publish_raw(&self, payload: &[u8]) -> Result<()> {
        let queue = self.raw_queue.clone();
        self.publish_with_retry(Destination::Queue(&queue), payload)
            .await
    }

    /// Publish to the fanout broadcast exchange. Same retry schedule as
    /// `publish_raw`.
    pub async fn publish_broadcast(&self, payload: &[u8]) -> Result<()> {
        let exchange = self.broadcast_exchange.clone();
        self.publish_with_retry(Destination::FanoutExchange(&exchange), payload)
            .await
    }

    #[instrument(name = "Broker::publish_with_retry", level = "debug", skip_all)]
    async fn publish_with_retry(
        &self,
        destination: Destination<'_>,
        payload: &[u8],
    ) -> Result<()> {
        const MAX_ATTEMPTS: u32 = 3;
        let start = Instant::now();
        let label = match destination {
            Destination::Queue(_) => "raw",
            Destination::FanoutExchange(_) => "broadcast",
        };

        let mut last_err = None;
        for attempt in 1..=MAX_ATTEMPTS {
            counter!("air_quality.broker.publish.attempts", 1, "destination" => label);
            match self.publish_once(&destination, payload).await {
                Ok(()) => {
                    histogram!(
                        "air_quality.broker.publish.duration_seconds",
                        start.elapsed().as_secs_f64(),
                        "destination" => label
                    );
                    return Ok(());
                }
                Err(err) => {
                    warn!(
                        "publish attempt {attempt}/{MAX_ATTEMPTS} to {label} failed: {err:#}"
                    );
                    last_err = Some(err);
                    if attempt < MAX_ATTEMPTS {
                        sleep(Duration::from_millis(500 * attempt as u64)).await;
                    }
                }
            }
        }

        counter!("air_quality.broker.publish.failures", 1, "destination" => label);
        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("publish failed for unknown reason")))
    }

    async fn publish_once(
        &self,
        destination: &Destination<'_>,
        payload: &[u8],
    ) -> Result<()> {
        let conn = self.acquire().await?;
        let channel = conn
            .create_channel()
            .await
            .context("could not open AMQP channel")?;

        let (exchange, routing_key) = match destination {
            Destination::Queue(name) => {
                declare_queue(&channel, name).await?;
                ("", *name)
            }
            Destination::FanoutExchange(name) => {
                declare_fanout_exchange(&channel, name).await?;
                (*name, "")
            }
        };

        channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                payload,
                BasicProperties::default().with_delivery_mode(2),
            )
            .await
            .context("could not publish message")?
            .await
            .context("broker did not confirm publish")?;
        Ok(())
    }

    /// Drain the pool. In-flight acquire waiters observe the shutdown and
    /// the pool stops handing out connections once dropped.
    pub async fn shutdown(self) {
        drop(self.pool);
    }
}

async fn declare_queue(channel: &Channel, name: &str) -> Result<()> {
    channel
        .queue_declare(
            name,
            QueueDeclareOptions {
                durable: true,
                ..QueueDeclareOptions::default()
            },
            FieldTable::default(),
        )
        .await
        .with_context(|| format!("could not declare queue {name:?}"))?;
    Ok(())
}

async fn declare_fanout_exchange(channel: &Channel, name: &str) -> Result<()> {
    channel
        .exchange_declare(
            name,
            ExchangeKind::Fanout,
            ExchangeDeclareOptions {
                durable: true,
                ..ExchangeDeclareOptions::default()
            },
            FieldTable::default(),
        )
        .await
        .with_context(|| format!("could not declare exchange {name:?}"))?;
    Ok(())
}
