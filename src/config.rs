//! Process-wide configuration, loaded once at startup from the environment.
//!
//! Grounded on `examples/original_source/backend/app/config.py`'s
//! `pydantic_settings.BaseSettings` field/env-var names. Unlike the Python
//! original's `@lru_cache()`-memoized module-level singleton, we load this
//! once in `main` and hand it around as an `Arc<Config>` -- no global state.

use std::env;
use std::time::Duration;

use anyhow::{Context, Result};

/// Hazardous thresholds above which a reading triggers an anomaly.
#[derive(Debug, Clone)]
pub struct Thresholds {
    pub pm25: f64,
    pub pm10: f64,
    pub no2: f64,
    pub so2: f64,
    pub o3: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Thresholds {
            pm25: 250.0,
            pm10: 420.0,
            no2: 200.0,
            so2: 500.0,
            o3: 180.0,
        }
    }
}

/// Broker (RabbitMQ) connection settings.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub raw_queue: String,
    pub broadcast_exchange: String,
    pub pool_capacity: u32,
    pub acquire_timeout: Duration,
}

impl BrokerConfig {
    /// AMQP connection string built from the individual settings, the way
    /// `queue_client.py` builds a `pika.ConnectionParameters`.
    pub fn amqp_uri(&self) -> String {
        format!(
            "amqp://{}:{}@{}:{}/%2f",
            self.username, self.password, self.host, self.port
        )
    }
}

/// InfluxDB 2.x store settings.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub url: String,
    pub token: String,
    pub org: String,
    pub bucket: String,
}

/// Process-wide, read-only-after-startup configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub listen_address: String,
    pub storage_precision: usize,
    pub thresholds: Thresholds,
    pub broker: BrokerConfig,
    pub store: StoreConfig,
}

impl Config {
    /// Load configuration from the environment, applying the same defaults
    /// as the Python original's `config.py`.
    pub fn from_env() -> Result<Config> {
        Ok(Config {
            listen_address: env_or("LISTEN_ADDRESS", "127.0.0.1:8000"),
            storage_precision: env_or("GEOHASH_PRECISION_STORAGE", "7")
                .parse()
                .context("invalid GEOHASH_PRECISION_STORAGE")?,
            thresholds: Thresholds {
                pm25: env_or("THRESHOLD_PM25_HAZARDOUS", "250.0")
                    .parse()
                    .context("invalid THRESHOLD_PM25_HAZARDOUS")?,
                pm10: env_or("THRESHOLD_PM10_HAZARDOUS", "420.0")
                    .parse()
                    .context("invalid THRESHOLD_PM10_HAZARDOUS")?,
                no2: env_or("THRESHOLD_NO2_HAZARDOUS", "200.0")
                    .parse()
                    .context("invalid THRESHOLD_NO2_HAZARDOUS")?,
                so2: env_or("THRESHOLD_SO2_HAZARDOUS", "500.0")
                    .parse()
                    .context("invalid THRESHOLD_SO2_HAZARDOUS")?,
                o3: env_or("THRESHOLD_O3_HAZARDOUS", "180.0")
                    .parse()
                    .context("invalid THRESHOLD_O3_HAZARDOUS")?,
            },
            broker: BrokerConfig {
                host: env_or("RABBITMQ_HOST", "localhost"),
                port: env_or("RABBITMQ_PORT", "5672")
                    .parse()
                    .context("invalid RABBITMQ_PORT")?,
                username: env_or("RABBITMQ_DEFAULT_USER", "guest"),
                password: env_or("RABBITMQ_DEFAULT_PASS", "guest"),
                raw_queue: env_or("RABBITMQ_QUEUE_RAW", "raw_air_quality"),
                broadcast_exchange: env_or(
                    "RABBITMQ_EXCHANGE_BROADCAST",
                    "air_quality_anomalies_fanout",
                ),
                pool_capacity: 15,
                acquire_timeout: Duration::from_secs(10),
            },
            store: StoreConfig {
                url: env_or("INFLUXDB_URL", "http://localhost:8086"),
                token: env::var("INFLUXDB_TOKEN").unwrap_or_default(),
                org: env_or("INFLUXDB_ORG", "air-quality"),
                bucket: env_or("INFLUXDB_BUCKET", "air_quality"),
            },
        })
    }
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_owned())
}
