#![recursion_limit = "128"]

pub use anyhow::Result;
use clap::{Parser, Subcommand};
use metrics::describe_counter;
use opinionated_metrics::Mode;
use std::sync::Arc;
use tracing::{debug, info_span, warn};
use tracing_subscriber::{
    fmt::{format::FmtSpan, Subscriber},
    prelude::*,
    EnvFilter,
};

mod aggregation;
mod anomaly;
mod broadcast_consumer;
mod broker;
mod config;
mod error_response;
mod geohash_index;
mod models;
mod server;
mod store;
mod worker;
mod ws_hub;

use crate::broker::Broker;
use crate::config::Config;
use crate::server::run_server;
use crate::store::StoreClient;
use crate::ws_hub::WsHub;

/// Our command-line arguments.
#[derive(Debug, Parser)]
#[command(author, version, about = "ingest, store, detect anomalies in, and broadcast geospatial air-quality telemetry")]
struct Opt {
    /// Which process role to run.
    #[command(subcommand)]
    cmd: Command,
}

/// Subcommands for air-quality-service.
#[derive(Debug, Subcommand)]
enum Command {
    /// Run the HTTP/WebSocket API, plus this replica's broadcast consumer.
    Serve,

    /// Run the raw-queue worker: validate, store, detect, broadcast.
    Worker,
}

// Our main entrypoint. We rely on the fact that `anyhow::Error` has a `Debug`
// implementation that will print a nice friendly error if we return from
// `main` with an error.
#[tokio::main]
async fn main() -> Result<()> {
    // Configure tracing.
    let filter = EnvFilter::from_default_env();
    Subscriber::builder()
        .with_writer(std::io::stderr)
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .with_env_filter(filter)
        .finish()
        .init();
    let _span = info_span!("air-quality-service").entered();
    debug!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));

    let opt = Opt::parse();

    // Set up metrics recording.
    let metrics_builder = opinionated_metrics::Builder::new(Mode::Cli);
    let metrics_handle = metrics_builder.install()?;

    // Describe our global metrics. Per-component metrics are described in
    // the modules that use them.
    describe_counter!(
        "air_quality.selected_errors.count",
        "Particularly interesting errors, by component and cause"
    );

    let config = Arc::new(Config::from_env()?);
    let store = Arc::new(StoreClient::connect(&config.store, config.storage_precision)?);
    let broker = Arc::new(Broker::connect(&config.broker).await?);

    let result = match opt.cmd {
        Command::Serve => {
            let hub = WsHub::new();
            let consumer_config = Arc::clone(&config);
            let consumer_hub = Arc::clone(&hub);
            tokio::spawn(async move {
                broadcast_consumer::run(consumer_config, consumer_hub).await;
            });
            run_server(config, store, broker, hub).await
        }
        Command::Worker => worker::run(config, store, broker).await,
    };

    // Report our metrics.
    if let Err(err) = metrics_handle.report().await {
        warn!("could not report metrics: {:?}", err);
    }

    result
}
