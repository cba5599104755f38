//! Test server mode end-to-end against a running broker and store. Ignored
//! by default since it requires RabbitMQ and InfluxDB reachable via the
//! usual `RABBITMQ_*`/`INFLUXDB_*` environment variables.

use std::thread::sleep;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use cli_test_dir::*;
use reqwest::blocking::{Client, Response};
use serde::Serialize;

#[derive(Serialize)]
struct IngestJson {
    latitude: f64,
    longitude: f64,
    pm25: f64,
}

#[test]
#[ignore]
fn ingest_and_query_location() -> Result<()> {
    let testdir = TestDir::new("air-quality-service", "");

    let mut server = testdir
        .cmd()
        .arg("serve")
        .spawn()
        .context("server failed to start")?;
    let mut worker = testdir
        .cmd()
        .arg("worker")
        .spawn()
        .context("worker failed to start")?;

    let result = ingest_and_fetch_helper();

    if let Err(err) = server.kill() {
        eprintln!("could not stop server: {}", err);
    }
    if let Err(err) = worker.kill() {
        eprintln!("could not stop worker: {}", err);
    }
    let response = result?;

    if !response.status().is_success() {
        let status = response.status();
        let body = match response.text() {
            Ok(body) => body,
            Err(err) => err.to_string(),
        };
        panic!("error status from server: {:?}\nbody: {}", status, body);
    }
    let body = response.text().context("couldn't get response body")?;
    eprintln!("location response:\n{}", body);
    assert!(body.contains("12.5"));
    Ok(())
}

/// Helper so the test can always clean up its child processes. Must not
/// `assert!`/panic, or cleanup is skipped.
fn ingest_and_fetch_helper() -> Result<Response> {
    let client = Client::new();
    let reading = IngestJson {
        latitude: 41.01,
        longitude: 28.98,
        pm25: 12.5,
    };

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        match client
            .post("http://127.0.0.1:8000/api/v1/air_quality/ingest")
            .json(&reading)
            .send()
        {
            Ok(res) if res.status().is_success() => break,
            Ok(_) | Err(_) if Instant::now() < deadline => {
                sleep(Duration::from_millis(200));
            }
            Ok(res) => return Ok(res),
            Err(err) => return Err(err).context("ingest request timed out with error"),
        }
    }

    // Give the worker a moment to process the queued reading.
    sleep(Duration::from_secs(2));

    client
        .get("http://127.0.0.1:8000/api/v1/air_quality/location")
        .query(&[("lat", "41.01"), ("lon", "28.98"), ("geohash_precision", "7")])
        .send()
        .context("location request failed")
}
