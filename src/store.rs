//! InfluxDB-backed store adapter (C2).
//!
//! Flux query shapes (bbox raw-point query, density dual-yield mean+count,
//! anomalies conditional range filter, latest-cell exact match + 50km
//! haversine radius fallback, write-side geohash/lat/lon tagging) are
//! grounded on `examples/original_source/backend/app/db_client.py`. We keep
//! the original's habit of building Flux query strings with `format!`
//! templating rather than introducing a query builder, since neither the
//! original nor any example in the pack uses one.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::prelude::*;
use influxdb2::models::{DataPoint, FluxRecord, Query};
use influxdb2::Client;
use metrics::{describe_histogram, histogram, Unit};
use tracing::{instrument, warn};

use crate::config::StoreConfig;
use crate::geohash_index;
use crate::models::{AggregatedPoint, Anomaly, PollutionDensity, Reading, TimeSeriesPoint};

/// Geohash precision used when filtering bboxes against the store (matches
/// the storage precision applied by `write_reading`).
const BBOX_FILTER_PRECISION: usize = 7;

pub struct StoreClient {
    client: Client,
    bucket: String,
    org: String,
    storage_precision: usize,
}

impl StoreClient {
    pub fn connect(config: &StoreConfig, storage_precision: usize) -> Result<StoreClient> {
        describe_histogram!(
            "air_quality.store.write_duration_seconds",
            Unit::Seconds,
            "Time required to write a point to the store"
        );
        let client = Client::new(&config.url, &config.org, &config.token);
        Ok(StoreClient {
            client,
            bucket: config.bucket.clone(),
            org: config.org.clone(),
            storage_precision,
        })
    }

    /// Write a reading, tagging it with `latitude`, `longitude`, and a
    /// geohash of `storage_precision`. Returns `Ok(false)` (a no-op "skip",
    /// not an error) when every pollutant field is null.
    #[instrument(name = "StoreClient::write_reading", level = "debug", skip_all)]
    pub async fn write_reading(&self, reading: &Reading) -> Result<bool> {
        let start = std::time::Instant::now();

        let non_null: Vec<(&str, f64)> = reading
            .pollutants()
            .into_iter()
            .filter_map(|(name, value)| value.map(|v| (name, v)))
            .collect();
        if non_null.is_empty() {
            warn!(
                "skipping write for ({}, {}) at {}: no pollutant fields provided",
                reading.latitude, reading.longitude, reading.timestamp
            );
            return Ok(false);
        }

        let geohash = geohash_index::encode(
            reading.latitude,
            reading.longitude,
            self.storage_precision,
        )
        .ok();

        let mut builder = DataPoint::builder("air_quality")
            .tag("latitude", reading.latitude.to_string())
            .tag("longitude", reading.longitude.to_string())
            .timestamp(reading.timestamp.timestamp_millis());
        if let Some(geohash) = &geohash {
            builder = builder.tag("geohash", geohash.clone());
        }
        for (name, value) in &non_null {
            builder = builder.field(*name, *value);
        }
        let point = builder.build().context("could not build reading point")?;

        self.client
            .write(&self.bucket, stream::iter(vec![point]))
            .await
            .context("could not write reading to store")?;

        histogram!(
            "air_quality.store.write_duration_seconds",
            start.elapsed().as_secs_f64(),
            "measurement" => "air_quality"
        );
        Ok(true)
    }

    /// Write a detected anomaly to the `air_quality_anomalies` measurement.
    #[instrument(name = "StoreClient::write_anomaly", level = "debug", skip_all)]
    pub async fn write_anomaly(&self, anomaly: &Anomaly) -> Result<()> {
        let point = DataPoint::builder("air_quality_anomalies")
            .tag("latitude", anomaly.latitude.to_string())
            .tag("longitude", anomaly.longitude.to_string())
            .tag("parameter", anomaly.parameter.clone())
            .tag("id", anomaly.id.clone())
            .field("value", anomaly.value)
            .field("description", anomaly.description.clone())
            .timestamp(anomaly.timestamp.timestamp_millis())
            .build()
            .context("could not build anomaly point")?;

        self.client
            .write(&self.bucket, stream::iter(vec![point]))
            .await
            .context("could not write anomaly to store")?;
        Ok(())
    }

    /// Exact-cell lookup with 50km haversine-radius fallback, per
    /// `db_client.py::query_latest_location_data`.
    #[instrument(name = "StoreClient::query_latest_cell", level = "debug", skip_all)]
    pub async fn query_latest_cell(
        &self,
        lat: f64,
        lon: f64,
        precision: usize,
        window: &str,
    ) -> Result<Option<Reading>> {
        let target_geohash = geohash_index::encode(lat, lon, precision)
            .context("could not compute target geohash")?;

        let flux = format!(
            r#"
                from(bucket: "{bucket}")
                  |> range(start: -{window})
                  |> filter(fn: (r) => r["_measurement"] == "air_quality")
                  |> filter(fn: (r) => r["geohash"] == "{target_geohash}")
                  |> last()
                  |> pivot(rowKey:["_time", "geohash", "latitude", "longitude"], columnKey: ["_field"], valueColumn: "_value")
            "#,
            bucket = self.bucket,
            window = window,
            target_geohash = target_geohash,
        );
        let records = self.query(&flux).await?;

        if let Some(record) = records.into_iter().next() {
            return Ok(Some(reading_from_record(&record, lat, lon)));
        }

        // No exact match: fall back to averaging every reading within 50km.
        let delta_deg = 50.0 / 111.0;
        let (min_lat, max_lat) = (lat - delta_deg, lat + delta_deg);
        let (min_lon, max_lon) = (lon - delta_deg, lon + delta_deg);

        let flux_radius = format!(
            r#"
                from(bucket: "{bucket}")
                  |> range(start: -{window})
                  |> filter(fn: (r) => r["_measurement"] == "air_quality")
                  |> filter(fn: (r) => exists r.latitude and exists r.longitude)
                  |> map(fn: (r) => ({{ r with latitude_float: float(v: r.latitude), longitude_float: float(v: r.longitude) }}))
                  |> filter(fn: (r) => r.latitude_float >= {min_lat} and r.latitude_float <= {max_lat} and r.longitude_float >= {min_lon} and r.longitude_float <= {max_lon})
                  |> sort(columns: ["_time"], desc: true)
                  |> pivot(rowKey:["_time", "latitude", "longitude"], columnKey: ["_field"], valueColumn: "_value")
            "#,
            bucket = self.bucket,
            window = window,
            min_lat = min_lat,
            max_lat = max_lat,
            min_lon = min_lon,
            max_lon = max_lon,
        );
        let candidates = self.query(&flux_radius).await?;

        let mut points = Vec::new();
        for record in &candidates {
            let stored_lat = record_f64(record, "latitude").unwrap_or(lat);
            let stored_lon = record_f64(record, "longitude").unwrap_or(lon);
            if haversine_km(lat, lon, stored_lat, stored_lon) <= 50.0 {
                points.push((record, stored_lat, stored_lon));
            }
        }
        if points.is_empty() {
            return Ok(None);
        }

        let avg = |field: &str| -> Option<f64> {
            let values: Vec<f64> = points
                .iter()
                .filter_map(|(r, _, _)| record_f64(r, field))
                .collect();
            if values.is_empty() {
                None
            } else {
                Some(values.iter().sum::<f64>() / values.len() as f64)
            }
        };
        let latest_timestamp = points
            .iter()
            .filter_map(|(r, _, _)| record_time(r))
            .max()
            .unwrap_or_else(Utc::now);

        Ok(Some(Reading {
            latitude: lat,
            longitude: lon,
            timestamp: latest_timestamp,
            pm25: avg("pm25"),
            pm10: avg("pm10"),
            no2: avg("no2"),
            so2: avg("so2"),
            o3: avg("o3"),
        }))
    }

    /// Raw (unaggregated) points in a bbox/time window, geohash-first with
    /// coordinate fallback, per `db_client.py::query_raw_points_in_bbox`.
    #[instrument(name = "StoreClient::query_raw_in_bbox", level = "debug", skip_all)]
    pub async fn query_raw_in_bbox(
        &self,
        min_lat: f64,
        max_lat: f64,
        min_lon: f64,
        max_lon: f64,
        window: &str,
        limit: u32,
    ) -> Result<Vec<Reading>> {
        let location_filter =
            self.location_filter(min_lat, max_lat, min_lon, max_lon);

        let flux = format!(
            r#"
                from(bucket: "{bucket}")
                  |> range(start: -{window})
                  |> filter(fn: (r) => r["_measurement"] == "air_quality")
                  {location_filter}
                  |> pivot(rowKey:["_time", "latitude", "longitude", "geohash"], columnKey: ["_field"], valueColumn: "_value")
                  |> limit(n: {limit})
            "#,
            bucket = self.bucket,
            window = window,
            location_filter = location_filter,
            limit = limit,
        );
        let records = self.query(&flux).await?;
        Ok(records
            .iter()
            .map(|r| reading_from_record(r, (min_lat + max_lat) / 2.0, (min_lon + max_lon) / 2.0))
            .collect())
    }

    /// Bbox/window mean + count per pollutant, per
    /// `db_client.py::query_density_in_bbox`.
    #[instrument(name = "StoreClient::query_density", level = "debug", skip_all)]
    pub async fn query_density(
        &self,
        min_lat: f64,
        max_lat: f64,
        min_lon: f64,
        max_lon: f64,
        window: &str,
    ) -> Result<Option<PollutionDensity>> {
        let location_filter =
            self.location_filter(min_lat, max_lat, min_lon, max_lon);

        let flux = format!(
            r#"
                import "math"
                import "types"

                base_data = from(bucket: "{bucket}")
                  |> range(start: -{window})
                  |> filter(fn: (r) => r["_measurement"] == "air_quality")
                  {location_filter}
                  |> filter(fn: (r) => r["_field"] == "pm25" or r["_field"] == "pm10" or r["_field"] == "no2" or r["_field"] == "so2" or r["_field"] == "o3")
                  |> filter(fn: (r) => types.isNumeric(v: r._value) and not math.isNaN(f: r._value))

                counts = base_data |> group(columns: ["_field"]) |> count() |> group() |> yield(name: "counts")
                means = base_data |> group(columns: ["_field"]) |> mean() |> group() |> yield(name: "means")
            "#,
            bucket = self.bucket,
            window = window,
            location_filter = location_filter,
        );
        let records = self.query(&flux).await?;

        let mut means: BTreeMap<String, f64> = BTreeMap::new();
        let mut counts: BTreeMap<String, u64> = BTreeMap::new();
        for record in &records {
            let field = match record_str(record, "_field") {
                Some(f) => f,
                None => continue,
            };
            let table_name = record_str(record, "result");
            match table_name.as_deref() {
                Some("means") => {
                    if let Some(v) = record_f64(record, "_value") {
                        means.insert(field, v);
                    }
                }
                Some("counts") => {
                    if let Some(v) = record_f64(record, "_value") {
                        counts.insert(field, v as u64);
                    }
                }
                _ => {}
            }
        }

        if means.is_empty() && counts.is_empty() {
            return Ok(None);
        }

        let data_points_count = counts.values().copied().max().unwrap_or(0);
        if counts.values().collect::<std::collections::HashSet<_>>().len() > 1 {
            warn!("inconsistent counts across fields: {counts:?}; using max {data_points_count}");
        }

        Ok(Some(PollutionDensity {
            region_name: format!(
                "BBox:[{min_lat:.4},{min_lon:.4} to {max_lat:.4},{max_lon:.4}]"
            ),
            average_pm25: means.get("pm25").copied(),
            average_pm10: means.get("pm10").copied(),
            average_no2: means.get("no2").copied(),
            average_so2: means.get("so2").copied(),
            average_o3: means.get("o3").copied(),
            data_points_count,
        }))
    }

    /// Anomalies in an optional time range, per
    /// `db_client.py::query_anomalies_from_db`'s conditional range filter.
    #[instrument(name = "StoreClient::query_anomalies", level = "debug", skip_all)]
    pub async fn query_anomalies(
        &self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Vec<Anomaly>> {
        let range_filter = match (start, end) {
            (None, None) => "|> range(start: -24h)".to_owned(),
            (Some(s), Some(e)) => {
                format!("|> range(start: {}, stop: {})", s.to_rfc3339(), e.to_rfc3339())
            }
            (Some(s), None) => format!("|> range(start: {})", s.to_rfc3339()),
            (None, Some(e)) => format!("|> range(start: 0, stop: {})", e.to_rfc3339()),
        };

        let flux = format!(
            r#"
                from(bucket: "{bucket}")
                  {range_filter}
                  |> filter(fn: (r) => r["_measurement"] == "air_quality_anomalies")
                  |> filter(fn: (r) => exists r.latitude and exists r.longitude and exists r.parameter and exists r.id)
                  |> filter(fn: (r) => r["_field"] == "value" or r["_field"] == "description")
                  |> pivot(rowKey:["_time", "id", "latitude", "longitude", "parameter"], columnKey: ["_field"], valueColumn: "_value")
                  |> sort(columns: ["_time"], desc: true)
            "#,
            bucket = self.bucket,
            range_filter = range_filter,
        );
        let records = self.query(&flux).await?;

        let mut anomalies = Vec::new();
        for record in &records {
            let (Some(id), Some(lat), Some(lon), Some(parameter), Some(value), Some(description)) = (
                record_str(record, "id"),
                record_f64(record, "latitude"),
                record_f64(record, "longitude"),
                record_str(record, "parameter"),
                record_f64(record, "value"),
                record_str(record, "description"),
            ) else {
                warn!("skipping anomaly record with missing fields/tags");
                continue;
            };
            anomalies.push(Anomaly {
                id,
                latitude: lat,
                longitude: lon,
                timestamp: record_time(record).unwrap_or_else(Utc::now),
                parameter,
                value,
                description,
            });
        }
        Ok(anomalies)
    }

    /// Time-bucketed mean of one parameter within one geohash cell.
    #[instrument(name = "StoreClient::query_history", level = "debug", skip_all)]
    pub async fn query_history(
        &self,
        cell_prefix: &str,
        parameter: &str,
        window: &str,
        aggregate_step: &str,
    ) -> Result<Vec<TimeSeriesPoint>> {
        let flux = format!(
            r#"
                from(bucket: "{bucket}")
                  |> range(start: -{window})
                  |> filter(fn: (r) => r["_measurement"] == "air_quality")
                  |> filter(fn: (r) => r["geohash"] == "{cell_prefix}")
                  |> filter(fn: (r) => r["_field"] == "{parameter}")
                  |> aggregateWindow(every: {aggregate_step}, fn: mean, createEmpty: false)
                  |> sort(columns: ["_time"])
            "#,
            bucket = self.bucket,
            window = window,
            cell_prefix = cell_prefix,
            parameter = parameter,
            aggregate_step = aggregate_step,
        );
        let records = self.query(&flux).await?;

        Ok(records
            .iter()
            .filter_map(|r| {
                let value = record_f64(r, "_value")?;
                let timestamp = record_time(r)?;
                Some(TimeSeriesPoint { timestamp, value })
            })
            .collect())
    }

    fn location_filter(&self, min_lat: f64, max_lat: f64, min_lon: f64, max_lon: f64) -> String {
        let cells = geohash_index::cover_bbox(
            min_lat,
            max_lat,
            min_lon,
            max_lon,
            BBOX_FILTER_PRECISION,
        );
        if cells.is_empty() {
            warn!("bbox query falling back to coordinate filtering (no geohash cells)");
            format!(
                r#"
                  |> filter(fn: (r) => exists r.latitude and exists r.longitude)
                  |> map(fn: (r) => ({{ r with latitude_float: float(v: r.latitude), longitude_float: float(v: r.longitude) }}))
                  |> filter(fn: (r) => r.latitude_float >= {min_lat} and r.latitude_float <= {max_lat} and r.longitude_float >= {min_lon} and r.longitude_float <= {max_lon})
                "#
            )
        } else {
            let set = serde_json::to_string(&cells).expect("serializing a Vec<String> cannot fail");
            format!(r#"|> filter(fn: (r) => contains(value: r.geohash, set: {set}))"#)
        }
    }

    async fn query(&self, flux: &str) -> Result<Vec<FluxRecord>> {
        let query = Query::new(flux.to_owned());
        self.client
            .query_raw(Some(query))
            .await
            .context("InfluxDB query failed")
    }
}

fn reading_from_record(record: &FluxRecord, default_lat: f64, default_lon: f64) -> Reading {
    Reading {
        latitude: record_f64(record, "latitude").unwrap_or(default_lat),
        longitude: record_f64(record, "longitude").unwrap_or(default_lon),
        timestamp: record_time(record).unwrap_or_else(Utc::now),
        pm25: record_f64(record, "pm25"),
        pm10: record_f64(record, "pm10"),
        no2: record_f64(record, "no2"),
        so2: record_f64(record, "so2"),
        o3: record_f64(record, "o3"),
    }
}

fn record_f64(record: &FluxRecord, key: &str) -> Option<f64> {
    use influxdb2::models::Value;
    match record.values.get(key) {
        Some(Value::Double(v)) => Some(*v),
        Some(Value::Long(v)) => Some(*v as f64),
        Some(Value::String(s)) => s.parse().ok(),
        _ => None,
    }
}

fn record_str(record: &FluxRecord, key: &str) -> Option<String> {
    use influxdb2::models::Value;
    match record.values.get(key) {
        Some(Value::String(s)) => Some(s.clone()),
        Some(other) => Some(format!("{other:?}")),
        None => None,
    }
}

fn record_time(record: &FluxRecord) -> Option<DateTime<Utc>> {
    use influxdb2::models::Value;
    match record.values.get("_time") {
        Some(Value::TimeRFC(t)) => Some(t.with_timezone(&Utc)),
        _ => None,
    }
}

/// Great-circle distance in kilometers, used by the 50km radius fallback.
fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    const EARTH_RADIUS_KM: f64 = 6371.0;
    let d_lat = (lat2 - lat1).to_radians();
    let d_lon = (lon2 - lon1).to_radians();
    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    EARTH_RADIUS_KM * c
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn haversine_zero_distance_at_same_point() {
        assert!(haversine_km(41.0, 29.0, 41.0, 29.0) < 1e-6);
    }

    #[test]
    fn haversine_known_distance() {
        // Istanbul to Ankara, roughly 350 km.
        let d = haversine_km(41.0082, 28.9784, 39.9334, 32.8597);
        assert!((300.0..400.0).contains(&d), "got {d}");
    }
}
