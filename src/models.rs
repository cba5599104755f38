//! Wire and storage data types.
//!
//! Field names and optionality are grounded on
//! `examples/original_source/backend/app/models.py`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A sensor reading as submitted to the ingestion endpoint. The worker -- not
/// the sender -- assigns the authoritative timestamp.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct IngestRequest {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub pm25: Option<f64>,
    #[serde(default)]
    pub pm10: Option<f64>,
    #[serde(default)]
    pub no2: Option<f64>,
    #[serde(default)]
    pub so2: Option<f64>,
    #[serde(default)]
    pub o3: Option<f64>,
}

impl IngestRequest {
    /// Validate bounds the way `models.py`'s `Field(..., ge=..., le=...)`
    /// constraints and `check_non_negative` validator do.
    pub fn validate(&self) -> Result<(), String> {
        if !(-90.0..=90.0).contains(&self.latitude) {
            return Err("latitude must be between -90 and 90".to_owned());
        }
        if !(-180.0..=180.0).contains(&self.longitude) {
            return Err("longitude must be between -180 and 180".to_owned());
        }
        for (name, value) in self.pollutants() {
            if let Some(v) = value {
                if v < 0.0 {
                    return Err(format!("{} cannot be negative", name));
                }
            }
        }
        Ok(())
    }

    /// Pollutant fields in the evaluation order used throughout the system:
    /// pm25, pm10, no2, so2, o3.
    pub fn pollutants(&self) -> [(&'static str, Option<f64>); 5] {
        [
            ("pm25", self.pm25),
            ("pm10", self.pm10),
            ("no2", self.no2),
            ("so2", self.so2),
            ("o3", self.o3),
        ]
    }

    /// True if every pollutant field is null -- such a reading is a
    /// successful no-op write.
    pub fn has_no_pollutants(&self) -> bool {
        self.pollutants().iter().all(|(_, v)| v.is_none())
    }
}

/// A fully processed air-quality reading, as persisted in the store.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Reading {
    pub latitude: f64,
    pub longitude: f64,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub pm25: Option<f64>,
    #[serde(default)]
    pub pm10: Option<f64>,
    #[serde(default)]
    pub no2: Option<f64>,
    #[serde(default)]
    pub so2: Option<f64>,
    #[serde(default)]
    pub o3: Option<f64>,
}

impl Reading {
    /// Build a `Reading` from an `IngestRequest`, stamping the current time
    /// the way `worker.py::process_message` always does (never trusting a
    /// client-supplied timestamp).
    pub fn from_ingest(req: &IngestRequest, timestamp: DateTime<Utc>) -> Reading {
        Reading {
            latitude: req.latitude,
            longitude: req.longitude,
            timestamp,
            pm25: req.pm25,
            pm10: req.pm10,
            no2: req.no2,
            so2: req.so2,
            o3: req.o3,
        }
    }

    pub fn pollutants(&self) -> [(&'static str, Option<f64>); 5] {
        [
            ("pm25", self.pm25),
            ("pm10", self.pm10),
            ("no2", self.no2),
            ("so2", self.so2),
            ("o3", self.o3),
        ]
    }

    pub fn pollutant(&self, name: &str) -> Option<f64> {
        match name {
            "pm25" => self.pm25,
            "pm10" => self.pm10,
            "no2" => self.no2,
            "so2" => self.so2,
            "o3" => self.o3,
            _ => None,
        }
    }
}

/// A detected anomaly event.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Anomaly {
    pub id: String,
    pub latitude: f64,
    pub longitude: f64,
    pub timestamp: DateTime<Utc>,
    pub parameter: String,
    pub value: f64,
    pub description: String,
}

/// A single aggregated grid cell, produced on demand for the heatmap
/// endpoint. Never persisted.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AggregatedPoint {
    pub geohash: String,
    pub latitude: f64,
    pub longitude: f64,
    pub avg_pm25: Option<f64>,
    pub avg_pm10: Option<f64>,
    pub avg_no2: Option<f64>,
    pub avg_so2: Option<f64>,
    pub avg_o3: Option<f64>,
    pub count: u64,
}

/// Response for the pollution-density endpoint.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PollutionDensity {
    pub region_name: String,
    pub average_pm25: Option<f64>,
    pub average_pm10: Option<f64>,
    pub average_no2: Option<f64>,
    pub average_so2: Option<f64>,
    pub average_o3: Option<f64>,
    pub data_points_count: u64,
}

/// A single point in a history/time-series response.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TimeSeriesPoint {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}
