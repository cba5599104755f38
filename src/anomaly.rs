//! Pure-function threshold anomaly detection.
//!
//! Grounded on
//! `examples/original_source/backend/app/anomaly_detection.py::check_thresholds`,
//! extended to cover all five configured pollutants (the Python only wires
//! pm25/pm10/no2; so2/o3 follow the identical pattern, per `SPEC_FULL.md` §4.3).

use tracing::warn;
use uuid::Uuid;

use crate::config::Thresholds;
use crate::models::{Anomaly, Reading};

/// Checks a reading against predefined hazardous thresholds.
pub fn check_thresholds(reading: &Reading, thresholds: &Thresholds) -> Option<Anomaly> {
    let checks: [(&str, Option<f64>, f64, &str); 5] = [
        ("pm25", reading.pm25, thresholds.pm25, "PM2.5"),
        ("pm10", reading.pm10, thresholds.pm10, "PM10"),
        ("no2", reading.no2, thresholds.no2, "NO2"),
        ("so2", reading.so2, thresholds.so2, "SO2"),
        ("o3", reading.o3, thresholds.o3, "O3"),
    ];

    for (parameter, value, threshold, label) in checks {
        if let Some(value) = value {
            if value > threshold {
                let description = format!(
                    "{label} value {value:.1} exceeds hazardous threshold ({threshold:.1})"
                );
                let anomaly = Anomaly {
                    id: format!("anomaly_{}", Uuid::new_v4()),
                    latitude: reading.latitude,
                    longitude: reading.longitude,
                    timestamp: reading.timestamp,
                    parameter: parameter.to_owned(),
                    value,
                    description,
                };
                warn!(
                    "anomaly detected: {} at ({}, {})",
                    anomaly.description, reading.latitude, reading.longitude
                );
                return Some(anomaly);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn reading(pm25: Option<f64>, pm10: Option<f64>) -> Reading {
        Reading {
            latitude: 41.0,
            longitude: 29.0,
            timestamp: Utc::now(),
            pm25,
            pm10,
            no2: None,
            so2: None,
            o3: None,
        }
    }

    #[test]
    fn no_anomaly_when_under_threshold() {
        let thresholds = Thresholds::default();
        assert!(check_thresholds(&reading(Some(10.0), Some(20.0)), &thresholds).is_none());
    }

    #[test]
    fn first_exceedance_wins_in_source_order() {
        let thresholds = Thresholds::default();
        let r = reading(Some(300.0), Some(500.0));
        let anomaly = check_thresholds(&r, &thresholds).expect("expected anomaly");
        assert_eq!(anomaly.parameter, "pm25");
        assert_eq!(anomaly.value, 300.0);
        assert!(anomaly.id.starts_with("anomaly_"));
    }

    #[test]
    fn null_pollutant_is_skipped() {
        let thresholds = Thresholds::default();
        let r = reading(None, Some(500.0));
        let anomaly = check_thresholds(&r, &thresholds).expect("expected anomaly");
        assert_eq!(anomaly.parameter, "pm10");
    }
}
