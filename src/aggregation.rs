//! In-process aggregation of raw readings into heatmap cells (part of C9).
//!
//! Grounded on `examples/original_source/backend/app/aggregation.py`'s
//! per-cell averaging. Lat/lon round to 6 decimals per `SPEC_FULL.md` §9 (the
//! original rounds to 5); pollutant means round to 2 decimals, matching
//! `aggregation.py:44-48`.

use std::collections::BTreeMap;

use crate::geohash_index;
use crate::models::{AggregatedPoint, Reading};

/// Map a map zoom level to a geohash aggregation precision, per the
/// glossary's `z≤3→2, z≤5→3, z≤7→4, z≤10→5, z≤13→6, else 7` table.
pub fn precision_for_zoom(zoom: u32) -> usize {
    match zoom {
        0..=3 => 2,
        4..=5 => 3,
        6..=7 => 4,
        8..=10 => 5,
        11..=13 => 6,
        _ => 7,
    }
}

/// Group readings by the geohash prefix of `precision` and average each
/// pollutant within each cell.
pub fn aggregate_by_cell(readings: &[Reading], precision: usize) -> Vec<AggregatedPoint> {
    let mut cells: BTreeMap<String, Vec<&Reading>> = BTreeMap::new();
    for reading in readings {
        let cell = match geohash_index::encode(reading.latitude, reading.longitude, precision) {
            Ok(hash) => hash,
            Err(_) => continue,
        };
        cells.entry(cell).or_default().push(reading);
    }

    cells
        .into_iter()
        .map(|(geohash, members)| {
            let avg = |f: fn(&Reading) -> Option<f64>| -> Option<f64> {
                let values: Vec<f64> = members.iter().filter_map(|r| f(r)).collect();
                if values.is_empty() {
                    None
                } else {
                    Some(round2(values.iter().sum::<f64>() / values.len() as f64))
                }
            };
            let lat = round6(
                members.iter().map(|r| r.latitude).sum::<f64>() / members.len() as f64,
            );
            let lon = round6(
                members.iter().map(|r| r.longitude).sum::<f64>() / members.len() as f64,
            );
            AggregatedPoint {
                geohash,
                latitude: lat,
                longitude: lon,
                avg_pm25: avg(|r| r.pm25),
                avg_pm10: avg(|r| r.pm10),
                avg_no2: avg(|r| r.no2),
                avg_so2: avg(|r| r.so2),
                avg_o3: avg(|r| r.o3),
                count: members.len() as u64,
            }
        })
        .collect()
}

fn round6(value: f64) -> f64 {
    (value * 1_000_000.0).round() / 1_000_000.0
}

/// Pollutant means round to 2 decimals, per `aggregation.py`'s
/// `round(self.pmXX_sum / self.count, 2)`.
fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn reading(lat: f64, lon: f64, pm25: f64) -> Reading {
        Reading {
            latitude: lat,
            longitude: lon,
            timestamp: Utc::now(),
            pm25: Some(pm25),
            pm10: None,
            no2: None,
            so2: None,
            o3: None,
        }
    }

    #[test]
    fn aggregates_shared_prefix_cells() {
        let readings = vec![
            reading(41.0082, 28.9784, 10.0),
            reading(41.0083, 28.9785, 20.0),
            reading(41.0084, 28.9786, 30.0),
            reading(41.0085, 28.9787, 40.0),
        ];
        let points = aggregate_by_cell(&readings, 5);
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].count, 4);
        assert_eq!(points[0].avg_pm25, Some(25.0));
    }

    #[test]
    fn pollutant_means_round_to_two_decimals() {
        let readings = vec![
            reading(41.0082, 28.9784, 10.0),
            reading(41.0083, 28.9785, 20.0),
            reading(41.0084, 28.9786, 31.0),
        ];
        let points = aggregate_by_cell(&readings, 5);
        assert_eq!(points.len(), 1);
        // (10 + 20 + 31) / 3 = 20.333... -> 20.33
        assert_eq!(points[0].avg_pm25, Some(20.33));
    }

    #[test]
    fn zoom_precision_table() {
        assert_eq!(precision_for_zoom(2), 2);
        assert_eq!(precision_for_zoom(5), 3);
        assert_eq!(precision_for_zoom(7), 4);
        assert_eq!(precision_for_zoom(10), 5);
        assert_eq!(precision_for_zoom(13), 6);
        assert_eq!(precision_for_zoom(18), 7);
    }
}
