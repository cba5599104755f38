//! Geohash primitives: encode/decode (via the `geohash` crate) and bbox
//! covering-set expansion (hand-rolled; see module docs).
//!
//! `cover_bbox`'s recursive seed-and-refine algorithm is a direct port of
//! `examples/original_source/backend/app/db_client.py::calculate_geohashes_for_bbox`,
//! re-expressed in idiomatic Rust.

use std::collections::HashSet;

use geohash::{Coord, Direction};
use thiserror::Error;

/// Base-32 alphabet used by geohash encoding, kept here for the expansion
/// step that appends one character to a prefix.
pub const BASE32_CHARS: &str = "0123456789bcdefghjkmnpqrstuvwxyz";

const ALL_DIRECTIONS: [Direction; 8] = [
    Direction::N,
    Direction::S,
    Direction::E,
    Direction::W,
    Direction::NE,
    Direction::NW,
    Direction::SE,
    Direction::SW,
];

#[derive(Debug, Error)]
pub enum GeohashIndexError {
    #[error("could not encode ({lat}, {lon}) at precision {precision}: {source}")]
    Encode {
        lat: f64,
        lon: f64,
        precision: usize,
        #[source]
        source: geohash::GeohashError,
    },
}

/// A closed-interval bounding box: south/west/north/east.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BBox {
    pub south: f64,
    pub west: f64,
    pub north: f64,
    pub east: f64,
}

impl BBox {
    fn intersects(&self, other: &BBox) -> bool {
        self.south <= other.north
            && self.north >= other.south
            && self.west <= other.east
            && self.east >= other.west
    }
}

/// Encode a coordinate to a geohash of the given length.
pub fn encode(lat: f64, lon: f64, precision: usize) -> Result<String, GeohashIndexError> {
    geohash::encode(Coord { x: lon, y: lat }, precision).map_err(|source| {
        GeohashIndexError::Encode {
            lat,
            lon,
            precision,
            source,
        }
    })
}

/// Decode a geohash prefix to the bounding box of the cell it identifies.
pub fn decode_bbox(hash: &str) -> Result<BBox, geohash::GeohashError> {
    let (center, lon_err, lat_err) = geohash::decode(hash)?;
    Ok(BBox {
        south: center.y - lat_err,
        north: center.y + lat_err,
        west: center.x - lon_err,
        east: center.x + lon_err,
    })
}

/// Compute every geohash prefix of `precision` whose cell intersects the
/// closed rectangle `[min_lat, max_lat] x [min_lon, max_lon]`.
///
/// Falls back to a single hash encoding the bbox's center if no seed hash
/// could be produced at all (degenerate/invalid bbox).
pub fn cover_bbox(
    min_lat: f64,
    max_lat: f64,
    min_lon: f64,
    max_lon: f64,
    precision: usize,
) -> Vec<String> {
    let target = BBox {
        south: min_lat,
        north: max_lat,
        west: min_lon,
        east: max_lon,
    };

    let start_precision = if precision > 1 { precision.min(4) } else { 1 };

    let seed_points = [
        ((min_lat + max_lat) / 2.0, (min_lon + max_lon) / 2.0),
        (min_lat, min_lon),
        (min_lat, max_lon),
        (max_lat, min_lon),
        (max_lat, max_lon),
    ];

    let mut seeds = HashSet::new();
    for (lat, lon) in seed_points {
        if (-90.0..=90.0).contains(&lat) && (-180.0..=180.0).contains(&lon) {
            if let Ok(h) = encode(lat, lon, start_precision) {
                seeds.insert(h);
            }
        }
    }

    if seeds.is_empty() {
        let center_lat = (min_lat + max_lat) / 2.0;
        let center_lon = (min_lon + max_lon) / 2.0;
        return match encode(center_lat, center_lon, precision) {
            Ok(h) => vec![h],
            Err(_) => Vec::new(),
        };
    }

    let mut checked: HashSet<String> = HashSet::new();
    let mut in_bbox: HashSet<String> = HashSet::new();

    let mut stack: Vec<String> = seeds.into_iter().collect();
    while let Some(h) = stack.pop() {
        if checked.contains(&h) {
            continue;
        }
        checked.insert(h.clone());

        let bbox = match decode_bbox(&h) {
            Ok(bbox) => bbox,
            Err(_) => continue,
        };
        if !bbox.intersects(&target) {
            continue;
        }

        if h.len() == precision {
            in_bbox.insert(h);
            continue;
        }

        if h.len() < precision {
            for dir in ALL_DIRECTIONS {
                if let Ok(neighbor) = geohash::neighbor(&h, dir) {
                    if neighbor.len() <= precision {
                        stack.push(neighbor);
                    }
                }
            }
            for c in BASE32_CHARS.chars() {
                let child = format!("{h}{c}");
                if child.len() <= precision {
                    stack.push(child);
                }
            }
        }
    }

    in_bbox.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trip_contains_point() {
        let lat = 41.015;
        let lon = 28.979;
        for precision in 1..=9 {
            let h = encode(lat, lon, precision).unwrap();
            let bbox = decode_bbox(&h).unwrap();
            assert!(bbox.south <= lat && lat <= bbox.north, "precision {precision}");
            assert!(bbox.west <= lon && lon <= bbox.east, "precision {precision}");
        }
    }

    #[test]
    fn cover_bbox_covers_every_contained_point() {
        let (min_lat, max_lat, min_lon, max_lon) = (40.9, 41.1, 28.9, 29.1);
        let precision = 5;
        let cells = cover_bbox(min_lat, max_lat, min_lon, max_lon, precision);
        assert!(!cells.is_empty());

        let sample = encode(40.95, 29.00, precision).unwrap();
        assert!(cells.contains(&sample));

        for cell in &cells {
            let bbox = decode_bbox(cell).unwrap();
            let target = BBox {
                south: min_lat,
                north: max_lat,
                west: min_lon,
                east: max_lon,
            };
            assert!(bbox.intersects(&target));
        }
    }

    #[test]
    fn cover_bbox_falls_back_on_degenerate_input() {
        let cells = cover_bbox(1000.0, 1000.0, 1000.0, 1000.0, 5);
        assert!(cells.is_empty() || cells.len() == 1);
    }
}
