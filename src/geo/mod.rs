//! Captain location index.
//!
//! Geospatial store of the latest known position per captain:
//!
//! - **Upsert**: replace a captain's position, rejecting invalid coordinates
//! - **Radius query**: captains within K kilometres of a point, sorted
//!   ascending by haversine distance
//! - **Point lookup / removal**
//!
//! Positions are bucketed into a fixed-size degree grid so a radius query
//! only touches the cells intersecting the query circle instead of scanning
//! every captain. Positions carry their update instant but the index applies
//! no TTL — staleness policy belongs to the consumers (the tracking hub
//! expires positions after `locationExpirySec`; the dispatcher filters by
//! presence).

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use chrono::{DateTime, Utc};

use crate::error::DispatchError;
use crate::types::{CaptainId, GeoPoint};

/// Grid cell edge in degrees (~1.1 km of latitude).
const CELL_DEG: f64 = 0.01;

/// Kilometres per degree of latitude (WGS-84 mean).
const KM_PER_LAT_DEG: f64 = 110.574;

/// A captain's last reported position.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptainPosition {
    pub captain_id: CaptainId,
    pub point: GeoPoint,
    pub updated_at: DateTime<Utc>,
}

#[derive(Default)]
struct Inner {
    positions: HashMap<CaptainId, CaptainPosition>,
    cells: HashMap<(i32, i32), HashSet<CaptainId>>,
}

/// Shared, thread-safe location index.
///
/// Writes happen on every captain location ping; reads on every dispatch
/// radius pass and tracking snapshot. Both are short critical sections over
/// an `RwLock`.
#[derive(Default)]
pub struct LocationIndex {
    inner: RwLock<Inner>,
}

fn cell_of(point: GeoPoint) -> (i32, i32) {
    // Rounding toward negative infinity keeps cells stable across the
    // meridian and equator.
    let lat = (point.lat / CELL_DEG).floor() as i32;
    let lon = (point.lon / CELL_DEG).floor() as i32;
    (lat, lon)
}

impl LocationIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a captain's position.
    pub fn upsert(&self, captain_id: &str, lat: f64, lon: f64) -> Result<GeoPoint, DispatchError> {
        let point = GeoPoint::new(lat, lon).ok_or_else(|| {
            DispatchError::InvalidCoordinates(format!("lat={lat} lon={lon}"))
        })?;

        let mut inner = self.write();
        let cell = cell_of(point);
        if let Some(prev) = inner.positions.get(captain_id) {
            let prev_cell = cell_of(prev.point);
            if prev_cell != cell {
                if let Some(members) = inner.cells.get_mut(&prev_cell) {
                    members.remove(captain_id);
                    if members.is_empty() {
                        inner.cells.remove(&prev_cell);
                    }
                }
            }
        }
        inner
            .cells
            .entry(cell)
            .or_default()
            .insert(captain_id.to_owned());
        inner.positions.insert(
            captain_id.to_owned(),
            CaptainPosition {
                captain_id: captain_id.to_owned(),
                point,
                updated_at: Utc::now(),
            },
        );
        Ok(point)
    }

    /// Captains within `km` of `origin`, ascending by distance, capped at
    /// `limit`.
    pub fn radius(&self, origin: GeoPoint, km: f64, limit: usize) -> Vec<(CaptainId, f64)> {
        if km <= 0.0 || limit == 0 {
            return Vec::new();
        }
        let inner = self.read();

        // Cell span of the query circle. Longitude degrees shrink with
        // latitude; guard the cosine near the poles.
        let lat_span = (km / KM_PER_LAT_DEG / CELL_DEG).ceil() as i32;
        let lon_km_per_deg = KM_PER_LAT_DEG * origin.lat.to_radians().cos().max(0.01);
        let lon_span = (km / lon_km_per_deg / CELL_DEG).ceil() as i32;
        let (origin_lat_cell, origin_lon_cell) = cell_of(origin);

        let mut hits: Vec<(CaptainId, f64)> = Vec::new();
        for lat_cell in (origin_lat_cell - lat_span)..=(origin_lat_cell + lat_span) {
            for lon_cell in (origin_lon_cell - lon_span)..=(origin_lon_cell + lon_span) {
                let Some(members) = inner.cells.get(&(lat_cell, lon_cell)) else {
                    continue;
                };
                for captain_id in members {
                    let Some(position) = inner.positions.get(captain_id) else {
                        continue;
                    };
                    let dist = origin.distance_km(&position.point);
                    if dist <= km {
                        hits.push((captain_id.clone(), dist));
                    }
                }
            }
        }

        hits.sort_by(|a, b| a.1.total_cmp(&b.1));
        hits.truncate(limit);
        hits
    }

    /// Last reported position for a captain.
    pub fn position(&self, captain_id: &str) -> Option<CaptainPosition> {
        self.read().positions.get(captain_id).cloned()
    }

    /// Drop a captain from the index. Returns whether it was present.
    pub fn remove(&self, captain_id: &str) -> bool {
        let mut inner = self.write();
        let Some(position) = inner.positions.remove(captain_id) else {
            return false;
        };
        let cell = cell_of(position.point);
        if let Some(members) = inner.cells.get_mut(&cell) {
            members.remove(captain_id);
            if members.is_empty() {
                inner.cells.remove(&cell);
            }
        }
        true
    }

    /// Snapshot of every tracked position (tracking-hub initial payload).
    pub fn all(&self) -> Vec<CaptainPosition> {
        self.read().positions.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Inner> {
        // A poisoned lock means a writer panicked mid-update; positions are
        // last-write-wins so continuing with the current state is sound.
        match self.inner.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Inner> {
        match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index_with(entries: &[(&str, f64, f64)]) -> LocationIndex {
        let index = LocationIndex::new();
        for (id, lat, lon) in entries {
            index.upsert(id, *lat, *lon).unwrap();
        }
        index
    }

    #[test]
    fn rejects_invalid_coordinates() {
        let index = LocationIndex::new();
        assert!(matches!(
            index.upsert("c1", 91.0, 0.0),
            Err(DispatchError::InvalidCoordinates(_))
        ));
        assert!(index.position("c1").is_none());
    }

    #[test]
    fn radius_returns_sorted_ascending() {
        // Offsets around central Baghdad; ~1.11 km per 0.01 deg latitude.
        let index = index_with(&[
            ("far", 33.345, 44.366),
            ("near", 33.318, 44.366),
            ("mid", 33.330, 44.366),
        ]);
        let origin = GeoPoint { lat: 33.315, lon: 44.366 };
        let hits = index.radius(origin, 5.0, 50);
        let ids: Vec<&str> = hits.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["near", "mid", "far"]);
        assert!(hits.windows(2).all(|w| w[0].1 <= w[1].1));
    }

    #[test]
    fn radius_excludes_captains_outside_circle() {
        let index = index_with(&[("in", 33.320, 44.366), ("out", 33.40, 44.366)]);
        let origin = GeoPoint { lat: 33.315, lon: 44.366 };
        let hits = index.radius(origin, 2.0, 50);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, "in");
    }

    #[test]
    fn radius_respects_limit() {
        let index = index_with(&[
            ("a", 33.316, 44.366),
            ("b", 33.317, 44.366),
            ("c", 33.318, 44.366),
        ]);
        let origin = GeoPoint { lat: 33.315, lon: 44.366 };
        assert_eq!(index.radius(origin, 5.0, 2).len(), 2);
    }

    #[test]
    fn upsert_moves_captain_between_cells() {
        let index = index_with(&[("c1", 33.315, 44.366)]);
        index.upsert("c1", 33.40, 44.50).unwrap();
        let origin = GeoPoint { lat: 33.315, lon: 44.366 };
        assert!(index.radius(origin, 2.0, 50).is_empty());
        let new_origin = GeoPoint { lat: 33.40, lon: 44.50 };
        assert_eq!(index.radius(new_origin, 1.0, 50).len(), 1);
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn remove_clears_position_and_cell() {
        let index = index_with(&[("c1", 33.315, 44.366)]);
        assert!(index.remove("c1"));
        assert!(!index.remove("c1"));
        assert!(index.is_empty());
        let origin = GeoPoint { lat: 33.315, lon: 44.366 };
        assert!(index.radius(origin, 5.0, 50).is_empty());
    }
}
