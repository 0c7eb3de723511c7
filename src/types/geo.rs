//! Coordinate primitives.

use serde::{Deserialize, Serialize};

/// Mean Earth radius in kilometres, used by the haversine distance.
pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// A WGS-84 coordinate pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

impl GeoPoint {
    /// Build a point, rejecting out-of-range coordinates.
    ///
    /// Latitude must lie in [-90, 90], longitude in [-180, 180]; NaN and
    /// infinities are rejected as well.
    pub fn new(lat: f64, lon: f64) -> Option<Self> {
        if !lat.is_finite() || !lon.is_finite() {
            return None;
        }
        if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
            return None;
        }
        Some(Self { lat, lon })
    }

    /// Great-circle distance to another point in kilometres (haversine).
    pub fn distance_km(&self, other: &Self) -> f64 {
        let (lat1, lon1) = (self.lat.to_radians(), self.lon.to_radians());
        let (lat2, lon2) = (other.lat.to_radians(), other.lon.to_radians());
        let dlat = lat2 - lat1;
        let dlon = lon2 - lon1;
        let sin_dlat = (dlat * 0.5).sin();
        let sin_dlon = (dlon * 0.5).sin();
        let h = sin_dlat * sin_dlat + lat1.cos() * lat2.cos() * sin_dlon * sin_dlon;
        let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());
        EARTH_RADIUS_KM * c
    }
}
