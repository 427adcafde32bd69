//! Great-circle distance helpers.
//!
//! Straight-line distance ignores roads, so every figure derived from it is
//! an estimate suitable for clustering and payout previews only.

use crate::model::GeoPoint;

/// Earth radius in kilometers.
const EARTH_RADIUS_KM: f64 = 6371.0;

pub const KM_PER_MILE: f64 = 1.609_34;

/// Haversine distance between two points in kilometers.
pub fn haversine_km(from: GeoPoint, to: GeoPoint) -> f64 {
    let lat1_rad = from.lat.to_radians();
    let lat2_rad = to.lat.to_radians();
    let delta_lat = (to.lat - from.lat).to_radians();
    let delta_lng = (to.lng - from.lng).to_radians();

    let a = (delta_lat / 2.0).sin().powi(2)
        + lat1_rad.cos() * lat2_rad.cos() * (delta_lng / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().asin();

    EARTH_RADIUS_KM * c
}

pub fn haversine_miles(from: GeoPoint, to: GeoPoint) -> f64 {
    haversine_km(from, to) / KM_PER_MILE
}

pub fn km_to_miles(km: f64) -> f64 {
    km / KM_PER_MILE
}

pub fn miles_to_km(miles: f64) -> f64 {
    miles * KM_PER_MILE
}

pub fn is_valid(point: GeoPoint) -> bool {
    point.lat.is_finite()
        && point.lng.is_finite()
        && (-90.0..=90.0).contains(&point.lat)
        && (-180.0..=180.0).contains(&point.lng)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(lat: f64, lng: f64) -> GeoPoint {
        GeoPoint { lat, lng }
    }

    #[test]
    fn same_point_is_zero() {
        let d = haversine_km(p(55.86, -4.25), p(55.86, -4.25));
        assert!(d < 0.001);
    }

    #[test]
    fn glasgow_to_edinburgh() {
        // ~67 km as the crow flies
        let d = haversine_km(p(55.8642, -4.2518), p(55.9533, -3.1883));
        assert!(d > 60.0 && d < 75.0, "got {}", d);
        let miles = haversine_miles(p(55.8642, -4.2518), p(55.9533, -3.1883));
        assert!((miles - km_to_miles(d)).abs() < 1e-9);
    }

    #[test]
    fn symmetric() {
        let a = p(51.5074, -0.1278);
        let b = p(53.4808, -2.2426);
        assert!((haversine_km(a, b) - haversine_km(b, a)).abs() < 1e-9);
    }

    #[test]
    fn rejects_out_of_range() {
        assert!(is_valid(p(51.5, -0.12)));
        assert!(!is_valid(p(91.0, 0.0)));
        assert!(!is_valid(p(0.0, f64::NAN)));
        assert!((miles_to_km(1.0) - KM_PER_MILE).abs() < 1e-12);
    }
}
