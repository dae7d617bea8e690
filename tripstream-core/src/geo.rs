//! Great-circle geometry over WGS84 latitude/longitude pairs.

const EARTH_RADIUS_KM: f64 = 6371.0;

/// Great-circle (haversine) distance between two points, in kilometers.
pub fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let d_lat = (lat2 - lat1).to_radians();
    let d_lon = (lon2 - lon1).to_radians();

    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    EARTH_RADIUS_KM * c
}

/// Convenience wrapper returning meters.
pub fn haversine_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    haversine_km(lat1, lon1, lat2, lon2) * 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_degree_of_longitude_at_equator() {
        let dist = haversine_km(0.0, 0.0, 0.0, 1.0);
        // One degree of longitude at the equator is ~111.19 km.
        assert!((dist - 111.19).abs() < 0.5, "got {dist}");
    }

    #[test]
    fn zero_distance_for_identical_points() {
        assert_eq!(haversine_km(45.5, -122.6, 45.5, -122.6), 0.0);
    }

    #[test]
    fn symmetric() {
        let a = haversine_km(59.33, 18.06, 55.68, 12.57);
        let b = haversine_km(55.68, 12.57, 59.33, 18.06);
        assert!((a - b).abs() < 1e-9);
    }

    #[test]
    fn meters_wrapper_scales() {
        let km = haversine_km(0.0, 0.0, 0.0, 0.01);
        let m = haversine_m(0.0, 0.0, 0.0, 0.01);
        assert!((m - km * 1000.0).abs() < 1e-9);
    }
}
