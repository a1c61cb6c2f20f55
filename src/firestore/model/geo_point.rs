use serde::{Deserialize, Serialize};

use crate::firestore::error::{invalid_argument, FirestoreResult};

/// Latitude and longitude in degrees.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    latitude: f64,
    longitude: f64,
}

impl GeoPoint {
    pub fn new(latitude: f64, longitude: f64) -> FirestoreResult<Self> {
        let check = |name: &str, value: f64, bound: f64| {
            if value.is_finite() && value.abs() <= bound {
                Ok(())
            } else {
                Err(invalid_argument(format!("{name} must be a number between -{bound} and {bound}, got {value}")))
            }
        };
        check("Latitude", latitude, 90.0)?;
        check("Longitude", longitude, 180.0)?;
        Ok(Self { latitude, longitude })
    }

    pub fn latitude(&self) -> f64 {
        self.latitude
    }

    pub fn longitude(&self) -> f64 {
        self.longitude
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validates_ranges() {
        let point = GeoPoint::new(-33.9, 151.2).unwrap();
        assert_eq!((point.latitude(), point.longitude()), (-33.9, 151.2));
        assert!(GeoPoint::new(90.5, 0.0).is_err());
        assert!(GeoPoint::new(0.0, f64::NAN).is_err());
    }
}
