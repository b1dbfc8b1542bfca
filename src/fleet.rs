//! Fleet observations: vehicles and the snapshots that group them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Coarse lifecycle state reported for a vehicle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VehicleState {
    IdleRentable,
    Broken,
    InUse,
}

/// A latitude/longitude pair in signed degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoLocation {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoLocation {
    /// Mean earth radius used for great-circle distances.
    pub const EARTH_RADIUS_KM: f64 = 6371.0;

    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Great-circle distance to `other` in kilometers (haversine formula).
    pub fn distance_km(&self, other: &GeoLocation) -> f64 {
        let lat1 = self.latitude.to_radians();
        let lat2 = other.latitude.to_radians();
        let d_lat = (other.latitude - self.latitude).to_radians();
        let d_lon = (other.longitude - self.longitude).to_radians();

        let a = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lon / 2.0).sin().powi(2);
        let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

        Self::EARTH_RADIUS_KM * c
    }
}

/// Prices valid at the time a vehicle was observed, in minor currency units.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pricing {
    pub init_fee: u64,
    pub per_minute: u64,
}

/// One observation of a vehicle inside a [`Snapshot`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vehicle {
    pub id: String,
    pub provider: String,
    pub state: VehicleState,
    pub location: GeoLocation,
    pub charge_level: f64,
    pub last_update: DateTime<Utc>,
    pub pricing: Pricing,
    /// User that last changed the vehicle's state, as reported by the provider.
    #[serde(default)]
    pub state_updated_by: Option<String>,
    #[serde(default)]
    pub zone: Option<String>,
}

/// Vehicles of one snapshot keyed by identifier.
///
/// Ordered so that everything derived from it (vanished sets, emitted trips)
/// comes out in the same order on every run.
pub type Fleet = BTreeMap<String, Vehicle>;

/// A complete, timestamped observation of the fleet.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub taken_at: DateTime<Utc>,
    pub provider: String,
    pub vehicles: Fleet,
}

impl Snapshot {
    /// Builds a snapshot from a list of observations. A later duplicate of an
    /// identifier replaces the earlier one, so each id appears at most once.
    pub fn new(
        taken_at: DateTime<Utc>,
        provider: impl Into<String>,
        vehicles: impl IntoIterator<Item = Vehicle>,
    ) -> Self {
        let vehicles = vehicles
            .into_iter()
            .map(|v| (v.id.clone(), v))
            .collect();

        Self {
            taken_at,
            provider: provider.into(),
            vehicles,
        }
    }

    pub fn len(&self) -> usize {
        self.vehicles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vehicles.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Vehicle> {
        self.vehicles.get(id)
    }

    /// Vehicles in identifier order.
    pub fn vehicles(&self) -> impl Iterator<Item = &Vehicle> {
        self.vehicles.values()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::TimeZone;

    pub(crate) fn vehicle(id: &str, charge: f64, lat: f64, lon: f64) -> Vehicle {
        Vehicle {
            id: id.to_string(),
            provider: "test".to_string(),
            state: VehicleState::IdleRentable,
            location: GeoLocation::new(lat, lon),
            charge_level: charge,
            last_update: Utc.with_ymd_and_hms(2019, 10, 8, 5, 0, 0).unwrap(),
            pricing: Pricing {
                init_fee: 100,
                per_minute: 20,
            },
            state_updated_by: None,
            zone: None,
        }
    }

    #[test]
    fn test_distance_same_point_is_zero() {
        let p = GeoLocation::new(51.5, 7.4);
        assert_eq!(p.distance_km(&p), 0.0);
    }

    #[test]
    fn test_distance_one_degree_latitude() {
        let a = GeoLocation::new(51.0, 7.0);
        let b = GeoLocation::new(52.0, 7.0);
        let d = a.distance_km(&b);
        assert!((d - 111.19).abs() < 0.01, "got {d}");
    }

    #[test]
    fn test_distance_is_symmetric() {
        let a = GeoLocation::new(51.582780, 7.325945);
        let b = GeoLocation::new(51.475727, 7.558172);
        assert!((a.distance_km(&b) - b.distance_km(&a)).abs() < 1e-9);
    }

    #[test]
    fn test_snapshot_dedupes_ids() {
        let at = Utc.with_ymd_and_hms(2019, 10, 8, 5, 11, 27).unwrap();
        let snapshot = Snapshot::new(
            at,
            "test",
            vec![
                vehicle("a", 80.0, 51.0, 7.0),
                vehicle("b", 50.0, 51.0, 7.0),
                vehicle("a", 79.0, 51.0, 7.0),
            ],
        );

        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.get("a").unwrap().charge_level, 79.0);
    }
}
