//! Threshold rules that tell customer rides from staff movements.

use crate::trip::{Trip, TripKind};

/// Tolerances for sensor noise. Tuned per fleet and provider.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClassifierConfig {
    /// A trip ending with more charge than this above its start charge was a
    /// recharge.
    pub recharge_min_gain: f64,
    /// Relocations use less energy than this (charge-level points).
    pub relocation_max_energy: f64,
    /// ...while moving further than this many kilometers.
    pub relocation_min_distance_km: f64,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            recharge_min_gain: 0.0,
            relocation_max_energy: 1.1,
            relocation_min_distance_km: 1.0,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Classifier {
    config: ClassifierConfig,
}

impl Classifier {
    pub fn new(config: ClassifierConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ClassifierConfig {
        &self.config
    }

    /// Rules are evaluated in order: recharge, relocation, customer.
    pub fn classify(&self, trip: &Trip) -> TripKind {
        let c = &self.config;

        if trip.end_charge - trip.start_charge > c.recharge_min_gain {
            return TripKind::Recharge;
        }

        if trip.energy_used() < c.relocation_max_energy
            && trip.distance_km > c.relocation_min_distance_km
        {
            return TripKind::Relocation;
        }

        TripKind::Customer
    }

    /// Returns the trip tagged with its classification.
    pub fn tag(&self, trip: Trip) -> Trip {
        let kind = self.classify(&trip);
        trip.with_kind(kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fleet::GeoLocation;
    use chrono::{Duration, TimeZone, Utc};

    fn trip(start_charge: f64, end_charge: f64, distance_km: f64) -> Trip {
        let started_at = Utc.with_ymd_and_hms(2019, 10, 8, 5, 0, 0).unwrap();
        Trip {
            id: "s-1".to_string(),
            vehicle_id: "s".to_string(),
            provider: "test".to_string(),
            start_location: GeoLocation::new(51.0, 7.0),
            end_location: GeoLocation::new(51.0, 7.0),
            start_charge,
            end_charge,
            started_at,
            ended_at: started_at + Duration::minutes(10),
            duration: Duration::minutes(10),
            distance_km,
            cost: 300,
            user_id: None,
            kind: None,
        }
    }

    #[test]
    fn test_charge_increase_is_recharge_regardless_of_distance() {
        let c = Classifier::default();
        assert_eq!(c.classify(&trip(80.0, 85.0, 0.0)), TripKind::Recharge);
        assert_eq!(c.classify(&trip(80.0, 85.0, 5.0)), TripKind::Recharge);
    }

    #[test]
    fn test_small_energy_long_distance_is_relocation() {
        let c = Classifier::default();
        assert_eq!(c.classify(&trip(80.0, 79.5, 5.0)), TripKind::Relocation);
    }

    #[test]
    fn test_real_energy_use_is_customer() {
        let c = Classifier::default();
        assert_eq!(c.classify(&trip(80.0, 40.0, 5.0)), TripKind::Customer);
    }

    #[test]
    fn test_small_energy_short_distance_is_customer() {
        let c = Classifier::default();
        assert_eq!(c.classify(&trip(80.0, 79.5, 0.4)), TripKind::Customer);
        assert_eq!(c.classify(&trip(80.0, 80.0, 1.0)), TripKind::Customer);
    }

    #[test]
    fn test_thresholds_are_configurable() {
        let c = Classifier::new(ClassifierConfig {
            recharge_min_gain: 2.0,
            relocation_max_energy: 3.0,
            relocation_min_distance_km: 0.5,
        });
        assert_eq!(c.classify(&trip(80.0, 81.0, 0.0)), TripKind::Customer);
        assert_eq!(c.classify(&trip(80.0, 77.5, 0.8)), TripKind::Relocation);
    }

    #[test]
    fn test_tag_sets_kind() {
        let tagged = Classifier::default().tag(trip(80.0, 40.0, 2.0));
        assert_eq!(tagged.kind, Some(TripKind::Customer));
    }
}
