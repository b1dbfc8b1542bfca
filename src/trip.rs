//! Trip records produced by the lifecycle tracker.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::fleet::{GeoLocation, Pricing, Vehicle};

/// What a finalized trip most likely was.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TripKind {
    Customer,
    Relocation,
    Recharge,
}

impl fmt::Display for TripKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TripKind::Customer => "customer",
            TripKind::Relocation => "relocation",
            TripKind::Recharge => "recharge",
        };
        f.write_str(s)
    }
}

/// A trip whose vehicle has vanished but not yet reappeared.
#[derive(Debug, Clone, PartialEq)]
pub struct OpenTrip {
    pub vehicle_id: String,
    pub provider: String,
    pub start_location: GeoLocation,
    pub start_charge: f64,
    pub started_at: DateTime<Utc>,
}

impl OpenTrip {
    /// Opens a trip from the last observation of a now missing vehicle.
    pub fn from_last_seen(vehicle: &Vehicle, started_at: DateTime<Utc>) -> Self {
        Self {
            vehicle_id: vehicle.id.clone(),
            provider: vehicle.provider.clone(),
            start_location: vehicle.location,
            start_charge: vehicle.charge_level,
            started_at,
        }
    }

    /// Closes the trip with the vehicle's reappearance observed at `ended_at`.
    pub fn finalize(self, seen: &Vehicle, ended_at: DateTime<Utc>) -> Trip {
        let duration = ended_at - self.started_at;
        let distance_km = self.start_location.distance_km(&seen.location);
        let cost = trip_cost(&seen.pricing, duration);

        Trip {
            id: format!("{}-{}", self.vehicle_id, self.started_at.timestamp()),
            vehicle_id: self.vehicle_id,
            provider: self.provider,
            start_location: self.start_location,
            end_location: seen.location,
            start_charge: self.start_charge,
            end_charge: seen.charge_level,
            started_at: self.started_at,
            ended_at,
            duration,
            distance_km,
            cost,
            user_id: seen.state_updated_by.clone(),
            kind: None,
        }
    }
}

/// Flat fee plus the per-minute rate for every started-and-completed minute.
/// Non-positive durations are billed as the flat fee only.
pub fn trip_cost(pricing: &Pricing, duration: Duration) -> u64 {
    let minutes = duration.num_minutes().max(0) as u64;
    pricing.init_fee + pricing.per_minute * minutes
}

/// A finalized trip. Immutable apart from its classification tag.
#[derive(Debug, Clone, PartialEq)]
pub struct Trip {
    pub id: String,
    pub vehicle_id: String,
    pub provider: String,
    pub start_location: GeoLocation,
    pub end_location: GeoLocation,
    pub start_charge: f64,
    pub end_charge: f64,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration: Duration,
    pub distance_km: f64,
    /// Minor currency units.
    pub cost: u64,
    pub user_id: Option<String>,
    pub kind: Option<TripKind>,
}

impl Trip {
    /// Charge consumed during the trip; negative when the vehicle was charged.
    pub fn energy_used(&self) -> f64 {
        self.start_charge - self.end_charge
    }

    pub fn with_kind(mut self, kind: TripKind) -> Self {
        self.kind = Some(kind);
        self
    }
}
