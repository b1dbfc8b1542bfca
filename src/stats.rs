//! Aggregate figures over the trips of a run.

use anyhow::Result;
use async_trait::async_trait;
use chrono::Duration;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use tracing::info;

use crate::sink::TripSink;
use crate::trip::{Trip, TripKind};

/// Running totals. Cost, energy, distance and duration figures only cover
/// customer trips; staff movements would skew them.
#[derive(Debug, Clone)]
pub struct TripStats {
    pub trips: usize,
    pub customer: usize,
    pub relocation: usize,
    pub recharge: usize,

    pub total_cost: u64,
    pub total_energy: f64,
    pub total_distance_km: f64,
    pub max_distance_km: f64,
    pub max_duration: Duration,
    /// Customer trips lasting at least `long_trip_threshold`.
    pub long_trips: usize,
    pub long_trip_threshold: Duration,

    vehicles: BTreeSet<String>,
    users: BTreeSet<String>,
}

/// Flat view of [`TripStats`] for logs and JSON output.
#[derive(Debug, Serialize)]
pub struct StatsSummary {
    pub trips: usize,
    pub customer: usize,
    pub relocation: usize,
    pub recharge: usize,
    pub total_cost: u64,
    pub avg_cost: f64,
    pub avg_energy: f64,
    pub avg_distance_km: f64,
    pub max_distance_km: f64,
    pub max_duration_mins: i64,
    pub long_trips: usize,
    pub unique_vehicles: usize,
    pub unique_users: usize,
}

impl Default for TripStats {
    fn default() -> Self {
        Self::with_long_trip_threshold(Duration::minutes(60))
    }
}

impl TripStats {
    pub fn with_long_trip_threshold(threshold: Duration) -> Self {
        Self {
            trips: 0,
            customer: 0,
            relocation: 0,
            recharge: 0,
            total_cost: 0,
            total_energy: 0.0,
            total_distance_km: 0.0,
            max_distance_km: 0.0,
            max_duration: Duration::zero(),
            long_trips: 0,
            long_trip_threshold: threshold,
            vehicles: BTreeSet::new(),
            users: BTreeSet::new(),
        }
    }

    /// Adds one trip. Untagged trips count as customer trips.
    pub fn record(&mut self, trip: &Trip) {
        self.trips += 1;
        self.vehicles.insert(trip.vehicle_id.clone());
        if let Some(user) = &trip.user_id {
            self.users.insert(user.clone());
        }

        match trip.kind.unwrap_or(TripKind::Customer) {
            TripKind::Relocation => self.relocation += 1,
            TripKind::Recharge => self.recharge += 1,
            TripKind::Customer => {
                self.customer += 1;
                self.total_cost += trip.cost;
                self.total_energy += trip.energy_used();
                self.total_distance_km += trip.distance_km;
                self.max_distance_km = self.max_distance_km.max(trip.distance_km);
                self.max_duration = self.max_duration.max(trip.duration);
                if trip.duration >= self.long_trip_threshold {
                    self.long_trips += 1;
                }
            }
        }
    }

    /// Returns `total / count`, or 0.0 when `count` is zero.
    pub fn avg(total: f64, count: usize) -> f64 {
        if count == 0 {
            0.0
        } else {
            total / count as f64
        }
    }

    pub fn avg_cost(&self) -> f64 {
        Self::avg(self.total_cost as f64, self.customer)
    }

    pub fn avg_energy(&self) -> f64 {
        Self::avg(self.total_energy, self.customer)
    }

    pub fn avg_distance_km(&self) -> f64 {
        Self::avg(self.total_distance_km, self.customer)
    }

    pub fn unique_vehicles(&self) -> usize {
        self.vehicles.len()
    }

    pub fn unique_users(&self) -> usize {
        self.users.len()
    }

    pub fn summary(&self) -> StatsSummary {
        StatsSummary {
            trips: self.trips,
            customer: self.customer,
            relocation: self.relocation,
            recharge: self.recharge,
            total_cost: self.total_cost,
            avg_cost: self.avg_cost(),
            avg_energy: self.avg_energy(),
            avg_distance_km: self.avg_distance_km(),
            max_distance_km: self.max_distance_km,
            max_duration_mins: self.max_duration.num_minutes(),
            long_trips: self.long_trips,
            unique_vehicles: self.unique_vehicles(),
            unique_users: self.unique_users(),
        }
    }

    pub fn log_summary(&self) {
        let s = self.summary();
        info!(
            trips = s.trips,
            customer = s.customer,
            relocation = s.relocation,
            recharge = s.recharge,
            total_cost = s.total_cost,
            avg_cost = s.avg_cost,
            avg_energy = s.avg_energy,
            avg_distance_km = s.avg_distance_km,
            max_distance_km = s.max_distance_km,
            max_duration_mins = s.max_duration_mins,
            long_trips = s.long_trips,
            unique_vehicles = s.unique_vehicles,
            unique_users = s.unique_users,
            "Trip statistics"
        );
    }
}

/// Trip sink feeding a shared [`TripStats`].
pub struct StatsSink {
    stats: Arc<Mutex<TripStats>>,
}

impl StatsSink {
    pub fn new(stats: TripStats) -> Self {
        Self {
            stats: Arc::new(Mutex::new(stats)),
        }
    }

    /// Handle for reading the totals while or after the pipeline runs.
    pub fn handle(&self) -> Arc<Mutex<TripStats>> {
        Arc::clone(&self.stats)
    }
}

#[async_trait]
impl TripSink for StatsSink {
    fn name(&self) -> &str {
        "stats"
    }

    async fn accept(&mut self, trip: &Trip) -> Result<()> {
        self.stats
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .record(trip);
        Ok(())
    }
}
