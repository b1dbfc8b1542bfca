//! Trip lifecycle tracking across a stream of snapshots.
//!
//! A vehicle that vanishes from the fleet opens a trip; the trip is finalized
//! when the same identifier shows up again. The trip start is recorded at the
//! first snapshot in which the vehicle is missing, which is the earliest
//! instant at which polling can confirm the vehicle left.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, error};

use crate::diff::diff;
use crate::fleet::{Fleet, Snapshot};
use crate::trip::{OpenTrip, Trip};

/// Internal consistency failures. These point to a defect upstream and are
/// never corrected silently.
#[derive(Debug, Error, PartialEq)]
pub enum TrackerError {
    #[error("vehicle {vehicle_id} vanished again while its trip from {started_at} is still open")]
    DuplicateOpenTrip {
        vehicle_id: String,
        started_at: DateTime<Utc>,
    },
    #[error("snapshot taken at {taken_at} is older than the previous one taken at {previous}")]
    OutOfOrder {
        taken_at: DateTime<Utc>,
        previous: DateTime<Utc>,
    },
}

/// Owns the in-flight trips of one fleet namespace.
#[derive(Debug, Default)]
pub struct TripTracker {
    open_trips: BTreeMap<String, OpenTrip>,
    last_snapshot: Fleet,
    last_taken_at: Option<DateTime<Utc>>,
}

impl TripTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds the next snapshot and returns the trips it finalized, ordered by
    /// vehicle identifier.
    ///
    /// # Errors
    ///
    /// Fails without touching any state when the snapshot is older than the
    /// previous one or when a vanished vehicle already has an open trip.
    pub fn advance(&mut self, snapshot: &Snapshot) -> Result<Vec<Trip>, TrackerError> {
        if let Some(previous) = self.last_taken_at {
            if snapshot.taken_at < previous {
                return Err(TrackerError::OutOfOrder {
                    taken_at: snapshot.taken_at,
                    previous,
                });
            }
        }

        let d = diff(&self.last_snapshot, &snapshot.vehicles, |id| {
            self.open_trips.contains_key(id)
        });

        if let Some(open) = d.vanished.iter().find_map(|id| self.open_trips.get(id)) {
            error!(
                vehicle_id = %open.vehicle_id,
                started_at = %open.started_at,
                "Vanished vehicle already has an open trip"
            );
            return Err(TrackerError::DuplicateOpenTrip {
                vehicle_id: open.vehicle_id.clone(),
                started_at: open.started_at,
            });
        }

        for id in &d.vanished {
            if let Some(last_seen) = self.last_snapshot.get(id) {
                debug!(vehicle_id = %id, at = %snapshot.taken_at, "Trip opened");
                self.open_trips
                    .insert(id.clone(), OpenTrip::from_last_seen(last_seen, snapshot.taken_at));
            }
        }

        let mut finished = Vec::with_capacity(d.reappeared.len());
        for id in &d.reappeared {
            let (Some(open), Some(seen)) = (self.open_trips.remove(id), snapshot.get(id)) else {
                continue;
            };
            let trip = open.finalize(seen, snapshot.taken_at);
            debug!(
                vehicle_id = %id,
                duration_secs = trip.duration.num_seconds(),
                distance_km = trip.distance_km,
                "Trip closed"
            );
            finished.push(trip);
        }

        self.last_snapshot = snapshot.vehicles.clone();
        self.last_taken_at = Some(snapshot.taken_at);

        Ok(finished)
    }

    /// Trips still waiting for their vehicle to reappear.
    pub fn open_trips(&self) -> impl Iterator<Item = &OpenTrip> {
        self.open_trips.values()
    }

    pub fn open_count(&self) -> usize {
        self.open_trips.len()
    }

    /// Timestamp of the last snapshot that was processed successfully.
    pub fn last_taken_at(&self) -> Option<DateTime<Utc>> {
        self.last_taken_at
    }

    pub fn into_open_trips(self) -> Vec<OpenTrip> {
        self.open_trips.into_values().collect()
    }
}
