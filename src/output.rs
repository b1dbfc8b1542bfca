//! Output formatting and persistence for finalized trips.
//!
//! Supports JSON logging and CSV append.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use csv::WriterBuilder;
use serde::Serialize;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::sink::TripSink;
use crate::trip::Trip;

/// One CSV row per trip.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TripRecord {
    pub id: String,
    pub provider: String,
    pub vehicle_id: String,
    pub kind: String,
    pub user_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_secs: i64,
    pub start_lat: f64,
    pub start_lon: f64,
    pub end_lat: f64,
    pub end_lon: f64,
    pub start_charge: f64,
    pub end_charge: f64,
    pub distance_km: f64,
    pub cost: u64,
}

impl From<&Trip> for TripRecord {
    fn from(trip: &Trip) -> Self {
        Self {
            id: trip.id.clone(),
            provider: trip.provider.clone(),
            vehicle_id: trip.vehicle_id.clone(),
            kind: trip.kind.map(|k| k.to_string()).unwrap_or_default(),
            user_id: trip.user_id.clone().unwrap_or_default(),
            started_at: trip.started_at,
            ended_at: trip.ended_at,
            duration_secs: trip.duration.num_seconds(),
            start_lat: trip.start_location.latitude,
            start_lon: trip.start_location.longitude,
            end_lat: trip.end_location.latitude,
            end_lon: trip.end_location.longitude,
            start_charge: trip.start_charge,
            end_charge: trip.end_charge,
            distance_km: trip.distance_km,
            cost: trip.cost,
        }
    }
}

/// Logs a value as pretty-printed JSON.
pub fn print_json<T: Serialize>(value: &T) -> Result<()> {
    info!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Appends `record` as a row to a CSV file.
///
/// Creates the file with headers if it does not already exist.
pub fn append_record<T: Serialize>(path: &Path, record: &T) -> Result<()> {
    let file_exists = path.exists();
    debug!(path = %path.display(), file_exists, "Appending CSV record");

    let file = OpenOptions::new().append(true).create(true).open(path)?;

    let mut writer = WriterBuilder::new()
        .has_headers(!file_exists) // IMPORTANT when appending
        .from_writer(file);

    writer.serialize(record)?;
    writer.flush()?;

    Ok(())
}

/// Appends every trip to a CSV file.
pub struct CsvTripSink {
    path: PathBuf,
}

impl CsvTripSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl TripSink for CsvTripSink {
    fn name(&self) -> &str {
        "csv"
    }

    async fn accept(&mut self, trip: &Trip) -> Result<()> {
        let path = self.path.clone();
        let record = TripRecord::from(trip);
        tokio::task::spawn_blocking(move || append_record(&path, &record)).await?
    }
}

/// Logs every trip as it is finalized.
pub struct LogTripSink;

#[async_trait]
impl TripSink for LogTripSink {
    fn name(&self) -> &str {
        "log"
    }

    async fn accept(&mut self, trip: &Trip) -> Result<()> {
        info!(
            trip_id = %trip.id,
            vehicle_id = %trip.vehicle_id,
            kind = %trip.kind.map(|k| k.to_string()).unwrap_or_default(),
            user = trip.user_id.as_deref().unwrap_or(""),
            duration_mins = trip.duration.num_minutes(),
            distance_km = trip.distance_km,
            cost = trip.cost,
            "Trip"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fleet::GeoLocation;
    use crate::trip::TripKind;
    use chrono::{Duration, TimeZone};
    use std::env;
    use std::fs;

    fn temp_path(name: &str) -> PathBuf {
        env::temp_dir().join(name)
    }

    fn sample_trip() -> Trip {
        let started_at = Utc.with_ymd_and_hms(2019, 10, 8, 5, 0, 0).unwrap();
        Trip {
            id: "a-1570510800".to_string(),
            vehicle_id: "a".to_string(),
            provider: "circ".to_string(),
            start_location: GeoLocation::new(51.5, 7.25),
            end_location: GeoLocation::new(51.25, 7.5),
            start_charge: 80.0,
            end_charge: 60.0,
            started_at,
            ended_at: started_at + Duration::minutes(12),
            duration: Duration::minutes(12),
            distance_km: 32.5,
            cost: 340,
            user_id: Some("u1".to_string()),
            kind: Some(TripKind::Customer),
        }
    }

    #[test]
    fn test_trip_record_flattens_trip() {
        let record = TripRecord::from(&sample_trip());
        assert_eq!(record.kind, "customer");
        assert_eq!(record.user_id, "u1");
        assert_eq!(record.duration_secs, 720);
        assert_eq!(record.end_lat, 51.25);
    }

    #[test]
    fn test_print_json_does_not_panic() {
        print_json(&TripRecord::from(&sample_trip())).unwrap();
    }

    #[test]
    fn test_append_record_creates_file() {
        let path = temp_path("fleet_trips_test_create.csv");
        let _ = fs::remove_file(&path); // clean up any prior run

        append_record(&path, &TripRecord::from(&sample_trip())).unwrap();

        assert!(path.exists());
        let content = fs::read_to_string(&path).unwrap();
        assert!(content.contains("2019-10-08T05:00:00Z"));

        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_append_record_writes_header_once() {
        let path = temp_path("fleet_trips_test_header.csv");
        let _ = fs::remove_file(&path);

        let record = TripRecord::from(&sample_trip());
        append_record(&path, &record).unwrap();
        append_record(&path, &record).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        // Header line should appear exactly once
        let header_count = content.lines().filter(|l| l.contains("vehicle_id")).count();
        assert_eq!(header_count, 1);

        fs::remove_file(&path).unwrap();
    }

    #[tokio::test]
    async fn test_csv_sink_appends_rows() {
        let path = temp_path("fleet_trips_test_sink.csv");
        let _ = fs::remove_file(&path);

        let mut sink = CsvTripSink::new(&path);
        sink.accept(&sample_trip()).await.unwrap();
        sink.accept(&sample_trip()).await.unwrap();

        let content = fs::read_to_string(&path).unwrap();
        // 1 header + 2 data rows
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[1].starts_with("a-1570510800,circ,a,customer,u1,"));

        fs::remove_file(&path).unwrap();
    }
}
