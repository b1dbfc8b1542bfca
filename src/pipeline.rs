//! Wires a snapshot source through the tracker and classifier to the sinks.
//!
//! ```text
//! source ─▶ fan-out ─┬─▶ tracker ─▶ classifier ─▶ trip fan-out ─┬─▶ trip sink
//!                    └─▶ snapshot sink                          └─▶ trip sink
//! ```
//!
//! Every arrow is a bounded channel and every box its own task. A full
//! channel blocks the sender, so nothing is dropped; the slowest consumer
//! sets the pace. Cancelling stops the source only. The remaining stages
//! drain what is already in flight and end when their input closes.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::classify::{Classifier, ClassifierConfig};
use crate::fleet::Snapshot;
use crate::shutdown::{self, Shutdown, ShutdownHandle};
use crate::sink::{SnapshotSink, TripSink};
use crate::source::{SnapshotSource, SourceError};
use crate::tracker::{TrackerError, TripTracker};
use crate::trip::{OpenTrip, Trip};

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Capacity of every channel between stages.
    pub buffer: usize,
    pub classifier: ClassifierConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            buffer: 100,
            classifier: ClassifierConfig::default(),
        }
    }
}

/// Outcome of a run that ended without a fatal error.
#[derive(Debug)]
pub struct PipelineReport {
    pub snapshots: usize,
    pub trips: usize,
    /// Capture time of the last snapshot the tracker processed.
    pub last_snapshot: Option<DateTime<Utc>>,
    /// Trips whose vehicle never came back.
    pub open_trips: Vec<OpenTrip>,
    /// Sinks that failed and were detached during the run.
    pub failed_sinks: Vec<String>,
}

fn last_seen(at: &Option<DateTime<Utc>>) -> String {
    at.map_or_else(|| "none".to_string(), |t| t.to_rfc3339())
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("source '{stage}' failed (last processed snapshot: {})", last_seen(.last_snapshot))]
    Source {
        stage: String,
        last_snapshot: Option<DateTime<Utc>>,
        #[source]
        source: SourceError,
    },
    #[error("tracker failed (last processed snapshot: {})", last_seen(.last_snapshot))]
    Tracker {
        last_snapshot: Option<DateTime<Utc>>,
        #[source]
        source: TrackerError,
    },
    #[error("stage '{stage}' panicked")]
    Panicked { stage: String },
}

impl PipelineError {
    /// Name of the stage that failed.
    pub fn stage(&self) -> &str {
        match self {
            PipelineError::Source { stage, .. } | PipelineError::Panicked { stage } => stage,
            PipelineError::Tracker { .. } => "tracker",
        }
    }

    pub fn last_snapshot(&self) -> Option<DateTime<Utc>> {
        match self {
            PipelineError::Source { last_snapshot, .. }
            | PipelineError::Tracker { last_snapshot, .. } => *last_snapshot,
            PipelineError::Panicked { .. } => None,
        }
    }
}

/// Output side of one consumer.
struct Branch<T> {
    name: String,
    tx: mpsc::Sender<T>,
    /// The run cannot continue without this consumer.
    required: bool,
}

/// Hands `item` to every branch, waiting for room in each. Branches whose
/// consumer is gone are detached. Returns `false` once a required branch
/// is gone.
async fn broadcast<T: Clone>(branches: &mut Vec<Branch<T>>, item: T) -> bool {
    let mut i = 0;
    while i < branches.len() {
        if branches[i].tx.send(item.clone()).await.is_ok() {
            i += 1;
            continue;
        }
        let branch = branches.remove(i);
        if branch.required {
            return false;
        }
        warn!(branch = %branch.name, "Consumer gone, detaching");
    }
    true
}

async fn join<T>(stage: &str, handle: JoinHandle<T>) -> Result<T, PipelineError> {
    handle.await.map_err(|e| {
        error!(stage, error = %e, "Pipeline stage panicked");
        PipelineError::Panicked {
            stage: stage.to_string(),
        }
    })
}

/// Consumes `rx` until it closes or the sink fails. Returns the sink name
/// when it failed.
fn spawn_snapshot_sink(
    mut sink: Box<dyn SnapshotSink>,
    mut rx: mpsc::Receiver<Arc<Snapshot>>,
) -> JoinHandle<Option<String>> {
    tokio::spawn(async move {
        while let Some(snapshot) = rx.recv().await {
            if let Err(e) = sink.accept(&snapshot).await {
                error!(sink = sink.name(), error = %e, taken_at = %snapshot.taken_at, "Snapshot sink failed");
                return Some(sink.name().to_string());
            }
        }
        if let Err(e) = sink.finish().await {
            error!(sink = sink.name(), error = %e, "Snapshot sink failed to finish");
            return Some(sink.name().to_string());
        }
        None
    })
}

fn spawn_trip_sink(
    mut sink: Box<dyn TripSink>,
    mut rx: mpsc::Receiver<Arc<Trip>>,
) -> JoinHandle<Option<String>> {
    tokio::spawn(async move {
        while let Some(trip) = rx.recv().await {
            if let Err(e) = sink.accept(&trip).await {
                error!(sink = sink.name(), error = %e, trip_id = %trip.id, "Trip sink failed");
                return Some(sink.name().to_string());
            }
        }
        if let Err(e) = sink.finish().await {
            error!(sink = sink.name(), error = %e, "Trip sink failed to finish");
            return Some(sink.name().to_string());
        }
        None
    })
}

/// One snapshot-to-trips run over a single fleet namespace.
pub struct Pipeline {
    config: PipelineConfig,
    snapshot_sinks: Vec<Box<dyn SnapshotSink>>,
    trip_sinks: Vec<Box<dyn TripSink>>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            snapshot_sinks: Vec::new(),
            trip_sinks: Vec::new(),
        }
    }

    pub fn with_snapshot_sink(mut self, sink: impl SnapshotSink + 'static) -> Self {
        self.snapshot_sinks.push(Box::new(sink));
        self
    }

    pub fn with_trip_sink(mut self, sink: impl TripSink + 'static) -> Self {
        self.trip_sinks.push(Box::new(sink));
        self
    }

    /// Runs until `source` ends, fails, or `shutdown` fires, then waits for
    /// every stage to drain.
    #[tracing::instrument(skip_all, fields(source = source.name()))]
    pub async fn run(
        self,
        source: Box<dyn SnapshotSource>,
        shutdown: Shutdown,
    ) -> Result<PipelineReport, PipelineError> {
        let buffer = self.config.buffer.max(1);
        let source_name = source.name().to_string();

        // The source listens to an internal signal so the tracker can stop
        // it as well.
        let (stop, stop_rx) = shutdown::channel();
        let stop = Arc::new(stop);
        let forward = tokio::spawn({
            let stop = Arc::clone(&stop);
            let mut shutdown = shutdown;
            async move {
                shutdown.triggered().await;
                info!("Shutdown requested");
                stop.trigger();
            }
        });

        let (snapshot_tx, mut snapshot_rx) = mpsc::channel::<Snapshot>(buffer);
        let source_task = tokio::spawn(source.run(snapshot_tx, stop_rx));

        // Snapshot fan-out: the tracker first, then every snapshot sink.
        let (tracker_tx, tracker_rx) = mpsc::channel::<Arc<Snapshot>>(buffer);
        let mut snapshot_branches = vec![Branch {
            name: "tracker".to_string(),
            tx: tracker_tx,
            required: true,
        }];
        let mut sink_tasks = Vec::new();
        for sink in self.snapshot_sinks {
            let name = sink.name().to_string();
            let (tx, rx) = mpsc::channel(buffer);
            snapshot_branches.push(Branch {
                name: name.clone(),
                tx,
                required: false,
            });
            sink_tasks.push((name, spawn_snapshot_sink(sink, rx)));
        }

        let fan_out = tokio::spawn(async move {
            let mut count = 0usize;
            while let Some(snapshot) = snapshot_rx.recv().await {
                count += 1;
                if !broadcast(&mut snapshot_branches, Arc::new(snapshot)).await {
                    debug!("Tracker gone, snapshot fan-out stopping");
                    break;
                }
            }
            count
        });

        let (trip_tx, mut trip_rx) = mpsc::channel::<Trip>(buffer);
        let tracker_task = tokio::spawn(track(tracker_rx, trip_tx, Arc::clone(&stop)));

        let mut trip_branches = Vec::new();
        for sink in self.trip_sinks {
            let name = sink.name().to_string();
            let (tx, rx) = mpsc::channel(buffer);
            trip_branches.push(Branch {
                name: name.clone(),
                tx,
                required: false,
            });
            sink_tasks.push((name, spawn_trip_sink(sink, rx)));
        }

        let classifier = Classifier::new(self.config.classifier);
        let classify_task = tokio::spawn(async move {
            let mut count = 0usize;
            while let Some(trip) = trip_rx.recv().await {
                if trip.duration <= chrono::Duration::zero() {
                    warn!(
                        trip_id = %trip.id,
                        duration_secs = trip.duration.num_seconds(),
                        "Trip with non-positive duration"
                    );
                }
                let trip = classifier.tag(trip);
                count += 1;
                broadcast(&mut trip_branches, Arc::new(trip)).await;
            }
            count
        });

        // Every stage is awaited before any failure is reported, so no task
        // outlives the run.
        let source_result = join(&source_name, source_task).await;
        let snapshots = join("fan-out", fan_out).await;
        let tracker_result = join("tracker", tracker_task).await;
        let trips = join("classifier", classify_task).await;

        let mut failed_sinks = Vec::new();
        let mut sink_panic = None;
        for (name, task) in sink_tasks {
            match join(&name, task).await {
                Ok(Some(failed)) => failed_sinks.push(failed),
                Ok(None) => {}
                Err(e) => {
                    sink_panic.get_or_insert(e);
                }
            }
        }
        forward.abort();

        let snapshots = snapshots?;
        let tracker_result = tracker_result?;
        let trips = trips?;
        if let Some(e) = sink_panic {
            return Err(e);
        }

        let tracker = match tracker_result {
            Ok(tracker) => tracker,
            Err((last_snapshot, source)) => {
                error!(error = %source, "Tracker stopped the pipeline");
                return Err(PipelineError::Tracker {
                    last_snapshot,
                    source,
                });
            }
        };

        if let Err(source) = source_result? {
            error!(stage = %source_name, error = %source, "Source failed");
            return Err(PipelineError::Source {
                stage: source_name,
                last_snapshot: tracker.last_taken_at(),
                source,
            });
        }

        let report = PipelineReport {
            snapshots,
            trips,
            last_snapshot: tracker.last_taken_at(),
            open_trips: tracker.into_open_trips(),
            failed_sinks,
        };
        info!(
            snapshots = report.snapshots,
            trips = report.trips,
            open_trips = report.open_trips.len(),
            "Pipeline finished"
        );
        Ok(report)
    }
}

/// Tracker stage. On an invariant violation it stops the source and
/// returns the error with the last good snapshot time.
async fn track(
    mut rx: mpsc::Receiver<Arc<Snapshot>>,
    tx: mpsc::Sender<Trip>,
    stop: Arc<ShutdownHandle>,
) -> Result<TripTracker, (Option<DateTime<Utc>>, TrackerError)> {
    let mut tracker = TripTracker::new();

    while let Some(snapshot) = rx.recv().await {
        let trips = match tracker.advance(&snapshot) {
            Ok(trips) => trips,
            Err(e) => {
                stop.trigger();
                return Err((tracker.last_taken_at(), e));
            }
        };
        debug!(
            taken_at = %snapshot.taken_at,
            vehicles = snapshot.len(),
            closed = trips.len(),
            open = tracker.open_count(),
            "Snapshot processed"
        );
        for trip in trips {
            if tx.send(trip).await.is_err() {
                warn!("Classifier gone, dropping finalized trips");
                break;
            }
        }
    }

    Ok(tracker)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fleet::tests::vehicle;
    use crate::services::fleet_api::ApiError;
    use crate::source::MemorySource;
    use crate::trip::TripKind;
    use anyhow::{Result, bail};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::sync::Mutex;

    fn at(min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2019, 10, 8, 5, min, 0).unwrap()
    }

    /// S1: both present. S2: "a" gone. S3: "a" back 5 km north with less charge.
    fn ride() -> Vec<Snapshot> {
        let b = vehicle("b", 50.0, 51.0, 7.0);
        let mut back = vehicle("a", 60.0, 51.045, 7.0);
        back.state_updated_by = Some("u1".to_string());
        vec![
            Snapshot::new(at(0), "test", vec![vehicle("a", 80.0, 51.0, 7.0), b.clone()]),
            Snapshot::new(at(1), "test", vec![b.clone()]),
            Snapshot::new(at(11), "test", vec![back, b]),
        ]
    }

    #[derive(Clone, Default)]
    struct Recorder {
        snapshots: Arc<Mutex<Vec<DateTime<Utc>>>>,
        trips: Arc<Mutex<Vec<Trip>>>,
        finished: Arc<Mutex<bool>>,
    }

    #[async_trait]
    impl SnapshotSink for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        async fn accept(&mut self, snapshot: &Snapshot) -> Result<()> {
            self.snapshots.lock().unwrap().push(snapshot.taken_at);
            Ok(())
        }
    }

    #[async_trait]
    impl TripSink for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        async fn accept(&mut self, trip: &Trip) -> Result<()> {
            self.trips.lock().unwrap().push(trip.clone());
            Ok(())
        }

        async fn finish(&mut self) -> Result<()> {
            *self.finished.lock().unwrap() = true;
            Ok(())
        }
    }

    struct Broken;

    #[async_trait]
    impl SnapshotSink for Broken {
        fn name(&self) -> &str {
            "broken"
        }

        async fn accept(&mut self, _snapshot: &Snapshot) -> Result<()> {
            bail!("disk full")
        }
    }

    struct Panicking;

    #[async_trait]
    impl TripSink for Panicking {
        fn name(&self) -> &str {
            "panicking"
        }

        async fn accept(&mut self, _trip: &Trip) -> Result<()> {
            panic!("sink bug")
        }
    }

    /// Sends its snapshots, then fails like an exhausted live source.
    struct Failing(Vec<Snapshot>);

    #[async_trait]
    impl SnapshotSource for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        async fn run(
            self: Box<Self>,
            tx: mpsc::Sender<Snapshot>,
            _shutdown: Shutdown,
        ) -> Result<(), SourceError> {
            for snapshot in self.0 {
                let _ = tx.send(snapshot).await;
            }
            Err(SourceError::RetriesExhausted {
                attempts: 5,
                last: ApiError::Server {
                    status: 503,
                    message: "unavailable".to_string(),
                },
            })
        }
    }

    #[tokio::test]
    async fn test_ride_reaches_trip_sink_classified() {
        let recorder = Recorder::default();
        let report = Pipeline::new(PipelineConfig::default())
            .with_snapshot_sink(recorder.clone())
            .with_trip_sink(recorder.clone())
            .run(Box::new(MemorySource::new(ride())), Shutdown::never())
            .await
            .unwrap();

        assert_eq!(report.snapshots, 3);
        assert_eq!(report.trips, 1);
        assert_eq!(report.last_snapshot, Some(at(11)));
        assert!(report.open_trips.is_empty());
        assert!(report.failed_sinks.is_empty());

        assert_eq!(*recorder.snapshots.lock().unwrap(), vec![at(0), at(1), at(11)]);
        assert!(*recorder.finished.lock().unwrap());

        let trips = recorder.trips.lock().unwrap();
        assert_eq!(trips.len(), 1);
        let trip = &trips[0];
        assert_eq!(trip.vehicle_id, "a");
        assert_eq!(trip.started_at, at(1));
        assert_eq!(trip.ended_at, at(11));
        assert_eq!(trip.user_id.as_deref(), Some("u1"));
        assert_eq!(trip.kind, Some(TripKind::Customer));
        assert_eq!(trip.cost, 100 + 20 * 10);
    }

    #[tokio::test]
    async fn test_out_of_order_stops_with_tracker_error() {
        let snapshots = vec![
            Snapshot::new(at(5), "test", vec![vehicle("a", 80.0, 51.0, 7.0)]),
            Snapshot::new(at(1), "test", vec![vehicle("a", 80.0, 51.0, 7.0)]),
            Snapshot::new(at(6), "test", vec![vehicle("a", 80.0, 51.0, 7.0)]),
        ];

        let err = Pipeline::new(PipelineConfig::default())
            .run(Box::new(MemorySource::new(snapshots)), Shutdown::never())
            .await
            .unwrap_err();

        assert_eq!(err.stage(), "tracker");
        assert_eq!(err.last_snapshot(), Some(at(5)));
        assert!(matches!(
            err,
            PipelineError::Tracker {
                source: TrackerError::OutOfOrder { .. },
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_source_failure_names_stage_and_last_snapshot() {
        let err = Pipeline::new(PipelineConfig::default())
            .run(Box::new(Failing(ride())), Shutdown::never())
            .await
            .unwrap_err();

        assert_eq!(err.stage(), "failing");
        assert_eq!(err.last_snapshot(), Some(at(11)));
        assert!(err.to_string().contains("2019-10-08T05:11:00"));
    }

    #[tokio::test]
    async fn test_failing_sink_is_detached() {
        let recorder = Recorder::default();
        let report = Pipeline::new(PipelineConfig {
            buffer: 1,
            ..PipelineConfig::default()
        })
        .with_snapshot_sink(Broken)
        .with_trip_sink(recorder.clone())
        .run(Box::new(MemorySource::new(ride())), Shutdown::never())
        .await
        .unwrap();

        assert_eq!(report.snapshots, 3);
        assert_eq!(report.failed_sinks, vec!["broken".to_string()]);
        assert_eq!(recorder.trips.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_panicking_sink_is_named_after_every_stage_drained() {
        let recorder = Recorder::default();
        let err = Pipeline::new(PipelineConfig {
            buffer: 1,
            ..PipelineConfig::default()
        })
        .with_snapshot_sink(recorder.clone())
        .with_trip_sink(Panicking)
        .with_trip_sink(recorder.clone())
        .run(Box::new(MemorySource::new(ride())), Shutdown::never())
        .await
        .unwrap_err();

        assert!(matches!(&err, PipelineError::Panicked { stage } if stage == "panicking"));
        assert_eq!(err.stage(), "panicking");

        // The other sinks ran to completion before the error came back.
        assert_eq!(*recorder.snapshots.lock().unwrap(), vec![at(0), at(1), at(11)]);
        assert_eq!(recorder.trips.lock().unwrap().len(), 1);
        assert!(*recorder.finished.lock().unwrap());
    }

    #[tokio::test]
    async fn test_unreturned_vehicle_stays_open() {
        let snapshots = ride().into_iter().take(2).collect::<Vec<_>>();
        let report = Pipeline::new(PipelineConfig::default())
            .run(Box::new(MemorySource::new(snapshots)), Shutdown::never())
            .await
            .unwrap();

        assert_eq!(report.trips, 0);
        assert_eq!(report.open_trips.len(), 1);
        assert_eq!(report.open_trips[0].vehicle_id, "a");
        assert_eq!(report.open_trips[0].start_charge, 80.0);
        assert_eq!(report.open_trips[0].started_at, at(1));
    }
}
