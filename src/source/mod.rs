//! Producers of the snapshot stream.
//!
//! A [`SnapshotSource`] pushes [`Snapshot`]s oldest first into a channel
//! until it runs dry, fails, or is cancelled. Closing the channel (dropping
//! the sender) is how it signals end of stream.

mod live;
mod replay;

pub use live::{LiveSource, LiveSourceConfig};
pub use replay::{ReplayConfig, ReplaySource};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::archive::ArchiveError;
use crate::fleet::Snapshot;
use crate::services::fleet_api::ApiError;
use crate::shutdown::Shutdown;

/// Fatal source failures. Per-record problems are logged and skipped
/// instead.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("fetch failed after {attempts} attempts")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: ApiError,
    },
    #[error("re-authentication failed after {attempts} attempts")]
    AuthenticationFailed {
        attempts: u32,
        #[source]
        last: ApiError,
    },
    #[error("archive unreadable")]
    Archive(#[from] ArchiveError),
    #[error("cannot watch archive for new records")]
    Watch(#[from] notify::Error),
}

#[async_trait]
pub trait SnapshotSource: Send {
    /// Short label used in logs and error reports.
    fn name(&self) -> &str;

    /// Streams snapshots into `tx`. Returns `Ok` on a clean end: the source
    /// ran dry, `shutdown` fired, or the receiver went away.
    async fn run(
        self: Box<Self>,
        tx: mpsc::Sender<Snapshot>,
        shutdown: Shutdown,
    ) -> Result<(), SourceError>;
}

/// Replays snapshots held in memory.
pub struct MemorySource {
    snapshots: Vec<Snapshot>,
}

impl MemorySource {
    pub fn new(snapshots: impl IntoIterator<Item = Snapshot>) -> Self {
        Self {
            snapshots: snapshots.into_iter().collect(),
        }
    }
}

#[async_trait]
impl SnapshotSource for MemorySource {
    fn name(&self) -> &str {
        "memory"
    }

    async fn run(
        self: Box<Self>,
        tx: mpsc::Sender<Snapshot>,
        mut shutdown: Shutdown,
    ) -> Result<(), SourceError> {
        for snapshot in self.snapshots {
            tokio::select! {
                biased;
                _ = shutdown.triggered() => break,
                sent = tx.send(snapshot) => {
                    if sent.is_err() {
                        break;
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[tokio::test]
    async fn test_memory_source_delivers_in_order() {
        let snapshots: Vec<_> = (0..3)
            .map(|m| Snapshot::new(Utc.with_ymd_and_hms(2019, 10, 8, 5, m, 0).unwrap(), "test", Vec::new()))
            .collect();
        let (tx, mut rx) = mpsc::channel(8);

        Box::new(MemorySource::new(snapshots.clone()))
            .run(tx, Shutdown::never())
            .await
            .unwrap();

        let mut received = Vec::new();
        while let Some(s) = rx.recv().await {
            received.push(s.taken_at);
        }
        let expected: Vec<_> = snapshots.iter().map(|s| s.taken_at).collect();
        assert_eq!(received, expected);
    }

    #[tokio::test]
    async fn test_memory_source_stops_on_shutdown() {
        let (handle, shutdown) = crate::shutdown::channel();
        handle.trigger();
        let (tx, mut rx) = mpsc::channel(8);

        let snapshot = Snapshot::new(Utc.with_ymd_and_hms(2019, 10, 8, 5, 0, 0).unwrap(), "test", Vec::new());
        Box::new(MemorySource::new([snapshot]))
            .run(tx, shutdown)
            .await
            .unwrap();

        assert!(rx.recv().await.is_none());
    }
}
