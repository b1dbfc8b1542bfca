//! Consumers at the ends of the pipeline.

use anyhow::Result;
use async_trait::async_trait;

use crate::fleet::Snapshot;
use crate::trip::Trip;

/// Receives every raw snapshot, e.g. for archiving.
#[async_trait]
pub trait SnapshotSink: Send {
    fn name(&self) -> &str;

    async fn accept(&mut self, snapshot: &Snapshot) -> Result<()>;

    /// Called once after the last snapshot.
    async fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Receives every finalized and classified trip.
#[async_trait]
pub trait TripSink: Send {
    fn name(&self) -> &str;

    async fn accept(&mut self, trip: &Trip) -> Result<()>;

    /// Called once after the last trip.
    async fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}
