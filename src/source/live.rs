use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{SnapshotSource, SourceError};
use crate::fleet::{Snapshot, Vehicle};
use crate::services::fleet_api::{CodePrompt, FleetApi};
use crate::shutdown::Shutdown;

#[derive(Debug, Clone)]
pub struct LiveSourceConfig {
    /// Pause between the end of one fetch and the start of the next.
    pub interval: Duration,
    pub max_fetch_attempts: u32,
    pub retry_backoff: Duration,
    /// Logins tried within one fetch cycle before giving up.
    pub max_auth_attempts: u32,
    /// Keep only vehicles of this zone.
    pub zone: Option<String>,
}

impl Default for LiveSourceConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            max_fetch_attempts: 5,
            retry_backoff: Duration::from_secs(5),
            max_auth_attempts: 5,
            zone: None,
        }
    }
}

/// Polls a [`FleetApi`] and emits one snapshot per successful fetch.
pub struct LiveSource<A> {
    api: A,
    prompt: Arc<dyn CodePrompt>,
    config: LiveSourceConfig,
    last_taken_at: Option<DateTime<Utc>>,
}

impl<A: FleetApi> LiveSource<A> {
    pub fn new(api: A, prompt: Arc<dyn CodePrompt>, config: LiveSourceConfig) -> Self {
        Self {
            api,
            prompt,
            config,
            last_taken_at: None,
        }
    }

    /// One fetch cycle: retries transient failures and logs in again when
    /// the provider asks for it. An attempt that has started always runs to
    /// completion; cancellation is only honored while backing off, where
    /// `None` is returned.
    async fn fetch(&self, shutdown: &mut Shutdown) -> Result<Option<Vec<Vehicle>>, SourceError> {
        let mut failures = 0;
        let mut auth_attempts = 0;

        loop {
            let err = match self.api.fetch_fleet().await {
                Ok(vehicles) => return Ok(Some(vehicles)),
                Err(e) => e,
            };

            if err.is_auth_required() {
                if auth_attempts >= self.config.max_auth_attempts {
                    return Err(SourceError::AuthenticationFailed {
                        attempts: auth_attempts,
                        last: err,
                    });
                }
                auth_attempts += 1;
                warn!(error = %err, attempt = auth_attempts, "Provider requires login");

                if let Err(auth_err) = self.api.reauthenticate(self.prompt.as_ref()).await {
                    warn!(error = %auth_err, attempt = auth_attempts, "Login failed");
                    if auth_attempts >= self.config.max_auth_attempts {
                        return Err(SourceError::AuthenticationFailed {
                            attempts: auth_attempts,
                            last: auth_err,
                        });
                    }
                    if !self.back_off(shutdown).await {
                        return Ok(None);
                    }
                }
                continue;
            }

            failures += 1;
            if failures >= self.config.max_fetch_attempts {
                return Err(SourceError::RetriesExhausted {
                    attempts: failures,
                    last: err,
                });
            }
            warn!(
                error = %err,
                attempt = failures,
                backoff_secs = self.config.retry_backoff.as_secs_f64(),
                "Fetch failed, retrying"
            );
            if !self.back_off(shutdown).await {
                return Ok(None);
            }
        }
    }

    /// Waits out the retry backoff. Returns `false` when cancelled.
    async fn back_off(&self, shutdown: &mut Shutdown) -> bool {
        tokio::select! {
            biased;
            _ = shutdown.triggered() => false,
            _ = tokio::time::sleep(self.config.retry_backoff) => true,
        }
    }

    fn snapshot(&mut self, vehicles: Vec<Vehicle>) -> Snapshot {
        let total = vehicles.len();
        let vehicles: Vec<_> = match &self.config.zone {
            Some(zone) => vehicles
                .into_iter()
                .filter(|v| v.zone.as_deref() == Some(zone.as_str()))
                .collect(),
            None => vehicles,
        };

        // Capture times are strictly increasing even when the wall clock
        // stalls or steps backwards. They name the archive records.
        let now = Utc::now();
        let taken_at = match self.last_taken_at {
            Some(prev) if now <= prev => prev + chrono::Duration::nanoseconds(1),
            _ => now,
        };
        self.last_taken_at = Some(taken_at);

        info!(vehicles = vehicles.len(), fetched = total, %taken_at, "Snapshot captured");
        Snapshot::new(taken_at, self.api.provider(), vehicles)
    }
}

#[async_trait]
impl<A: FleetApi> SnapshotSource for LiveSource<A> {
    fn name(&self) -> &str {
        "live"
    }

    #[tracing::instrument(skip_all, fields(provider = %self.api.provider()))]
    async fn run(
        mut self: Box<Self>,
        tx: mpsc::Sender<Snapshot>,
        mut shutdown: Shutdown,
    ) -> Result<(), SourceError> {
        // Cancellation is checked between work items only. A fetch that has
        // started is completed and its snapshot delivered.
        while !shutdown.is_triggered() {
            let Some(vehicles) = self.fetch(&mut shutdown).await? else {
                break;
            };

            let snapshot = self.snapshot(vehicles);
            if tx.send(snapshot).await.is_err() {
                debug!("Snapshot receiver closed");
                break;
            }

            tokio::select! {
                biased;
                _ = shutdown.triggered() => break,
                _ = tokio::time::sleep(self.config.interval) => {}
            }
        }

        info!("Live source stopped");
        Ok(())
    }
}
