use async_trait::async_trait;
use chrono::{DateTime, Utc};
use notify::event::ModifyKind;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{SnapshotSource, SourceError};
use crate::archive::{
    is_record_file, list_groups, list_records, parse_group_name, parse_record_name, read_record,
};
use crate::fleet::Snapshot;
use crate::shutdown::Shutdown;

#[derive(Debug, Clone)]
pub struct ReplayConfig {
    pub provider: String,
    /// Records before this instant are skipped.
    pub from: Option<DateTime<Utc>>,
    /// The stream ends at the first record at or after this instant.
    pub to: Option<DateTime<Utc>>,
    /// Keep watching the archive for new records once the backlog is done.
    pub follow: bool,
}

impl ReplayConfig {
    pub fn new(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            from: None,
            to: None,
            follow: false,
        }
    }
}

/// Reads snapshots back from an archive directory, oldest first.
pub struct ReplaySource {
    base_dir: PathBuf,
    config: ReplayConfig,
}

impl ReplaySource {
    pub fn new(base_dir: impl Into<PathBuf>, config: ReplayConfig) -> Self {
        Self {
            base_dir: base_dir.into(),
            config,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

/// Delivery state shared by the backlog and the tail.
struct Cursor<'a> {
    config: &'a ReplayConfig,
    tx: mpsc::Sender<Snapshot>,
    shutdown: Shutdown,
    last: Option<DateTime<Utc>>,
    delivered: usize,
    skipped: usize,
}

impl Cursor<'_> {
    /// Decodes and forwards the record at `path` if it belongs after
    /// everything delivered so far.
    async fn offer(&mut self, path: &Path) -> Flow {
        let Some((provider, taken_at)) = path
            .file_name()
            .and_then(|n| n.to_str())
            .filter(|_| is_record_file(path))
            .and_then(parse_record_name)
        else {
            return Flow::Continue;
        };
        if provider != self.config.provider {
            return Flow::Continue;
        }
        if self.config.from.is_some_and(|from| taken_at < from) {
            return Flow::Continue;
        }
        if self.config.to.is_some_and(|to| taken_at >= to) {
            debug!(%taken_at, "Reached end of replay range");
            return Flow::Stop;
        }
        if let Some(last) = self.last.filter(|last| taken_at <= *last) {
            if taken_at < last {
                warn!(path = %path.display(), %last, "Record older than last delivered, skipping");
            }
            return Flow::Continue;
        }

        let record = path.to_path_buf();
        let snapshot = match tokio::task::spawn_blocking(move || read_record(&record)).await {
            Ok(Ok(snapshot)) => snapshot,
            Ok(Err(e)) => {
                warn!(error = %e, "Skipping malformed record");
                self.skipped += 1;
                return Flow::Continue;
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Record decoder panicked, skipping");
                self.skipped += 1;
                return Flow::Continue;
            }
        };

        if self.tx.send(snapshot).await.is_err() {
            debug!("Snapshot receiver closed");
            return Flow::Stop;
        }
        self.last = Some(taken_at);
        self.delivered += 1;
        Flow::Continue
    }

    async fn offer_group(&mut self, group: &Path) -> Result<Flow, SourceError> {
        for record in list_records(group)? {
            if self.shutdown.is_triggered() || self.offer(&record).await == Flow::Stop {
                return Ok(Flow::Stop);
            }
        }
        Ok(Flow::Continue)
    }

    async fn on_event(&mut self, event: Event) -> Result<Flow, SourceError> {
        if !matches!(
            event.kind,
            EventKind::Create(_) | EventKind::Modify(ModifyKind::Name(_))
        ) {
            return Ok(Flow::Continue);
        }

        for path in event.paths {
            let new_group = path.is_dir()
                && path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .and_then(|n| parse_group_name(&self.config.provider, n))
                    .is_some();

            let flow = if new_group {
                info!(group = %path.display(), "New day group");
                // Records may land before the watch on the new directory is in place.
                self.offer_group(&path).await?
            } else if path.is_file() {
                self.offer(&path).await
            } else {
                Flow::Continue
            };
            if flow == Flow::Stop {
                return Ok(Flow::Stop);
            }
        }
        Ok(Flow::Continue)
    }
}

impl ReplaySource {
    fn watch(
        &self,
    ) -> Result<(RecommendedWatcher, mpsc::UnboundedReceiver<notify::Result<Event>>), SourceError>
    {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            let _ = event_tx.send(res);
        })?;
        watcher.watch(&self.base_dir, RecursiveMode::Recursive)?;
        Ok((watcher, event_rx))
    }
}

#[async_trait]
impl SnapshotSource for ReplaySource {
    fn name(&self) -> &str {
        "replay"
    }

    #[tracing::instrument(skip_all, fields(base_dir = %self.base_dir.display(), provider = %self.config.provider))]
    async fn run(
        self: Box<Self>,
        tx: mpsc::Sender<Snapshot>,
        mut shutdown: Shutdown,
    ) -> Result<(), SourceError> {
        // Watch before listing so nothing written in between is lost; the
        // cursor drops whatever the backlog already covered.
        let tail = if self.config.follow {
            std::fs::create_dir_all(&self.base_dir).map_err(|source| {
                crate::archive::ArchiveError::Io {
                    path: self.base_dir.clone(),
                    source,
                }
            })?;
            Some(self.watch()?)
        } else {
            None
        };

        let mut cursor = Cursor {
            config: &self.config,
            tx,
            shutdown: shutdown.clone(),
            last: None,
            delivered: 0,
            skipped: 0,
        };

        let groups = list_groups(&self.base_dir, &self.config.provider)?;
        info!(groups = groups.len(), "Replaying archive");

        let mut flow = Flow::Continue;
        for (date, group) in &groups {
            if cursor
                .config
                .to
                .is_some_and(|to| *date > to.date_naive())
            {
                flow = Flow::Stop;
                break;
            }
            if cursor.offer_group(group).await? == Flow::Stop {
                flow = Flow::Stop;
                break;
            }
        }

        if let (Flow::Continue, Some((_watcher, mut events))) = (&flow, tail) {
            info!(delivered = cursor.delivered, "Backlog done, tailing archive");
            loop {
                let event = tokio::select! {
                    biased;
                    _ = shutdown.triggered() => break,
                    event = events.recv() => event,
                };
                match event {
                    None => break,
                    Some(Err(e)) => warn!(error = %e, "Archive watch error"),
                    Some(Ok(event)) => {
                        if cursor.on_event(event).await? == Flow::Stop {
                            break;
                        }
                    }
                }
            }
        }

        info!(
            delivered = cursor.delivered,
            skipped = cursor.skipped,
            "Replay finished"
        );
        Ok(())
    }
}
