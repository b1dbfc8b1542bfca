//! On-disk snapshot archive.
//!
//! Snapshots are grouped by day:
//!
//! ```text
//! <base>/<provider>_<YYYY-MM-DD>/<provider>_<RFC 3339 timestamp>.json.gz
//! ```
//!
//! Each record is a gzip-compressed JSON array of vehicles. Records are
//! written under a hidden temporary name and renamed into place, so readers
//! never observe a partially written file.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

use crate::fleet::{Snapshot, Vehicle};
use crate::sink::SnapshotSink;

const RECORD_SUFFIX: &str = ".json.gz";
const GROUP_DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("not an archive record name: {}", .0.display())]
    BadName(PathBuf),
    #[error("failed to decode {}: {source}", .path.display())]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("record already exists: {}", .0.display())]
    Exists(PathBuf),
    #[error("failed to encode snapshot for {}: {source}", .path.display())]
    Encode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> ArchiveError + '_ {
    move |source| ArchiveError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Name of the day group holding snapshots of `provider` taken on `date`.
pub fn group_name(provider: &str, date: NaiveDate) -> String {
    format!("{}_{}", provider, date.format(GROUP_DATE_FORMAT))
}

/// File name of the record for a snapshot taken at `taken_at`. The
/// timestamp keeps full nanosecond precision at a fixed width, so names
/// sort in capture order.
pub fn record_name(provider: &str, taken_at: DateTime<Utc>) -> String {
    format!(
        "{}_{}{}",
        provider,
        taken_at.to_rfc3339_opts(SecondsFormat::Nanos, true),
        RECORD_SUFFIX
    )
}

/// Splits a record file name into provider and capture time.
pub fn parse_record_name(file_name: &str) -> Option<(String, DateTime<Utc>)> {
    let stem = file_name.strip_suffix(RECORD_SUFFIX)?;
    let (provider, stamp) = stem.rsplit_once('_')?;
    if provider.is_empty() {
        return None;
    }
    let taken_at = DateTime::parse_from_rfc3339(stamp).ok()?.with_timezone(&Utc);
    Some((provider.to_string(), taken_at))
}

/// Date of a day group directory belonging to `provider`.
pub fn parse_group_name(provider: &str, dir_name: &str) -> Option<NaiveDate> {
    let date = dir_name.strip_prefix(provider)?.strip_prefix('_')?;
    NaiveDate::parse_from_str(date, GROUP_DATE_FORMAT).ok()
}

/// True for file names that look like finished records.
pub fn is_record_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.ends_with(RECORD_SUFFIX) && !n.starts_with('.'))
}

/// Day groups of `provider` under `base_dir`, oldest first.
pub fn list_groups(base_dir: &Path, provider: &str) -> Result<Vec<(NaiveDate, PathBuf)>, ArchiveError> {
    let mut groups = Vec::new();

    for entry in fs::read_dir(base_dir).map_err(io_err(base_dir))? {
        let entry = entry.map_err(io_err(base_dir))?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        if let Some(date) = parse_group_name(provider, &name) {
            groups.push((date, path));
        }
    }

    groups.sort();
    Ok(groups)
}

/// Record files of one day group in capture order.
pub fn list_records(group_dir: &Path) -> Result<Vec<PathBuf>, ArchiveError> {
    let mut records = Vec::new();

    for entry in fs::read_dir(group_dir).map_err(io_err(group_dir))? {
        let path = entry.map_err(io_err(group_dir))?.path();
        if path.is_file() && is_record_file(&path) {
            records.push(path);
        }
    }

    // Names written with a different timestamp precision do not sort
    // lexicographically, so order by the parsed time.
    records.sort_by_cached_key(|path| {
        let taken_at = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(parse_record_name)
            .map(|(_, t)| t);
        (taken_at, path.clone())
    });
    Ok(records)
}

/// Decodes one archived record into a snapshot.
pub fn read_record(path: &Path) -> Result<Snapshot, ArchiveError> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| ArchiveError::BadName(path.to_path_buf()))?;
    let (provider, taken_at) =
        parse_record_name(file_name).ok_or_else(|| ArchiveError::BadName(path.to_path_buf()))?;

    let file = File::open(path).map_err(io_err(path))?;
    let reader = BufReader::new(GzDecoder::new(file));
    let vehicles: Vec<Vehicle> =
        serde_json::from_reader(reader).map_err(|source| ArchiveError::Decode {
            path: path.to_path_buf(),
            source,
        })?;

    Ok(Snapshot::new(taken_at, provider, vehicles))
}

/// Writes snapshots into the day-grouped layout.
#[derive(Debug, Clone)]
pub struct ArchiveWriter {
    base_dir: PathBuf,
}

impl ArchiveWriter {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Persists `snapshot` and returns the path of the new record.
    ///
    /// # Errors
    ///
    /// Refuses to replace an existing record with [`ArchiveError::Exists`].
    pub fn write(&self, snapshot: &Snapshot) -> Result<PathBuf, ArchiveError> {
        let group = self
            .base_dir
            .join(group_name(&snapshot.provider, snapshot.taken_at.date_naive()));
        fs::create_dir_all(&group).map_err(io_err(&group))?;

        let name = record_name(&snapshot.provider, snapshot.taken_at);
        let final_path = group.join(&name);
        let tmp_path = group.join(format!(".{name}.tmp"));
        if final_path.exists() {
            return Err(ArchiveError::Exists(final_path));
        }

        let file = File::create(&tmp_path).map_err(io_err(&tmp_path))?;
        let mut encoder = GzEncoder::new(BufWriter::new(file), Compression::best());
        let vehicles: Vec<&Vehicle> = snapshot.vehicles().collect();
        serde_json::to_writer(&mut encoder, &vehicles).map_err(|source| ArchiveError::Encode {
            path: final_path.clone(),
            source,
        })?;
        let mut writer = encoder.finish().map_err(io_err(&tmp_path))?;
        writer.flush().map_err(io_err(&tmp_path))?;
        drop(writer);

        fs::rename(&tmp_path, &final_path).map_err(io_err(&final_path))?;
        debug!(path = %final_path.display(), vehicles = snapshot.len(), "Snapshot archived");

        Ok(final_path)
    }
}

/// Pipeline sink that archives every snapshot.
pub struct ArchiveSink {
    writer: ArchiveWriter,
}

impl ArchiveSink {
    pub fn new(writer: ArchiveWriter) -> Self {
        Self { writer }
    }
}

#[async_trait]
impl SnapshotSink for ArchiveSink {
    fn name(&self) -> &str {
        "archive"
    }

    async fn accept(&mut self, snapshot: &Snapshot) -> Result<()> {
        let writer = self.writer.clone();
        let snapshot = snapshot.clone();
        tokio::task::spawn_blocking(move || writer.write(&snapshot)).await??;
        Ok(())
    }
}
