//! CLI entry point for the fleet trip reconstruction tool.
//!
//! Provides subcommands for polling a provider into the snapshot archive,
//! replaying an archive through the trip tracker, and logging in.

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use clap::{Args, Parser, Subcommand};
use fleet_trips::{
    archive::{ArchiveSink, ArchiveWriter},
    classify::ClassifierConfig,
    fetch::BasicClient,
    infra::fleet_http::{BoundingBox, HttpFleetApi, HttpFleetApiConfig},
    infra::tokens::FileTokenStore,
    output::{CsvTripSink, LogTripSink, print_json},
    pipeline::{Pipeline, PipelineConfig},
    services::fleet_api::{CodePrompt, FleetApi},
    shutdown::{self, Shutdown},
    source::{LiveSource, LiveSourceConfig, ReplayConfig, ReplaySource, SnapshotSource},
    stats::{StatsSink, TripStats},
};
use std::ffi::OsStr;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

#[derive(Parser)]
#[command(name = "fleet_trips")]
#[command(about = "Reconstructs shared-vehicle trips from fleet snapshots", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Poll the provider, archive every snapshot and track trips
    Scrape {
        #[command(flatten)]
        provider: ProviderArgs,

        /// Archive directory for snapshots
        #[arg(short, long, env = "OUTPUT_DIR", default_value = "data")]
        output_dir: PathBuf,

        /// Seconds between the end of one fetch and the next
        #[arg(short, long, env = "POLL_INTERVAL", default_value_t = 60)]
        interval: u64,

        /// Only keep vehicles of this zone (e.g. "DORTMUND")
        #[arg(long, env = "ZONE")]
        zone: Option<String>,

        #[command(flatten)]
        classifier: ClassifierArgs,

        #[command(flatten)]
        report: ReportArgs,
    },
    /// Replay an archive through the trip tracker
    Replay {
        /// Archive directory to read
        #[arg(short, long, env = "INPUT_DIR", default_value = "data")]
        input_dir: PathBuf,

        /// Provider namespace of the archived snapshots
        #[arg(long, env = "PROVIDER", default_value = "circ")]
        provider: String,

        /// Skip records before this UTC time (YYYY-MM-DDTHH:MM)
        #[arg(long, value_parser = parse_minute)]
        from: Option<DateTime<Utc>>,

        /// Stop at the first record at or after this UTC time (YYYY-MM-DDTHH:MM)
        #[arg(long, value_parser = parse_minute)]
        to: Option<DateTime<Utc>>,

        /// Keep watching the archive for new records
        #[arg(short, long, default_value_t = false)]
        follow: bool,

        #[command(flatten)]
        classifier: ClassifierArgs,

        #[command(flatten)]
        report: ReportArgs,
    },
    /// Log in with phone number and one-time code, then store the tokens
    Login {
        #[command(flatten)]
        provider: ProviderArgs,
    },
}

#[derive(Args)]
struct ProviderArgs {
    /// Provider namespace stamped on snapshots
    #[arg(long, env = "PROVIDER", default_value = "circ")]
    provider: String,

    #[arg(long, env = "API_BASE_URL", default_value = "https://node.goflash.com/")]
    base_url: String,

    /// Country prefix of the login phone number
    #[arg(long, env = "PHONE_PREFIX", default_value = "+49")]
    phone_prefix: String,

    /// Login phone number without leading zero
    #[arg(long, env = "PHONE_NUMBER", default_value = "")]
    phone_number: String,

    /// File holding the session tokens
    #[arg(long, env = "TOKEN_FILE", default_value = ".tokens")]
    token_file: PathBuf,

    #[arg(long, env = "BBOX_LAT_TOP_LEFT", default_value_t = 51.582780)]
    lat_top_left: f64,

    #[arg(long, env = "BBOX_LON_TOP_LEFT", default_value_t = 7.325945)]
    lon_top_left: f64,

    #[arg(long, env = "BBOX_LAT_BOTTOM_RIGHT", default_value_t = 51.475727)]
    lat_bottom_right: f64,

    #[arg(long, env = "BBOX_LON_BOTTOM_RIGHT", default_value_t = 7.558172)]
    lon_bottom_right: f64,
}

#[derive(Args)]
struct ClassifierArgs {
    /// Charge gain above which a trip is a recharge
    #[arg(long, env = "RECHARGE_MIN_GAIN", default_value_t = 0.0)]
    recharge_min_gain: f64,

    /// Relocations use less energy than this
    #[arg(long, env = "RELOCATION_MAX_ENERGY", default_value_t = 1.1)]
    relocation_max_energy: f64,

    /// Relocations move further than this many kilometers
    #[arg(long, env = "RELOCATION_MIN_DISTANCE_KM", default_value_t = 1.0)]
    relocation_min_distance_km: f64,
}

#[derive(Args)]
struct ReportArgs {
    /// CSV file to append finalized trips to
    #[arg(long, env = "TRIPS_CSV")]
    trips_csv: Option<PathBuf>,

    /// Customer trips at least this long count as long trips
    #[arg(long, default_value_t = 60)]
    long_trip_mins: i64,
}

impl From<&ClassifierArgs> for ClassifierConfig {
    fn from(args: &ClassifierArgs) -> Self {
        Self {
            recharge_min_gain: args.recharge_min_gain,
            relocation_max_energy: args.relocation_max_energy,
            relocation_min_distance_km: args.relocation_min_distance_km,
        }
    }
}

fn parse_minute(s: &str) -> Result<DateTime<Utc>, String> {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M")
        .map(|t| t.and_utc())
        .map_err(|e| format!("expected YYYY-MM-DDTHH:MM: {e}"))
}

/// Reads the one-time code from the terminal.
struct StdinPrompt;

#[async_trait]
impl CodePrompt for StdinPrompt {
    async fn one_time_code(&self) -> Result<String> {
        tokio::task::spawn_blocking(|| -> Result<String> {
            eprint!("Enter the code you received by SMS: ");
            std::io::stderr().flush()?;
            let mut line = String::new();
            std::io::stdin().read_line(&mut line)?;
            Ok(line.trim().to_string())
        })
        .await?
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok(); // Load .env file

    // Logging setup: colored stderr + JSON rolling log file
    let log_file_path =
        std::env::var("LOG_FILE_PATH").unwrap_or_else(|_| "logs/fleet_trips.log".to_string());
    let log_dir = Path::new(&log_file_path)
        .parent()
        .unwrap_or(Path::new("logs"));
    let log_file_name = Path::new(&log_file_path)
        .file_name()
        .unwrap_or(OsStr::new("fleet_trips.log"));

    let file_appender = tracing_appender::rolling::daily(log_dir, log_file_name);
    let (non_blocking_file, _file_guard) = tracing_appender::non_blocking(file_appender);

    let stderr_layer = fmt::layer()
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::from_env("RUST_LOG").add_directive("info".parse()?));

    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_writer(non_blocking_file)
        .with_filter(EnvFilter::from_env("RUST_LOG_JSON").add_directive("debug".parse()?));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Scrape {
            provider,
            output_dir,
            interval,
            zone,
            classifier,
            report,
        } => {
            let api = build_api(&provider).await?;
            info!(
                provider = api.provider(),
                output_dir = %output_dir.display(),
                interval,
                zone = zone.as_deref().unwrap_or("all"),
                "Scraping. Press Ctrl+C to stop."
            );

            let source = LiveSource::new(
                api,
                Arc::new(StdinPrompt),
                LiveSourceConfig {
                    interval: Duration::from_secs(interval),
                    zone,
                    ..LiveSourceConfig::default()
                },
            );
            let archive = ArchiveSink::new(ArchiveWriter::new(&output_dir));
            run_pipeline(Box::new(source), Some(archive), &classifier, &report).await?;
        }
        Commands::Replay {
            input_dir,
            provider,
            from,
            to,
            follow,
            classifier,
            report,
        } => {
            if let (Some(from), Some(to)) = (from, to) {
                if from >= to {
                    bail!("--from ({from}) must be before --to ({to})");
                }
            }
            info!(
                input_dir = %input_dir.display(),
                provider = %provider,
                from = ?from,
                to = ?to,
                follow,
                "Replaying archive"
            );

            let source = ReplaySource::new(
                input_dir,
                ReplayConfig {
                    provider,
                    from,
                    to,
                    follow,
                },
            );
            run_pipeline(Box::new(source), None, &classifier, &report).await?;
        }
        Commands::Login { provider } => {
            if provider.phone_number.is_empty() {
                bail!("PHONE_NUMBER must be set to log in");
            }
            let api = build_api(&provider).await?;
            api.reauthenticate(&StdinPrompt).await?;
            info!(token_file = %provider.token_file.display(), "Session tokens stored");
        }
    }

    Ok(())
}

/// Builds the provider client, restoring tokens from the token file.
async fn build_api(args: &ProviderArgs) -> Result<HttpFleetApi<BasicClient>> {
    let client = BasicClient::with_timeout(Duration::from_secs(30))?;
    let config = HttpFleetApiConfig {
        provider: args.provider.clone(),
        base_url: args.base_url.clone(),
        bbox: BoundingBox {
            lat_top_left: args.lat_top_left,
            lon_top_left: args.lon_top_left,
            lat_bottom_right: args.lat_bottom_right,
            lon_bottom_right: args.lon_bottom_right,
        },
        phone_prefix: args.phone_prefix.clone(),
        phone_number: args.phone_number.clone(),
        ..HttpFleetApiConfig::default()
    };
    let store = FileTokenStore::new(&args.token_file);

    HttpFleetApi::new(client, config, Some(Box::new(store)))
        .await
        .context("failed to set up provider client")
}

/// Stops the run on Ctrl+C.
fn ctrl_c_shutdown() -> Shutdown {
    let (handle, shutdown) = shutdown::channel();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Ctrl+C received, stopping after the current snapshot");
                handle.trigger();
            }
            Err(e) => warn!(error = %e, "Cannot listen for Ctrl+C"),
        }
    });
    shutdown
}

/// Runs one pipeline with the standard trip sinks and reports the outcome.
#[tracing::instrument(skip_all, fields(source = source.name()))]
async fn run_pipeline(
    source: Box<dyn SnapshotSource>,
    archive: Option<ArchiveSink>,
    classifier: &ClassifierArgs,
    report: &ReportArgs,
) -> Result<()> {
    let stats_sink = StatsSink::new(TripStats::with_long_trip_threshold(
        chrono::Duration::minutes(report.long_trip_mins),
    ));
    let stats = stats_sink.handle();

    let mut pipeline = Pipeline::new(PipelineConfig {
        classifier: classifier.into(),
        ..PipelineConfig::default()
    })
    .with_trip_sink(LogTripSink)
    .with_trip_sink(stats_sink);

    if let Some(path) = &report.trips_csv {
        info!(path = %path.display(), "Appending trips to CSV");
        pipeline = pipeline.with_trip_sink(CsvTripSink::new(path));
    }
    if let Some(archive) = archive {
        pipeline = pipeline.with_snapshot_sink(archive);
    }

    let outcome = pipeline.run(source, ctrl_c_shutdown()).await;

    let summary = stats.lock().unwrap_or_else(|e| e.into_inner()).summary();
    print_json(&summary)?;

    match outcome {
        Ok(report) => {
            for open in &report.open_trips {
                debug!(
                    vehicle_id = %open.vehicle_id,
                    started_at = %open.started_at,
                    start_charge = open.start_charge,
                    "Trip still open"
                );
            }
            if !report.failed_sinks.is_empty() {
                warn!(sinks = ?report.failed_sinks, "Some sinks failed during the run");
            }
            info!(
                snapshots = report.snapshots,
                trips = report.trips,
                open_trips = report.open_trips.len(),
                last_snapshot = ?report.last_snapshot,
                "Run finished"
            );
            Ok(())
        }
        Err(e) => {
            error!(
                stage = e.stage(),
                last_snapshot = ?e.last_snapshot(),
                error = %e,
                "Run failed"
            );
            Err(e.into())
        }
    }
}
