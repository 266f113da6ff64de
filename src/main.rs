use anyhow::{bail, Context, Result};
use chrono::{DateTime, FixedOffset, Utc};
use clap::{Parser, Subcommand};
use colored::*;
use csv::ReaderBuilder;
use serde::de::DeserializeOwned;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use tabled::{settings::Style, Table, Tabled};

use vitaldash::aggregation::TimeBucketAggregator;
use vitaldash::config::AppConfig;
use vitaldash::hrv::{clean_nn_intervals, NnIntervalStatistics};
use vitaldash::logging::init_logging;
use vitaldash::models::{Resolution, Sample, SampleMetric, SleepInterval, SleepMinute};
use vitaldash::sleep::{stage_totals, SleepStageResampler};

/// VitalDash - Health metrics analytics CLI
///
/// Offline access to the analytics core: HRV features from NN intervals,
/// gap-filled metric buckets and per-minute sleep timelines.
#[derive(Parser)]
#[command(name = "vitaldash")]
#[command(author = "VitalDash Contributors")]
#[command(version)]
#[command(about = "Health metrics analytics CLI", long_about = None)]
struct Cli {
    /// Sets a custom config file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Increase verbosity of output
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compute HRV features from a CSV column of NN intervals (ms)
    Hrv {
        /// Input CSV file
        #[arg(short, long)]
        input: PathBuf,

        /// Column holding the intervals (first column if omitted)
        #[arg(long)]
        column: Option<String>,

        /// Drop physiologically implausible intervals first
        #[arg(long)]
        clean: bool,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Bucket raw samples (JSON array of {timestamp, value})
    Bucket {
        /// Input JSON file
        #[arg(short, long)]
        input: PathBuf,

        /// Metric (heart-rate, steps, calories)
        #[arg(short, long, default_value = "heart-rate")]
        metric: SampleMetric,

        /// Bucket width (minute, hour, day)
        #[arg(short, long, default_value = "hour")]
        resolution: Resolution,

        /// Span start (RFC 3339)
        #[arg(long)]
        from: DateTime<Utc>,

        /// Span end, exclusive (RFC 3339)
        #[arg(long)]
        to: DateTime<Utc>,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Resample sleep intervals (JSON array of {start, end, stage}) per minute
    Sleep {
        /// Input JSON file
        #[arg(short, long)]
        input: PathBuf,

        /// Span start (RFC 3339)
        #[arg(long)]
        from: DateTime<Utc>,

        /// Span end, exclusive (RFC 3339)
        #[arg(long)]
        to: DateTime<Utc>,

        /// Only print minutes per stage
        #[arg(short, long)]
        summary: bool,
    },

    /// Show or initialize the configuration file
    Config {
        /// Print the effective configuration
        #[arg(short, long)]
        show: bool,

        /// Write a default configuration file
        #[arg(short, long)]
        init: bool,
    },
}

#[derive(Tabled)]
struct FeatureRow {
    #[tabled(rename = "Feature")]
    name: &'static str,
    #[tabled(rename = "Value")]
    value: String,
}

#[derive(Tabled)]
struct BucketRow {
    #[tabled(rename = "Bucket start")]
    start: String,
    #[tabled(rename = "Value")]
    value: String,
}

#[derive(Tabled)]
struct StageRunRow {
    #[tabled(rename = "From")]
    from: String,
    #[tabled(rename = "To")]
    to: String,
    #[tabled(rename = "Stage")]
    stage: String,
    #[tabled(rename = "Minutes")]
    minutes: usize,
}

#[derive(Tabled)]
struct StageTotalRow {
    #[tabled(rename = "Stage")]
    stage: String,
    #[tabled(rename = "Minutes")]
    minutes: u32,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => AppConfig::load_from_file(path)?,
        None => AppConfig::load_or_default(),
    };

    let mut log_config = config.logging.clone();
    log_config.level = log_config.level.raised_by(cli.verbose);
    init_logging(&log_config)?;

    match cli.command {
        Commands::Hrv {
            input,
            column,
            clean,
            json,
        } => run_hrv(&config, &input, column.as_deref(), clean, json),

        Commands::Bucket {
            input,
            metric,
            resolution,
            from,
            to,
            json,
        } => run_bucket(&config, &input, metric, resolution, from, to, json),

        Commands::Sleep {
            input,
            from,
            to,
            summary,
        } => run_sleep(&config, &input, from, to, summary),

        Commands::Config { show, init } => run_config(config, cli.config, show, init),
    }
}

fn run_hrv(config: &AppConfig, input: &Path, column: Option<&str>, clean: bool, json: bool) -> Result<()> {
    println!("{}", "Computing HRV features...".blue().bold());

    let mut nni = read_interval_column(input, column)?;
    let total = nni.len();
    if clean {
        let filter = config.analysis.nn_filter();
        nni = clean_nn_intervals(&nni, filter.low_ms, filter.high_ms);
        println!("  Kept {} of {} intervals", nni.len(), total);
    }

    let statistics = NnIntervalStatistics::with_stress_config(config.analysis.stress_config())?;
    let features = statistics.compute(&nni)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&features)?);
        return Ok(());
    }

    let rows = vec![
        FeatureRow { name: "mean_nni", value: format!("{:.2}", features.mean_nni) },
        FeatureRow { name: "median_nni", value: format!("{:.2}", features.median_nni) },
        FeatureRow { name: "range_nni", value: format!("{:.2}", features.range_nni) },
        FeatureRow { name: "sdnn", value: format!("{:.2}", features.sdnn) },
        FeatureRow { name: "sdsd", value: format!("{:.2}", features.sdsd) },
        FeatureRow { name: "rmssd", value: format!("{:.2}", features.rmssd) },
        FeatureRow { name: "nni_50", value: features.nni_50.to_string() },
        FeatureRow { name: "pnni_50", value: format!("{:.2}", features.pnni_50) },
        FeatureRow { name: "nni_20", value: features.nni_20.to_string() },
        FeatureRow { name: "pnni_20", value: format!("{:.2}", features.pnni_20) },
        FeatureRow { name: "cvsd", value: format!("{:.4}", features.cvsd) },
        FeatureRow { name: "cvnni", value: format!("{:.4}", features.cvnni) },
        FeatureRow { name: "mean_hr", value: format!("{:.1}", features.mean_hr) },
        FeatureRow { name: "min_hr", value: format!("{:.1}", features.min_hr) },
        FeatureRow { name: "max_hr", value: format!("{:.1}", features.max_hr) },
        FeatureRow { name: "std_hr", value: format!("{:.2}", features.std_hr) },
        FeatureRow { name: "stress_score", value: format!("{:.2}", features.stress_score) },
    ];
    println!("{}", Table::new(rows).with(Style::rounded()));
    println!("{}", "✓ HRV analysis completed".green());
    Ok(())
}

fn run_bucket(
    config: &AppConfig,
    input: &Path,
    metric: SampleMetric,
    resolution: Resolution,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    json: bool,
) -> Result<()> {
    println!("{}", format!("Bucketing {} by {}...", metric, resolution).cyan().bold());

    let offset = config.display.utc_offset()?;
    let samples: Vec<Sample> = read_json(input)?;
    let buckets = TimeBucketAggregator::for_metric(metric, resolution)
        .with_offset(offset)
        .aggregate(&samples, from, to)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&buckets)?);
        return Ok(());
    }

    let filled = buckets.iter().filter(|b| b.value.is_some()).count();
    let rows: Vec<BucketRow> = buckets
        .iter()
        .map(|bucket| BucketRow {
            start: local_label(bucket.start, offset),
            value: bucket
                .value
                .map(|v| format!("{:.2}", v))
                .unwrap_or_else(|| "-".to_string()),
        })
        .collect();

    println!("{}", Table::new(rows).with(Style::rounded()));
    println!(
        "{}",
        format!("✓ {} buckets, {} with data", buckets.len(), filled).cyan()
    );
    Ok(())
}

fn run_sleep(config: &AppConfig, input: &Path, from: DateTime<Utc>, to: DateTime<Utc>, summary: bool) -> Result<()> {
    println!("{}", "Resampling sleep stages...".magenta().bold());

    let offset = config.display.utc_offset()?;
    let intervals: Vec<SleepInterval> = read_json(input)?;
    let minutes = SleepStageResampler::new().resample(&intervals, from, to)?;

    if summary {
        let rows: Vec<StageTotalRow> = stage_totals(&minutes)
            .into_iter()
            .map(|(stage, minutes)| StageTotalRow {
                stage: stage.to_string(),
                minutes,
            })
            .collect();
        println!("{}", Table::new(rows).with(Style::rounded()));
    } else {
        let rows: Vec<StageRunRow> = stage_runs(&minutes)
            .into_iter()
            .map(|run| StageRunRow {
                from: local_label(run[0].minute, offset),
                to: local_label(run[run.len() - 1].minute + chrono::Duration::minutes(1), offset),
                stage: run[0].stage.to_string(),
                minutes: run.len(),
            })
            .collect();
        println!("{}", Table::new(rows).with(Style::rounded()));
    }

    println!("{}", format!("✓ {} minutes resampled", minutes.len()).magenta());
    Ok(())
}

fn run_config(mut config: AppConfig, path: Option<PathBuf>, show: bool, init: bool) -> Result<()> {
    let path = path.unwrap_or_else(AppConfig::default_config_path);

    if init {
        if path.exists() {
            bail!("Config file already exists: {}", path.display());
        }
        config = AppConfig::default();
        config.save_to_file(&path)?;
        println!("{}", format!("✓ Wrote default configuration to {}", path.display()).green());
    }

    if show || !init {
        println!("{}", format!("Configuration ({})", path.display()).white().bold());
        println!("{}", toml::to_string_pretty(&config)?);
    }
    Ok(())
}

/// Consecutive minutes sharing a stage
fn stage_runs(minutes: &[SleepMinute]) -> Vec<&[SleepMinute]> {
    minutes
        .chunk_by(|a, b| a.stage == b.stage)
        .collect()
}

fn local_label(instant: DateTime<Utc>, offset: FixedOffset) -> String {
    instant.with_timezone(&offset).format("%Y-%m-%d %H:%M").to_string()
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("Failed to parse JSON from {}", path.display()))
}

fn read_interval_column(path: &Path, column: Option<&str>) -> Result<Vec<f64>> {
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .from_path(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;

    let headers = reader.headers()?.clone();
    let index = match column {
        Some(name) => headers
            .iter()
            .position(|h| h.trim().eq_ignore_ascii_case(name))
            .with_context(|| format!("Column '{}' not found in {}", name, path.display()))?,
        None => 0,
    };

    let mut values = Vec::new();
    for (row, result) in reader.records().enumerate() {
        let record = result?;
        let Some(field) = record.get(index) else {
            continue;
        };
        let field = field.trim();
        if field.is_empty() {
            continue;
        }
        let value: f64 = field
            .parse()
            .with_context(|| format!("Row {}: '{}' is not a number", row + 2, field))?;
        values.push(value);
    }
    Ok(values)
}
