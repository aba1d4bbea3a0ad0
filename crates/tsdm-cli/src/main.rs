use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use env_logger::Env;
use log::debug;
use serde::Serialize;
use std::{
    fs::File,
    io,
    path::{Path, PathBuf},
    time::{Duration, Instant},
};
use tsdm_lib::{
    filter_window, io as data_io, merge, read_config, Chronology, DataSet, FetchTiming,
    ManagerConfig, Order, RefreshMode, RefreshScheduler, Retention,
};
use tsdm_sim::{read_scenario, run_scenario, write_report};

#[derive(Parser)]
#[command(
    name = "tsdm",
    version,
    about = "Time-series data manager tools: chronology, refresh planning, merging, streaming"
)]
struct Cli {
    /// Logging verbosity (e.g., debug, info, warn)
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum RetentionArg {
    #[value(name = "sliding")]
    Sliding,
    #[value(name = "unbounded")]
    Unbounded,
}

impl From<RetentionArg> for Retention {
    fn from(arg: RetentionArg) -> Self {
        match arg {
            RetentionArg::Sliding => Retention::Sliding,
            RetentionArg::Unbounded => Retention::Unbounded,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Detect the time ordering of a CSV result set
    Chronology {
        #[arg(long)]
        input: PathBuf,
        #[arg(long, default_value = "_time")]
        time_field: String,
    },
    /// Plan the next refresh for a cached CSV result set
    Plan {
        #[arg(long)]
        input: PathBuf,
        /// Manager config (TOML); supplies field names and the update interval
        #[arg(long)]
        config: Option<PathBuf>,
        /// Overrides min_update_interval from the config
        #[arg(long)]
        min_update_interval: Option<f64>,
        /// How long the last fetch took, in seconds
        #[arg(long, default_value_t = 0.0)]
        search_secs: f64,
    },
    /// Merge a fresh CSV result into a cached one
    Merge {
        #[arg(long)]
        cached: PathBuf,
        #[arg(long)]
        fresh: PathBuf,
        #[arg(long, value_enum, default_value = "sliding")]
        retention: RetentionArg,
        #[arg(long, default_value = "_time")]
        time_field: String,
        /// Write the merged rows here as CSV
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Keep the rows whose time lies in [min, max)
    Window {
        #[arg(long)]
        input: PathBuf,
        #[arg(long, allow_hyphen_values = true)]
        min: f64,
        #[arg(long, allow_hyphen_values = true)]
        max: f64,
        #[arg(long, default_value = "_time")]
        time_field: String,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Run a streaming scenario against the simulated backend
    Stream {
        #[arg(long)]
        scenario: PathBuf,
        /// Override the number of fetch rounds
        #[arg(long)]
        cycles: Option<usize>,
        /// Write the report JSON here as well as to stdout
        #[arg(long)]
        report: Option<PathBuf>,
        /// Write the final rows here as CSV
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

#[derive(Serialize)]
struct ChronologyOutput {
    order: Order,
    rows: usize,
    earliest: Option<f64>,
    latest: Option<f64>,
    monotonic: bool,
}

#[derive(Serialize)]
struct PlanOutput {
    mode: RefreshMode,
    delay_secs: f64,
    lookback: Option<String>,
    span: f64,
}

#[derive(Serialize)]
struct MergeOutput {
    fields: Vec<String>,
    rows: usize,
    retained: usize,
    appended: usize,
    truncated: bool,
}

#[derive(Serialize)]
struct WindowOutput {
    min: f64,
    max: f64,
    rows: usize,
    total: usize,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    env_logger::Builder::from_env(Env::default().default_filter_or(&cli.log_level)).init();
    match cli.command {
        Commands::Chronology { input, time_field } => cmd_chronology(&input, &time_field)?,
        Commands::Plan {
            input,
            config,
            min_update_interval,
            search_secs,
        } => cmd_plan(&input, config.as_deref(), min_update_interval, search_secs)?,
        Commands::Merge {
            cached,
            fresh,
            retention,
            time_field,
            out,
        } => cmd_merge(&cached, &fresh, retention.into(), &time_field, out.as_deref())?,
        Commands::Window {
            input,
            min,
            max,
            time_field,
            out,
        } => cmd_window(&input, min, max, &time_field, out.as_deref())?,
        Commands::Stream {
            scenario,
            cycles,
            report,
            out,
        } => cmd_stream(&scenario, cycles, report.as_deref(), out.as_deref())?,
    }
    Ok(())
}

fn time_index(data: &DataSet, time_field: &str) -> Result<usize> {
    data.field_index(time_field)
        .ok_or_else(|| anyhow!("no {} field in {:?}", time_field, data.fields()))
}

fn write_csv(data: &DataSet, out: &Path) -> Result<()> {
    let file = File::create(out).with_context(|| format!("creating {}", out.display()))?;
    data_io::write_dataset_csv(data, file)
}

fn cmd_chronology(input: &Path, time_field: &str) -> Result<()> {
    let data = data_io::read_dataset_csv(input)?;
    let idx = time_index(&data, time_field)?;
    let chrono = Chronology::detect(data.rows(), idx)?;
    let output = ChronologyOutput {
        order: chrono.order(),
        rows: data.len(),
        earliest: chrono.earliest_time(data.rows()),
        latest: chrono.latest_time(data.rows()),
        monotonic: chrono.is_monotonic(data.rows()),
    };
    println!("{}", serde_json::to_string(&output)?);
    Ok(())
}

fn cmd_plan(
    input: &Path,
    config: Option<&Path>,
    min_update_interval: Option<f64>,
    search_secs: f64,
) -> Result<()> {
    let config = match config {
        Some(path) => read_config(path)?,
        None => ManagerConfig::default(),
    };
    let data = data_io::read_dataset_csv(input)?;
    let scheduler = RefreshScheduler::new(config.time_field.clone(), config.span_field.clone());
    let search = Duration::try_from_secs_f64(search_secs)
        .with_context(|| format!("invalid search duration {}", search_secs))?;
    let start = Instant::now();
    let timing = FetchTiming {
        started_at: Some(start),
        finished_at: start.checked_add(search),
    };
    let interval = min_update_interval.unwrap_or(config.min_update_interval);
    let plan = scheduler.plan(&data, &timing, interval);
    debug!("planned {:?} for {} rows", plan.mode, data.len());
    let output = PlanOutput {
        mode: plan.mode,
        delay_secs: plan.delay.as_secs_f64(),
        lookback: plan.lookback,
        span: plan.span,
    };
    println!("{}", serde_json::to_string(&output)?);
    Ok(())
}

fn cmd_merge(
    cached: &Path,
    fresh: &Path,
    retention: Retention,
    time_field: &str,
    out: Option<&Path>,
) -> Result<()> {
    let cached = data_io::read_dataset_csv(cached)?;
    let fresh = data_io::read_dataset_csv(fresh)?;
    let idx = time_index(&cached, time_field)?;
    let outcome = merge(&cached, fresh, idx, retention)?;
    if let Some(out) = out {
        write_csv(&outcome.data, out)?;
    }
    let output = MergeOutput {
        fields: outcome.data.fields().to_vec(),
        rows: outcome.data.len(),
        retained: outcome.retained,
        appended: outcome.appended,
        truncated: outcome.truncated,
    };
    println!("{}", serde_json::to_string(&output)?);
    Ok(())
}

fn cmd_window(
    input: &Path,
    min: f64,
    max: f64,
    time_field: &str,
    out: Option<&Path>,
) -> Result<()> {
    if !min.is_finite() || !max.is_finite() || min > max {
        return Err(tsdm_lib::SyncError::InvalidWindow { min, max }.into());
    }
    let data = data_io::read_dataset_csv(input)?;
    let rows = filter_window(&data, time_field, min, max);
    let windowed = DataSet::new(data.fields().to_vec(), rows)?;
    match out {
        Some(out) => write_csv(&windowed, out)?,
        None => debug!("window kept {} of {} rows", windowed.len(), data.len()),
    }
    let output = WindowOutput {
        min,
        max,
        rows: windowed.len(),
        total: data.len(),
    };
    println!("{}", serde_json::to_string(&output)?);
    Ok(())
}

fn cmd_stream(
    scenario: &Path,
    cycles: Option<usize>,
    report: Option<&Path>,
    out: Option<&Path>,
) -> Result<()> {
    let mut scenario = read_scenario(scenario)?;
    if let Some(cycles) = cycles {
        scenario.cycles = cycles;
    }
    let (summary, data) = run_scenario(&scenario)?;
    if let Some(path) = report {
        write_report(path, &summary)?;
    }
    if let Some(path) = out {
        write_csv(&data, path)?;
    }
    serde_json::to_writer(io::stdout(), &summary)?;
    println!();
    Ok(())
}
