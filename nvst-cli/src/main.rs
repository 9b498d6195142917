use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context as _, Result, bail};
use chrono::Local;
use clap::{Args, Parser, Subcommand, ValueEnum};
use mod_runner::{
    DEFAULT_SCRIPT, RunEvent, RunOutcome, RunRegistry, RunRequest, TestRunner, Workload,
    log_path_for, test_id_for,
};
use nvst_core::{Context, Progress, ReportError, collect_report_with_progress, write_atomic};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

// Ensure extractor modules are linked so their rules register.
use mod_fio as _;
use mod_smart as _;

const PROGRESS_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Parser, Debug)]
#[command(
    name = "nvst",
    version,
    about = "NVMe stress test runner and report generator"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Build a report from per-device stress logs
    Report(ReportArgs),
    /// List NVMe devices with health and mount state
    Devices {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Print the SMART dump for one device
    Health {
        /// Device name or path, e.g. nvme0n1
        device: String,
        /// Print only the `smartctl -H` verdict
        #[arg(long)]
        summary: bool,
    },
    /// Run the stress script against one device
    Run(RunArgs),
    /// List stress logs, newest first
    Logs {
        #[arg(long, default_value = ".")]
        log_dir: PathBuf,
    },
}

#[derive(Args, Debug)]
struct ReportArgs {
    /// Directory holding nvme*.log files
    #[arg(long, default_value = ".")]
    log_dir: PathBuf,
    /// Output file; defaults to nvme_stress_test_report.html in the log directory
    #[arg(long)]
    output: Option<PathBuf>,
    /// Merge <device>_read.json / <device>_write.json peak results
    #[arg(long)]
    peak: bool,
    #[arg(long, value_enum, default_value_t = OutputFormat::Html)]
    format: OutputFormat,
    #[arg(long, default_value = "nvme")]
    log_prefix: String,
    #[arg(long, default_value = "AI Workload")]
    test_type: String,
    #[arg(long, default_value = "10 min")]
    duration_label: String,
    #[arg(long, default_value = "/sys")]
    sysfs_root: PathBuf,
}

#[derive(Clone, Debug, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Html,
    Markdown,
    Json,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Device name or path, e.g. nvme0n1
    #[arg(long)]
    device: String,
    /// Test duration in seconds
    #[arg(long, default_value_t = 600)]
    duration: u64,
    #[arg(long, value_enum, default_value_t = WorkloadArg::Ai)]
    workload: WorkloadArg,
    /// Log file name without extension
    #[arg(long)]
    log_name: Option<String>,
    #[arg(long, default_value = ".")]
    log_dir: PathBuf,
    #[arg(long, default_value = DEFAULT_SCRIPT)]
    script: PathBuf,
    /// Refuse to run on a mounted device instead of unmounting it
    #[arg(long)]
    no_auto_unmount: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum WorkloadArg {
    Ai,
    Standard,
}

impl From<WorkloadArg> for Workload {
    fn from(value: WorkloadArg) -> Self {
        match value {
            WorkloadArg::Ai => Workload::Ai,
            WorkloadArg::Standard => Workload::Standard,
        }
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("nvst=info,warn")),
        )
        .init();
}

fn main() -> Result<ExitCode> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Command::Report(args) => report(args, &mut io::stdout().lock()).map(exit_status),
        Command::Devices { json } => devices(json),
        Command::Health { device, summary } => health(&device, summary),
        Command::Run(args) => run(args, &mut io::stdout().lock()),
        Command::Logs { log_dir } => logs(log_dir),
    }
}

fn exit_status(ok: bool) -> ExitCode {
    if ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn print_progress<W: Write>(
    out: &mut W,
    progress: &Progress<'_>,
    include_peak: bool,
) -> io::Result<()> {
    match progress {
        Progress::Found(count) => writeln!(out, "Found {} log files", count),
        Progress::Parsing(path) => {
            let name = path.file_name().unwrap_or(path.as_os_str());
            writeln!(out, "Parsing {}...", name.to_string_lossy())
        }
        Progress::Parsed(record) if include_peak => {
            if let Some(read) = record.peak_read {
                writeln!(out, "  Peak read: {}", read)?;
            }
            if let Some(write) = record.peak_write {
                writeln!(out, "  Peak write: {}", write)?;
            }
            Ok(())
        }
        Progress::Parsed(_) => Ok(()),
    }
}

/// Returns `false` when there was nothing to report on.
fn report<W: Write>(args: ReportArgs, out: &mut W) -> Result<bool> {
    let ctx = Context::new()
        .with_log_dir(&args.log_dir)
        .with_log_prefix(args.log_prefix)
        .with_output(args.output.clone())
        .with_peak(args.peak)
        .with_sysfs_root(args.sysfs_root)
        .with_labels(args.test_type, args.duration_label);

    let include_peak = ctx.include_peak();
    let mut printed = Ok(());
    let collected = collect_report_with_progress(&ctx, |progress| {
        if printed.is_ok() {
            printed = print_progress(out, &progress, include_peak);
        }
    });
    printed?;

    let report = match collected {
        Ok(report) => report,
        Err(ReportError::NoInput { .. }) => {
            writeln!(out, "No log files found!")?;
            return Ok(false);
        }
        Err(err) => return Err(err.into()),
    };

    let rendered = match args.format {
        OutputFormat::Html => {
            let path = ctx.output_path();
            report.write_html(&path)?;
            writeln!(out, "Report generated successfully: {}", path.display())?;
            return Ok(true);
        }
        OutputFormat::Markdown => report.to_markdown()?,
        OutputFormat::Json => serde_json::to_string_pretty(&report.to_json_value())?,
    };

    match args.output {
        Some(path) => {
            write_atomic(&path, &rendered)?;
            writeln!(out, "Report generated successfully: {}", path.display())?;
        }
        None => writeln!(out, "{}", rendered)?,
    }
    Ok(true)
}

fn devices(json: bool) -> Result<ExitCode> {
    let devices = mod_devices::discover_devices();

    if json {
        let payload: Vec<_> = devices
            .iter()
            .map(|device| {
                serde_json::json!({
                    "device": device,
                    "health": mod_devices::health_summary(&device.path),
                    "mounted": mod_devices::is_mounted(&device.name),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&payload)?);
        return Ok(ExitCode::SUCCESS);
    }

    if devices.is_empty() {
        println!("No NVMe devices found");
        return Ok(ExitCode::SUCCESS);
    }
    println!("{:<10} {:>8}  {:<32} {:<8} MOUNTED", "NAME", "SIZE", "MODEL", "HEALTH");
    for device in &devices {
        let health = mod_devices::health_summary(&device.path);
        let mounted = if mod_devices::is_mounted(&device.name) {
            "yes"
        } else {
            "no"
        };
        println!(
            "{:<10} {:>8}  {:<32} {:<8} {}",
            device.name,
            device.size,
            device.model,
            health.as_str(),
            mounted
        );
    }
    Ok(ExitCode::SUCCESS)
}

fn device_path(device: &str) -> (String, String) {
    let name = device.trim_start_matches("/dev/").to_string();
    let path = format!("/dev/{}", name);
    (name, path)
}

fn health(device: &str, summary: bool) -> Result<ExitCode> {
    let (_, path) = device_path(device);
    if summary {
        let status = mod_devices::health_summary(&path);
        println!("{}: {}", path, status.as_str());
        return Ok(ExitCode::SUCCESS);
    }
    print!("{}", mod_devices::smart_report(&path)?);
    Ok(ExitCode::SUCCESS)
}

/// Whether the device must be unmounted first; refuses when auto-unmount is off.
fn needs_unmount(path: &str, partitions: &[String], auto_unmount: bool) -> Result<bool> {
    if partitions.is_empty() {
        return Ok(false);
    }
    if !auto_unmount {
        bail!(
            "{} has mounted partitions ({}); unmount them first",
            path,
            partitions.join(", ")
        );
    }
    Ok(true)
}

fn cancel_on_interrupt(registry: &RunRegistry, id: &str) {
    warn!(test = id, "interrupt received; cancelling test");
    if let Err(err) = registry.cancel(id) {
        warn!(test = id, "cancel failed: {err}");
    }
}

/// Prints output until the run finishes, with a progress line every minute.
fn stream_events<W: Write>(
    rx: &Receiver<RunEvent>,
    registry: &RunRegistry,
    id: &str,
    out: &mut W,
) -> Result<RunOutcome> {
    let mut last_progress = Instant::now();
    loop {
        match rx.recv_timeout(Duration::from_secs(1)) {
            Ok(RunEvent::Output(line)) => writeln!(out, "{}", line.text)?,
            Ok(RunEvent::Finished(outcome)) => {
                writeln!(out, "{}", outcome)?;
                return Ok(outcome);
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                bail!("test {} ended without reporting a result", id)
            }
        }

        if last_progress.elapsed() >= PROGRESS_INTERVAL {
            last_progress = Instant::now();
            if let Some(progress) = registry.progress(id) {
                writeln!(out, "[{}%] {}", progress.percent, progress.describe_remaining())?;
            }
        }
    }
}

fn run<W: Write>(args: RunArgs, out: &mut W) -> Result<ExitCode> {
    let (name, path) = device_path(&args.device);

    let partitions = mod_devices::mounted_partitions(&path).unwrap_or_else(|err| {
        warn!(device = %path, "mount check failed: {err}");
        Vec::new()
    });
    if needs_unmount(&path, &partitions, !args.no_auto_unmount)? {
        let unmounted = mod_devices::unmount_all(&path)
            .with_context(|| format!("failed to unmount {}", path))?;
        writeln!(out, "Unmounted {}", unmounted.join(", "))?;
    }

    let now = Local::now().naive_local();
    let log_path = log_path_for(&args.log_dir, &name, args.log_name.as_deref(), now);
    let id = test_id_for(&name, now);
    let request = RunRequest {
        device_path: path,
        duration_secs: args.duration,
        log_path: log_path.clone(),
        workload: args.workload.into(),
    };

    let registry = Arc::new(RunRegistry::new());
    let (tx, rx) = mpsc::channel();
    TestRunner::new(&args.script).start_tracked(&registry, &id, request, move |event| {
        let _ = tx.send(event);
    })?;

    // The script runs in its own process group, so a terminal Ctrl-C only reaches us.
    let interrupt_registry = Arc::clone(&registry);
    let interrupt_id = id.clone();
    ctrlc::set_handler(move || cancel_on_interrupt(&interrupt_registry, &interrupt_id))
        .context("failed to install Ctrl-C handler")?;

    info!(test = %id, log = %log_path.display(), "test running");
    writeln!(out, "Started {} (log: {})", id, log_path.display())?;

    let outcome = stream_events(&rx, &registry, &id, out)?;
    let code = u8::try_from(outcome.exit_code()).unwrap_or(1);
    Ok(ExitCode::from(code))
}

fn logs(log_dir: PathBuf) -> Result<ExitCode> {
    let entries = nvst_core::list_logs(&log_dir)?;
    if entries.is_empty() {
        println!("No log files found!");
        return Ok(ExitCode::SUCCESS);
    }
    for entry in entries {
        println!(
            "{:<48} {:>12}  {}",
            entry.name, entry.size_bytes, entry.modified
        );
    }
    Ok(ExitCode::SUCCESS)
}
