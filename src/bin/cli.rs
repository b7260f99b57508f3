//! Binary entry point for the pendel administrative CLI.
#![forbid(unsafe_code)]

use std::error::Error;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use pendel::{
    admin::{inspect, recover_data_dir, InspectReport, RecordDetail, RecoverOptions},
    config::PendelConfig,
    storage::RecoveryReport,
    types::Xid,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "pendel",
    version,
    about = "Inspect pending-delete logs and remove orphaned relation files",
    disable_help_subcommand = true
)]
struct Cli {
    #[arg(
        long,
        global = true,
        value_enum,
        default_value_t = OutputFormat::Text,
        help = "Output format for structured responses"
    )]
    format: OutputFormat,

    #[arg(
        long,
        global = true,
        env = "PENDEL_LOG",
        default_value = "warn",
        help = "Log filter directive (tracing EnvFilter syntax)"
    )]
    log: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    #[command(about = "Describe every record of a log file")]
    Inspect {
        #[arg(value_name = "WAL")]
        wal_path: PathBuf,
    },

    #[command(about = "Replay a log and drop files of unfinished transactions")]
    Recover(RecoverCmd),
}

#[derive(Args, Debug)]
struct RecoverCmd {
    #[arg(value_name = "WAL")]
    wal_path: PathBuf,

    #[arg(long, value_name = "DIR", help = "Data directory laid out as <spc>/<db>/<rel>")]
    data_dir: PathBuf,

    #[arg(long, value_name = "XID", help = "Oldest transaction id with a known status")]
    oldest_xid: Option<u32>,

    #[arg(
        long,
        value_name = "XID",
        num_args = 1..,
        help = "Transaction ids known to have committed"
    )]
    committed: Vec<u32>,

    #[arg(
        long,
        value_name = "XID",
        num_args = 1..,
        help = "Transaction ids known to have aborted"
    )]
    aborted: Vec<u32>,

    #[arg(long, value_name = "FILE", help = "TOML configuration file")]
    config: Option<PathBuf>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    init_tracing(&cli.log);

    match cli.command {
        Command::Inspect { wal_path } => {
            let report = inspect(&wal_path)?;
            emit(&cli.format, &report, || print_inspect_text(&report))?;
        }
        Command::Recover(cmd) => {
            let opts = build_recover_options(cmd.data_dir.clone(), &cmd)?;
            let report = recover_data_dir(&cmd.wal_path, &opts)?;
            emit(&cli.format, &report, || print_recover_text(&report))?;
            if !report.finalize.failures.is_empty() {
                std::process::exit(2);
            }
        }
    }

    Ok(())
}

fn init_tracing(directive: &str) {
    let filter = EnvFilter::try_new(directive).unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn build_recover_options(
    data_dir: PathBuf,
    cmd: &RecoverCmd,
) -> Result<RecoverOptions, Box<dyn Error>> {
    let mut opts = RecoverOptions::new(data_dir);
    if let Some(path) = &cmd.config {
        opts.config = PendelConfig::from_path(path)?;
    }
    if let Some(oldest) = cmd.oldest_xid {
        opts.oldest_xid = Xid(oldest);
    }
    opts.committed = cmd.committed.iter().copied().map(Xid).collect();
    opts.aborted = cmd.aborted.iter().copied().map(Xid).collect();
    Ok(opts)
}

fn emit<T, F>(format: &OutputFormat, value: &T, printer: F) -> Result<(), Box<dyn Error>>
where
    T: serde::Serialize,
    F: Fn(),
{
    match format {
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{json}");
        }
        OutputFormat::Text => printer(),
    }
    Ok(())
}

fn print_inspect_text(report: &InspectReport) {
    println!(
        "Log {} (size={} salt={} start_lsn={})",
        report.path, report.size_bytes, report.wal_salt, report.start_lsn
    );
    for record in &report.records {
        match &record.detail {
            RecordDetail::PendingDelete { entries } => {
                println!("  lsn={} {} entries={}", record.lsn, record.kind, entries.len());
                for entry in entries {
                    println!("    xid={} rel={}", entry.xid, entry.relnode);
                }
            }
            RecordDetail::Xact { xid, sub_xids } => {
                let subs: Vec<String> = sub_xids.iter().map(ToString::to_string).collect();
                println!(
                    "  lsn={} {} xid={} subxacts=[{}]",
                    record.lsn,
                    record.kind,
                    xid,
                    subs.join(",")
                );
            }
            RecordDetail::Checkpoint => println!("  lsn={} {}", record.lsn, record.kind),
            RecordDetail::Undecodable { error } => {
                println!("  lsn={} {} undecodable: {error}", record.lsn, record.kind)
            }
        }
    }
    if report.trailing_bytes > 0 {
        println!(
            "Trailing bytes past last intact record: {} (valid_up_to={})",
            report.trailing_bytes, report.valid_up_to
        );
    }
}

fn print_recover_text(report: &RecoveryReport) {
    let replay = &report.replay;
    println!(
        "Replayed {} records (snapshots={} commits={} aborts={} checkpoints={})",
        replay.records, replay.snapshots, replay.commits, replay.aborts, replay.checkpoints
    );
    println!(
        "  admitted={} skipped_horizon={} skipped_status={} pruned={} undecodable={}",
        replay.entries_admitted,
        replay.skipped_horizon,
        replay.skipped_status,
        replay.pruned,
        replay.undecodable
    );
    let finalize = &report.finalize;
    let dropped: Vec<String> = finalize.dropped_xids.iter().map(ToString::to_string).collect();
    println!(
        "Dropped {} files for xids [{}] (duplicates collapsed={})",
        finalize.files_dropped,
        dropped.join(","),
        finalize.duplicates_collapsed
    );
    for skipped in &finalize.skipped_status {
        println!("  kept xid={} status={}", skipped.xid, skipped.status);
    }
    for xid in &finalize.skipped_horizon {
        println!("  kept xid={xid} (before horizon)");
    }
    for failure in &finalize.failures {
        println!(
            "  failed xid={} handles={}: {}",
            failure.xid, failure.handles, failure.error
        );
    }
}
