//! flowlog - inspect the log directory of a flowraft partition.

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::{Level, debug};
use tracing_subscriber::FmtSubscriber;

use flowraft::entry::RaftEntry;
use flowraft::record::decode_records;
use flowraft::storage::{SegmentStore, SegmentStoreOptions};

#[derive(Parser, Debug)]
#[command(name = "flowlog")]
#[command(about = "Inspect the log of a flowraft partition")]
struct Args {
    /// Log level
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print index, term and kind of each entry
    Inspect {
        #[arg(short, long)]
        dir: PathBuf,
        /// First index to print; defaults to the first retained entry
        #[arg(long)]
        from: Option<u64>,
        #[arg(long, default_value = "100")]
        limit: u64,
    },
    /// Print the application entry holding a record position
    Find {
        #[arg(short, long)]
        dir: PathBuf,
        #[arg(short, long)]
        position: u64,
    },
}

fn open_store(dir: PathBuf) -> Result<SegmentStore> {
    if !dir.is_dir() {
        bail!("{:?} is not a log directory", dir);
    }
    let options = SegmentStoreOptions {
        sync_on_write: false,
        ..SegmentStoreOptions::with_dir(&dir)
    };
    SegmentStore::open(options).with_context(|| format!("failed to open log in {:?}", dir))
}

fn describe(entry: &RaftEntry) -> String {
    match entry {
        RaftEntry::OpenSession(e) => {
            format!("member={} max_timeout={}", e.member_id, e.max_timeout)
        }
        RaftEntry::CloseSession(e) => format!(
            "session={} expired={} delete={}",
            e.session_id, e.expired, e.delete
        ),
        RaftEntry::KeepAlive(e) => format!("sessions={:?}", e.session_ids),
        RaftEntry::Command(e) | RaftEntry::Query(e) => format!(
            "session={} sequence={} bytes={}",
            e.session_id,
            e.sequence,
            e.operation.len()
        ),
        RaftEntry::Application(e) => {
            format!("positions={}..={}", e.lowest_position, e.highest_position)
        }
        RaftEntry::Configuration(e) => format!("members={}", e.members.len()),
        RaftEntry::Initial(_) | RaftEntry::Initialize(_) => String::new(),
    }
}

fn inspect(dir: PathBuf, from: Option<u64>, limit: u64) -> Result<()> {
    let store = open_store(dir)?;
    let first = store.first_index();
    let last = store.last_index();
    if last < first {
        println!("log is empty");
        return Ok(());
    }
    let low = from.unwrap_or(first).max(first);
    let high = low.saturating_add(limit.saturating_sub(1)).min(last);
    debug!("Reading entries {}..={}", low, high);
    println!("{:>10} {:>6}  {:<14} detail", "index", "term", "kind");
    for entry in store.read_range(low, high)? {
        println!(
            "{:>10} {:>6}  {:<14} {}",
            entry.index,
            entry.term(),
            format!("{:?}", entry.entry.kind()),
            describe(&entry.entry)
        );
    }
    Ok(())
}

fn find(dir: PathBuf, position: u64) -> Result<()> {
    let store = open_store(dir)?;
    let Some(entry) = store.find_application_entry_containing(position)? else {
        bail!("no application entry holds position {}", position);
    };
    let Some(application) = entry.entry.as_application() else {
        bail!("entry {} is not an application entry", entry.index);
    };
    println!(
        "index={} term={} positions={}..={}",
        entry.index, application.term, application.lowest_position, application.highest_position
    );
    let records = decode_records(&application.data)
        .with_context(|| format!("failed to decode records of entry {}", entry.index))?;
    for record in records {
        let marker = if record.position == position { '*' } else { ' ' };
        println!(
            "{} {:>10} {:?} {:?} key={:?}",
            marker,
            record.position,
            record.value_type(),
            record.intent,
            record.key
        );
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();

    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "error" => Level::ERROR,
        _ => Level::WARN,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match args.command {
        Command::Inspect { dir, from, limit } => inspect(dir, from, limit),
        Command::Find { dir, position } => find(dir, position),
    }
}
