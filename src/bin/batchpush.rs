//! `batchpush` - push a JSON-lines file of records through the batching
//! uploader against the in-process simulated server.

use anyhow::{bail, Context, Result};
use batchpush::logging::{init_logging, LogLevel};
use batchpush::sim::{SimOptions, SimulatedServer};
use batchpush::{StoreDelegate, Timestamp, UploadError, Uploader, UploaderConfig};
use clap::Parser;
use colored::Colorize;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

/// Upload records in batches to a simulated storage server
#[derive(Parser, Debug)]
#[command(name = "batchpush", version, about)]
struct Cli {
    /// JSON-lines file; every line is an object with a string `id`
    input: PathBuf,

    /// TOML file with upload limits
    #[arg(short, long, env = "BATCHPUSH_CONFIG", conflicts_with = "info")]
    config: Option<PathBuf>,

    /// Server info/configuration JSON document with upload limits
    #[arg(long)]
    info: Option<PathBuf>,

    /// Collection endpoint records are posted to
    #[arg(long, default_value = "https://sim.invalid/1.5/user/storage/records")]
    collection: String,

    #[arg(long)]
    max_post_records: Option<usize>,

    #[arg(long)]
    max_post_bytes: Option<usize>,

    #[arg(long)]
    max_total_records: Option<usize>,

    #[arg(long)]
    max_total_bytes: Option<usize>,

    /// Keep sending after a payload fails as a whole
    #[arg(long)]
    keep_going: bool,

    /// Simulate a server without batch support
    #[arg(long)]
    no_server_batching: bool,

    /// Never open batches, even if the server supports them
    #[arg(long)]
    disable_batching: bool,

    /// Make the simulated server reject this record id (repeatable)
    #[arg(long = "reject", value_name = "ID")]
    rejected: Vec<String>,

    /// Increase verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only print errors
    #[arg(short, long)]
    quiet: bool,
}

impl Cli {
    fn upload_config(&self) -> Result<UploaderConfig> {
        let mut config = if let Some(path) = &self.config {
            UploaderConfig::load(path)?
        } else if let Some(path) = &self.info {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            UploaderConfig::from_info_configuration(&raw)?
        } else {
            UploaderConfig::default()
        };

        if let Some(v) = self.max_post_records {
            config.max_post_records = v;
        }
        if let Some(v) = self.max_post_bytes {
            config.max_post_bytes = v;
        }
        if let Some(v) = self.max_total_records {
            config.max_total_records = v;
        }
        if let Some(v) = self.max_total_bytes {
            config.max_total_bytes = v;
        }
        if self.keep_going {
            config.abort_on_payload_failure = false;
        }
        config.validate()?;
        Ok(config)
    }
}

/// Tallies outcomes and keeps failures for the summary.
#[derive(Default)]
struct Tally {
    stored: AtomicU64,
    failures: Mutex<Vec<(String, String)>>,
    completed: Mutex<Option<Option<Timestamp>>>,
}

impl StoreDelegate for Tally {
    fn on_record_store_succeeded(&self, _id: &str) {
        self.stored.fetch_add(1, Ordering::Relaxed);
    }

    fn on_record_store_failed(&self, error: &UploadError, id: &str) {
        warn!(id, %error, "Record not stored");
        if let Ok(mut failures) = self.failures.lock() {
            failures.push((id.to_string(), error.to_string()));
        }
    }

    fn on_store_completed(&self, timestamp: Option<Timestamp>) {
        if let Ok(mut completed) = self.completed.lock() {
            *completed = Some(timestamp);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(LogLevel::from_verbosity(cli.verbose, cli.quiet))?;

    let config = cli.upload_config()?;
    let server = Arc::new(SimulatedServer::new(SimOptions {
        batching: !cli.no_server_batching,
        limits: config.clone(),
        ..Default::default()
    }));
    for id in &cli.rejected {
        server.reject_id(id.clone());
    }

    let tally = Arc::new(Tally::default());
    let mut uploader = Uploader::new(config, &cli.collection, server.clone(), tally.clone())?;
    if cli.disable_batching {
        uploader.set_in_batching_mode(false)?;
    }

    let file = tokio::fs::File::open(&cli.input)
        .await
        .with_context(|| format!("Failed to open {}", cli.input.display()))?;
    let mut lines = BufReader::new(file).lines();
    let mut line_no = 0usize;
    let mut read = 0u64;
    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }
        let record: Value = serde_json::from_str(&line)
            .with_context(|| format!("{}:{}: invalid JSON", cli.input.display(), line_no))?;
        if record.get("id").and_then(Value::as_str).is_none() {
            bail!("{}:{}: record has no string id", cli.input.display(), line_no);
        }
        uploader.process(&record)?;
        read += 1;
    }

    uploader.commit_if_necessary_after_last_payload()?;
    let stats = uploader.finish().await?;
    info!(records = read, "Upload finished");

    if cli.quiet {
        return Ok(());
    }

    println!("{}", "Upload summary:".cyan().bold());
    println!("  Records read:      {}", read);
    println!(
        "  Stored:            {}",
        tally.stored.load(Ordering::Relaxed).to_string().green()
    );
    println!(
        "  Failed:            {}",
        stats.records_failed.to_string().red()
    );
    println!("  Payloads sent:     {}", stats.payloads_sent);
    println!("  Batches committed: {}", stats.batches_committed);
    println!("  Batching:          {:?}", stats.batching_mode);
    match stats.last_modified.and_then(|ts| ts.to_datetime()) {
        Some(when) => println!("  Last modified:     {}", when.to_rfc3339()),
        None => println!("  Last modified:     -"),
    }
    println!("  Visible on server: {}", server.stored_ids().len());

    if let Ok(failures) = tally.failures.lock() {
        if !failures.is_empty() {
            println!();
            println!("{}", "Failures:".red().bold());
            for (id, reason) in failures.iter() {
                println!("  {}: {}", id.yellow(), reason);
            }
        }
    }

    if !stats.finished_cleanly {
        bail!("upload did not finish cleanly");
    }
    Ok(())
}
