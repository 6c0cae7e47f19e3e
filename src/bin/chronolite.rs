#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::process::ExitCode;

use chrono::{TimeZone, Utc};
use clap::{Parser, Subcommand};
use chronolite::ctl;
use chronolite::engine::Engine;

#[derive(Debug, Parser)]
#[command(name = "chronolite", about = "Tiered time-series storage engine control tool")]
struct Cli {
    /// Storage directory of the database.
    #[arg(short, long, default_value = "./chronolite_db")]
    path: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create an empty database.
    Create,
    /// Print the settings file.
    Settings,
    /// Change one setting, e.g. `set strategy COMPRESSED`.
    Set { key: String, value: String },
    /// Compact pages: all of them, or only those inside [from, to).
    Compact {
        #[arg(long)]
        from: Option<u64>,
        #[arg(long)]
        to: Option<u64>,
    },
    /// Print storage info: time range, tier sizes, manifest version.
    Info,
    /// Print the on-disk format version.
    Version,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> Result<(), Box<dyn std::error::Error>> {
    match &cli.command {
        Command::Create => {
            ctl::create_db(&cli.path)?;
            println!("created {}", cli.path.display());
        }
        Command::Settings => {
            println!("{}", ctl::print_settings(&cli.path)?);
        }
        Command::Set { key, value } => {
            ctl::set_setting(&cli.path, key, value)?;
            println!("{key} = {value}");
        }
        Command::Compact { from, to } => {
            let removed = match (from, to) {
                (Some(from), Some(to)) => ctl::compact_range(&cli.path, *from, *to)?,
                (None, None) => ctl::compact_all(&cli.path)?,
                _ => return Err("compact needs both --from and --to, or neither".into()),
            };
            println!("compacted {removed} pages");
        }
        Command::Info => {
            let engine = Engine::open(&cli.path)?;
            let sizes = engine.queue_sizes();
            println!("strategy: {}", engine.strategy());
            println!("manifest version: {}", engine.manifest_version());
            println!(
                "files: {} wal, {} pages, {} memory chunks",
                sizes.wal_count, sizes.pages_count, sizes.memory_chunks
            );
            match (engine.min_time(), engine.max_time()) {
                (Some(min), Some(max)) => {
                    println!("time range: {} .. {} ({} .. {})", min, max, as_utc(min), as_utc(max));
                }
                _ => println!("time range: empty"),
            }
            engine.stop()?;
        }
        Command::Version => {
            println!("format version {}", ctl::format_version());
        }
    }
    Ok(())
}

/// Best-effort human rendering, assuming millisecond timestamps.
fn as_utc(t: u64) -> String {
    i64::try_from(t)
        .ok()
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .map_or_else(|| "?".into(), |dt| dt.to_rfc3339())
}
