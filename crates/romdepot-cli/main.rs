use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use data_encoding::HEXLOWER_PERMISSIVE;
use serde::Serialize;
use serde_json::json;
use std::io::{self, BufRead};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tracing::Level;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use romdepot_core::config::{self, Config};
use romdepot_core::dat::{Dat, Rom};
use romdepot_core::db::{RomDb, SqliteRomDb};
use romdepot_core::depot::Depot;
use romdepot_core::services::progress::{ProgressSink, WorkEvent, WorkProgress};
use romdepot_core::services::refresh::{self, RefreshOptions};

#[derive(Parser)]
#[command(name = "romdepot")]
#[command(about = "ROM depot - DAT indexing and depot bookkeeping")]
struct Cli {
    /// Emit progress events as JSON instead of interactive text
    #[arg(long, global = true, default_value_t = false)]
    progress_json: bool,

    /// Log level; `RUST_LOG` takes priority when set
    #[arg(long, global = true, default_value_t = Level::INFO)]
    log_level: Level,

    /// Configuration file (default: ~/.romdepot/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Re-index every DAT under the DAT root, orphaning ones that disappeared
    RefreshDats {
        /// DAT directory (overrides the configured dat_root)
        #[arg(long)]
        dats: Option<PathBuf>,

        /// Number of worker threads (default: configured value, else all cores)
        #[arg(long, short = 'w')]
        workers: Option<usize>,

        /// Pending bytes per worker batch before it is flushed
        #[arg(long)]
        max_batch_size: Option<u64>,
    },
    /// Look up DATs by DAT digest or rom hash (sha1, md5 or crc)
    Lookup {
        /// Hex-encoded hashes
        #[arg(required = true)]
        hashes: Vec<String>,

        /// Rom size, required to match by crc
        #[arg(long)]
        size: Option<u64>,
    },
    /// Show rom index statistics
    Dbstats,
    /// Show depot root sizes and bloom filter state
    DepotStats,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_level)?;

    let config_path = match &cli.config {
        Some(path) => path.clone(),
        None => config::default_config_path()?,
    };
    let config = Config::load(&config_path)?;
    let progress_sink = CliProgressSink::new(cli.progress_json);

    match cli.command {
        Commands::RefreshDats {
            dats,
            workers,
            max_batch_size,
        } => {
            let options = RefreshOptions {
                workers: workers.unwrap_or(config.workers).max(1),
                max_batch_size: max_batch_size.unwrap_or(config.max_batch_size),
            };
            let dat_root = dats
                .or_else(|| config.dat_root.clone())
                .ok_or_else(|| {
                    anyhow!(
                        "No DAT directory: pass --dats or set dat_root in {}",
                        config_path.display()
                    )
                })?;
            cmd_refresh_dats(&config, &dat_root, options, progress_sink)
        }
        Commands::Lookup { hashes, size } => cmd_lookup(&config, &hashes, size),
        Commands::Dbstats => cmd_dbstats(&config, cli.progress_json),
        Commands::DepotStats => cmd_depot_stats(&config, cli.progress_json),
    }
}

fn init_tracing(level: Level) -> Result<()> {
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env()
        .context("invalid RUST_LOG")?;
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::Layer::new()
                .with_writer(io::stderr)
                .compact(),
        )
        .try_init()?;
    Ok(())
}

fn open_index(config: &Config) -> Result<SqliteRomDb> {
    SqliteRomDb::open(&config.db_path)
        .with_context(|| format!("Unable to open rom index: {}", config.db_path.display()))
}

fn cmd_refresh_dats(
    config: &Config,
    dat_root: &Path,
    options: RefreshOptions,
    progress_sink: CliProgressSink,
) -> Result<()> {
    let db = open_index(config)?;
    let json_progress = progress_sink.is_json();

    let cancel_flag = Arc::new(AtomicBool::new(false));
    if !json_progress {
        eprintln!(
            "Refreshing DATs in {} with {} workers...",
            dat_root.display(),
            options.workers
        );
        eprintln!("  Press Enter to stop the refresh gracefully...");
        let cancel_clone = cancel_flag.clone();
        thread::spawn(move || {
            let stdin = io::stdin();
            let mut handle = stdin.lock();
            let mut line = String::new();
            let _ = handle.read_line(&mut line);
            cancel_clone.store(true, Ordering::SeqCst);
        });
    }

    let progress = if json_progress {
        let sink: Arc<dyn ProgressSink<WorkEvent>> = Arc::new(progress_sink);
        Arc::new(WorkProgress::with_sink(sink))
    } else {
        Arc::new(WorkProgress::new())
    };

    // Progress display thread
    let done = Arc::new(AtomicBool::new(false));
    let display_handle = (!json_progress).then(|| {
        let progress_display = Arc::clone(&progress);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            while !done.load(Ordering::Relaxed) {
                let discovered = progress_display.discovered.load(Ordering::Relaxed);
                let processed = progress_display.processed.load(Ordering::Relaxed);
                let failed = progress_display.failed.load(Ordering::Relaxed);
                let pct = if discovered > 0 {
                    processed as f64 / discovered as f64 * 100.0
                } else {
                    0.0
                };
                eprint!(
                    "\r\x1b[2K  {} {}/{} DATs, {} failed, {}/s",
                    progress_bar(pct, 30),
                    processed,
                    discovered,
                    failed,
                    format_bytes(progress_display.bytes_per_sec() as u64)
                );
                thread::sleep(Duration::from_millis(250));
            }
            eprint!("\r\x1b[2K");
        })
    });

    let result = refresh::refresh(&db, dat_root, &options, Arc::clone(&progress), &cancel_flag);

    done.store(true, Ordering::Relaxed);
    if let Some(handle) = display_handle {
        let _ = handle.join();
    }

    let summary = progress.summary();
    if !json_progress {
        eprintln!("Refresh {}", summary);
        if summary.cancelled {
            eprintln!("  Cancelled; completed DATs were kept.");
        }
        if let Ok(stats) = db.stats() {
            eprintln!(
                "  Index: {} DATs ({} orphaned), {} games, {} roms",
                stats.dat_count, stats.orphaned_dats, stats.game_count, stats.rom_count
            );
        }
    }

    result.map(|_| ())
}

/// Interpret a hex string by length: 20 bytes is a DAT digest or rom sha1,
/// 16 bytes an md5 and 4 bytes a crc.
fn lookup_rom(bytes: Vec<u8>, size: Option<u64>) -> Result<Rom> {
    let mut rom = Rom::default();
    match bytes.len() {
        20 => rom.sha1 = Some(bytes),
        16 => rom.md5 = Some(bytes),
        4 => {
            rom.size = size.ok_or_else(|| anyhow!("--size is required to look up a crc"))?;
            rom.crc = Some(bytes);
        }
        n => return Err(anyhow!("unsupported hash length: {} bytes", n)),
    }
    Ok(rom)
}

fn cmd_lookup(config: &Config, hashes: &[String], size: Option<u64>) -> Result<()> {
    let db = open_index(config)?;

    for hash in hashes {
        let bytes = HEXLOWER_PERMISSIVE
            .decode(hash.trim().as_bytes())
            .with_context(|| format!("Invalid hex: {}", hash))?;

        println!("{}:", hash);

        if bytes.len() == 20
            && let Some(dat) = db.get_dat(&bytes)?
        {
            println!("  DAT file:");
            print_dat(&dat);
        }

        let dats = db.dats_for_rom(&lookup_rom(bytes, size)?)?;
        if dats.is_empty() {
            println!("  No DATs reference this rom");
        } else {
            println!("  Referenced by {} DAT(s):", dats.len());
            for dat in &dats {
                print_dat(dat);
            }
        }
    }

    Ok(())
}

fn print_dat(dat: &Dat) {
    println!("    {}", dat.name);
    if !dat.description.is_empty() && dat.description != dat.name {
        println!("      {}", dat.description);
    }
    println!(
        "      {} games, {} software, {} roms",
        dat.games.len(),
        dat.software.len(),
        dat.rom_count()
    );
}

fn cmd_dbstats(config: &Config, json_output: bool) -> Result<()> {
    let db = open_index(config)?;
    let stats = db.stats()?;

    if json_output {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    println!("Rom index: {}", db.path().display());
    println!("  DATs:          {}", stats.dat_count);
    println!("  Orphaned DATs: {}", stats.orphaned_dats);
    println!("  Games:         {}", stats.game_count);
    println!("  Roms:          {}", stats.rom_count);
    println!("  Content:       {}", stats.content_count);
    Ok(())
}

fn cmd_depot_stats(config: &Config, json_output: bool) -> Result<()> {
    if config.depot.is_empty() {
        println!("No depot roots configured.");
        return Ok(());
    }

    let depot = Depot::open(&config.depot)?;
    let stats = depot.stats();

    if json_output {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    println!("{:<50} {:>10} {:>10} {:>6}  Bloom", "Root", "Size", "Max", "Used");
    for (root, stats) in depot.roots().iter().zip(&stats) {
        let pct = if stats.max_size > 0 {
            stats.size as f64 / stats.max_size as f64 * 100.0
        } else {
            0.0
        };
        println!(
            "{:<50} {:>10} {:>10} {:>5.1}%  {}{}",
            truncate_string(&stats.path.display().to_string(), 50),
            format_bytes(stats.size.max(0) as u64),
            format_bytes(stats.max_size.max(0) as u64),
            pct,
            if stats.bloom_ready { "ready" } else { "not ready" },
            if root.is_full() { "  FULL" } else { "" }
        );
    }
    Ok(())
}

#[derive(Clone)]
struct CliProgressSink {
    json: bool,
    stderr: Arc<Mutex<()>>,
}

impl CliProgressSink {
    fn new(json: bool) -> Self {
        Self {
            json,
            stderr: Arc::new(Mutex::new(())),
        }
    }

    fn is_json(&self) -> bool {
        self.json
    }

    fn emit_json<T: Serialize>(&self, stream: &str, event: &T) {
        if !self.json {
            return;
        }

        let line = match serde_json::to_string(&json!({ "stream": stream, "event": event })) {
            Ok(line) => line,
            Err(err) => format!("{{\"stream\":\"logger\",\"error\":\"{}\"}}", err),
        };
        let _guard = self.stderr.lock().unwrap_or_else(|e| e.into_inner());
        eprintln!("{}", line);
    }
}

impl ProgressSink<WorkEvent> for CliProgressSink {
    fn emit(&self, event: WorkEvent) {
        self.emit_json("refresh", &event);
    }
}

fn progress_bar(pct: f64, width: usize) -> String {
    let filled = (((pct / 100.0) * width as f64).round() as usize).min(width);
    let empty = width - filled;
    format!("[{}{}]", "█".repeat(filled), "░".repeat(empty))
}

fn truncate_string(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}

/// Format bytes as human-readable string
fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    const TB: u64 = GB * 1024;

    if bytes >= TB {
        format!("{:.1} TB", bytes as f64 / TB as f64)
    } else if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
