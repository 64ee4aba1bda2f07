//! bytequeue - copy stdin to stdout through a spill-to-disk byte queue.
//!
//! Reading stdin never waits for stdout: once the in-memory ring fills, the
//! rest of the stream is parked in chunk files until stdout catches up.

use std::fs;
use std::io::{self, Read};
use std::path::PathBuf;
use std::process;
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use giztoy_bytequeue::{ByteQueue, QueueConfig};
use tracing::debug;
use tracing_subscriber::EnvFilter;

/// Copy stdin to stdout through a spill-to-disk byte queue.
#[derive(Parser)]
#[command(name = "bytequeue")]
#[command(about = "Copy stdin to stdout, spilling to disk when stdout is slow")]
#[command(version)]
struct Args {
    /// Queue config file (JSON); flags below override its fields
    #[arg(short = 'f', long)]
    config: Option<PathBuf>,

    /// Directory for spilled chunks (default: system temp dir)
    #[arg(long)]
    temp_dir: Option<PathBuf>,

    /// Chunk filename prefix (default: bytequeue-<pid>)
    #[arg(long)]
    prefix: Option<String>,

    /// In-memory ring capacity in bytes
    #[arg(long)]
    memory: Option<usize>,

    /// Chunk file size in bytes
    #[arg(long)]
    chunk_size: Option<u64>,

    /// Unread bytes that wake the stdout writer
    #[arg(long)]
    low_water: Option<usize>,

    /// Size of each stdin read
    #[arg(long, default_value_t = 8192)]
    read_size: usize,

    /// Print queue stats to stderr when done
    #[arg(long)]
    stats: bool,

    /// Verbose output
    #[arg(short = 'v', long)]
    verbose: bool,
}

fn main() {
    let args = Args::parse();

    if args.verbose {
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::new("debug"))
            .with_writer(io::stderr)
            .with_target(false)
            .init();
    }

    if let Err(e) = run(&args) {
        eprintln!("bytequeue: {:#}", e);
        process::exit(1);
    }
}

fn load_config(args: &Args) -> Result<QueueConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let data = fs::read_to_string(path)
                .with_context(|| format!("failed to read config {}", path.display()))?;
            serde_json::from_str(&data)
                .with_context(|| format!("failed to parse config {}", path.display()))?
        }
        None => QueueConfig {
            prefix: format!("bytequeue-{}", process::id()),
            ..QueueConfig::default()
        },
    };

    if let Some(dir) = &args.temp_dir {
        config.temp_dir = dir.clone();
    }
    if let Some(prefix) = &args.prefix {
        config.prefix = prefix.clone();
    }
    if let Some(bytes) = args.memory {
        config.memory_capacity = bytes;
    }
    if let Some(bytes) = args.chunk_size {
        config.chunk_size = bytes;
    }
    if let Some(bytes) = args.low_water {
        config.low_water = bytes;
    }
    Ok(config)
}

fn run(args: &Args) -> Result<()> {
    if args.read_size == 0 {
        return Err(anyhow!("--read-size must be greater than 0"));
    }

    let config = load_config(args)?;
    debug!(?config, "starting");
    let queue = ByteQueue::new(config).context("failed to create queue")?;

    let reader = queue.clone();
    let drain = thread::spawn(move || {
        let mut stdout = io::stdout().lock();
        reader.drain(&mut stdout)
    });

    let copied = copy_input(io::stdin().lock(), &queue, args.read_size, &drain);
    let closed = queue.close();
    let drained = drain
        .join()
        .map_err(|_| anyhow!("stdout thread panicked"))?;
    let cleaned = queue.cleanup();

    copied.context("failed to queue stdin")?;
    closed.context("failed to close queue")?;
    drained.context("failed to write stdout")?;
    cleaned.context("failed to remove chunk files")?;

    if args.stats {
        let stats = queue.stats();
        eprintln!(
            "bytequeue: written={} drained={} spilled={} chunks={}",
            stats.bytes_written, stats.bytes_drained, stats.spilled, stats.chunks_created
        );
    }
    Ok(())
}

/// Feeds `input` into the queue until EOF, flushing after each read so short
/// interactive input is not held back by the low-water threshold.
///
/// Stops early once the stdout thread has exited: `drain` only returns
/// before close on failure, and nothing would ever read the rest.
fn copy_input<R: Read, T>(
    mut input: R,
    queue: &ByteQueue,
    read_size: usize,
    reader: &JoinHandle<T>,
) -> Result<()> {
    let mut buf = vec![0u8; read_size];
    loop {
        if reader.is_finished() {
            debug!("stdout writer exited, no longer reading stdin");
            return Ok(());
        }
        let n = match input.read(&mut buf) {
            Ok(0) => return Ok(()),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        queue.write(&buf[..n])?;
        queue.flush()?;
    }
}
