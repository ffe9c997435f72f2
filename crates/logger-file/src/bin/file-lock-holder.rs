//! Holds a byte-range lock on a file for a while
//!
//! Used to contend with a `FileLog` from another process. Prints
//! `ACQUIRED[position, size]` once the lock is held and
//! `RELEASED[position, size]` after letting it go.

use clap::Parser;
use spool_logger_file::{FILE_LOCK_POS_LOG, FILE_LOCK_SIZE, LockFile, SystemPlatform};
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

#[derive(Parser, Debug)]
#[command(author, version, about = "Holds a byte-range file lock", long_about = None)]
struct Args {
    /// Lock file to open (created if missing)
    path: PathBuf,

    /// How long to hold the lock, in milliseconds
    hold_ms: u64,

    /// Start of the locked range
    #[arg(default_value_t = FILE_LOCK_POS_LOG)]
    position: u64,

    /// Length of the locked range
    #[arg(default_value_t = FILE_LOCK_SIZE)]
    size: u64,

    /// How long to wait for the lock, in milliseconds
    #[arg(long, default_value_t = 10_000)]
    timeout_ms: u64,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(tracing::Level::WARN)
        .init();

    let lock_file = LockFile::open(&SystemPlatform, &args.path)?;
    let lock = lock_file
        .lock(args.position, args.size, Duration::from_millis(args.timeout_ms))
        .await?;

    let mut stdout = std::io::stdout();
    writeln!(stdout, "ACQUIRED[{}, {}]", lock.position(), lock.size())?;
    stdout.flush()?;

    tokio::time::sleep(Duration::from_millis(args.hold_ms)).await;
    lock.release()?;
    debug!(path = %args.path.display(), "lock released");

    writeln!(stdout, "RELEASED[{}, {}]", args.position, args.size)?;
    stdout.flush()?;

    lock_file.close();
    Ok(())
}
