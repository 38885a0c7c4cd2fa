//! tape-iosched fixture CLI.
//!
//! Drives the scheduler against the in-memory fake `TapeDevice`/`FrontEnd`
//! pair for local experimentation -- there is no real tape hardware to
//! point this at outside the host system this crate is embedded in.

use std::sync::Arc;

use clap::Parser;

use tape_iosched::config::SchedulerConfig;
use tape_iosched::interfaces::{FakeFrontEnd, FakeTapeDevice};
use tape_iosched::vtable::SchedulerVtable;

/// Exercise the tape I/O scheduler against an in-memory fixture.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Path of the fixture file to write through the scheduler.
    #[arg(long, default_value = "/fixture/demo")]
    path: String,

    /// Number of bytes to write, filled with a repeating pattern.
    #[arg(long, default_value_t = 1 << 16)]
    bytes: usize,

    /// Cache block size in bytes.
    #[arg(long, default_value_t = 64 * 1024)]
    cache_block_size: usize,

    /// Pool low-water mark, in cache blocks.
    #[arg(long, default_value_t = 4)]
    pool_low_water: usize,

    /// Pool high-water mark, in cache blocks.
    #[arg(long, default_value_t = 32)]
    pool_high_water: usize,
}

fn main() -> anyhow::Result<()> {
    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    let cli = Cli::parse();

    log::info!("tape-iosched fixture starting");
    log::info!("  path: {}", cli.path);
    log::info!("  bytes: {}", cli.bytes);

    let config = SchedulerConfig {
        cache_block_size: cli.cache_block_size,
        pool_low_water: cli.pool_low_water,
        pool_high_water: cli.pool_high_water,
        ..SchedulerConfig::default()
    };
    config.validate()?;

    let device = Arc::new(FakeTapeDevice::new(cli.cache_block_size, 1 << 20));
    let frontend = Arc::new(FakeFrontEnd::new("ip_eligible"));
    let vtable = SchedulerVtable::init(device, frontend, config)?;

    let handle = vtable.open(&cli.path)?;
    let data: Vec<u8> = (0..cli.bytes).map(|i| (i % 256) as u8).collect();
    vtable.write(handle, 0, &data)?;
    vtable.flush(Some(handle), false)?;

    let size = vtable.get_filesize(handle)?;
    log::info!("flushed {} bytes, reported size {}", data.len(), size);

    vtable.close(handle, true)?;
    vtable.destroy();

    log::info!("tape-iosched fixture finished");
    Ok(())
}
