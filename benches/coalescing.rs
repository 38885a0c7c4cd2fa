//! Throughput comparison: uncoalesced FCFS writes versus the
//! write-coalescing scheduler, over a run of small sequential writes that
//! never fill a whole cache block on their own.

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use tape_iosched::config::SchedulerConfig;
use tape_iosched::fcfs::FcfsScheduler;
use tape_iosched::interfaces::{FakeFrontEnd, FakeTapeDevice};
use tape_iosched::scheduler::SchedulerCore;

const CACHE_BLOCK_SIZE: usize = 4096;
const CHUNK: usize = 256;
const CHUNKS: usize = 64;

fn fcfs_writes(c: &mut Criterion) {
    c.bench_function("fcfs_small_sequential_writes", |b| {
        b.iter(|| {
            let device = Arc::new(FakeTapeDevice::new(CACHE_BLOCK_SIZE, 0));
            let frontend = Arc::new(FakeFrontEnd::new("ip_eligible"));
            let scheduler = FcfsScheduler::new(Arc::clone(&device), Arc::clone(&frontend));
            let id = scheduler.open("/bench").unwrap();
            let data = vec![0xABu8; CHUNK];
            for i in 0..CHUNKS {
                scheduler.write(id, (i * CHUNK) as u64, black_box(&data)).unwrap();
            }
        });
    });
}

fn coalescing_writes(c: &mut Criterion) {
    c.bench_function("coalescing_small_sequential_writes", |b| {
        b.iter(|| {
            let device = Arc::new(FakeTapeDevice::new(CACHE_BLOCK_SIZE, 0));
            let frontend = Arc::new(FakeFrontEnd::new("ip_eligible"));
            let mut config = SchedulerConfig::default();
            config.cache_block_size = CACHE_BLOCK_SIZE;
            config.pool_low_water = 4;
            config.pool_high_water = 32;
            let core = SchedulerCore::new(device, frontend, config).unwrap();
            let id = core.open("/bench").unwrap();
            let data = vec![0xABu8; CHUNK];
            for i in 0..CHUNKS {
                core.write(id, (i * CHUNK) as u64, black_box(&data)).unwrap();
            }
            core.flush(id).unwrap();
            core.shutdown();
        });
    });
}

criterion_group!(benches, fcfs_writes, coalescing_writes);
criterion_main!(benches);
