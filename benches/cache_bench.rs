//! Benchmarks for the offloading policies and paged allocator.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use kv_arc_offload::cache::arc::ArcOffloadingManager;
use kv_arc_offload::cache::backend::SimulatedBackend;
use kv_arc_offload::cache::block::{BlockHash, Medium};
use kv_arc_offload::cache::lru_policy::LruOffloadingManager;
use kv_arc_offload::cache::manager::OffloadingManager;
use kv_arc_offload::config::AllocatorConfig;
use kv_arc_offload::paged::allocator::PagedBlockAllocator;

const CAPACITY: usize = 1024;

/// Looping working set larger than the cache with a hot subset mixed in.
fn workload(rounds: usize) -> Vec<Vec<BlockHash>> {
    (0..rounds)
        .map(|i| {
            let cold = (i % (CAPACITY * 2)) as u128;
            let hot = (i % 64) as u128 + 1_000_000;
            vec![BlockHash::from_raw(hot), BlockHash::from_raw(cold)]
        })
        .collect()
}

fn drive(m: &impl OffloadingManager, requests: &[Vec<BlockHash>]) -> usize {
    let mut hits = 0;
    for hashes in requests {
        let hit = m.lookup(hashes);
        if hit > 0 {
            m.prepare_load(&hashes[..hit]);
            m.touch(&hashes[..hit]);
            m.complete_load(&hashes[..hit]);
        }
        if let Some(out) = m.prepare_store(&hashes[hit..]) {
            m.complete_store(&out.to_store);
        }
        hits += hit;
    }
    hits
}

fn bench_policies(c: &mut Criterion) {
    let requests = workload(8192);
    let mut group = c.benchmark_group("offload_policy");

    group.bench_function(BenchmarkId::new("arc", requests.len()), |b| {
        b.iter(|| {
            let m = ArcOffloadingManager::new(SimulatedBackend::new(Medium::Cpu, CAPACITY, 4096));
            black_box(drive(&m, &requests))
        });
    });
    group.bench_function(BenchmarkId::new("lru", requests.len()), |b| {
        b.iter(|| {
            let m = LruOffloadingManager::new(SimulatedBackend::new(Medium::Cpu, CAPACITY, 4096));
            black_box(drive(&m, &requests))
        });
    });
    group.finish();
}

fn bench_hash_chain(c: &mut Criterion) {
    let tokens: Vec<u32> = (0..4096).collect();
    c.bench_function("hash_chain_4096_tokens", |b| {
        b.iter(|| black_box(BlockHash::chain(black_box(&tokens), 16)));
    });
}

fn bench_paged_alloc_free(c: &mut Criterion) {
    let config = AllocatorConfig {
        num_layers: 32,
        block_size_tokens: 16,
        gpu_blocks: 4096,
        cpu_blocks: 4096,
        block_bytes: 4096,
    };
    let mut allocator = PagedBlockAllocator::new(&config);
    c.bench_function("paged_alloc_free_2048_tokens", |b| {
        b.iter(|| {
            allocator.allocate_for_request("bench", 2048).ok();
            black_box(allocator.free_request("bench").ok())
        });
    });
}

criterion_group!(benches, bench_policies, bench_hash_chain, bench_paged_alloc_free);
criterion_main!(benches);
