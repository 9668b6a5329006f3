//! Allocator fast-path benchmarks.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use netmap_mem::adapter::{Adapter, AdapterConfig};
use netmap_mem::mem::{GlobalMem, MemAllocator, MemRegistry, PrivateSpec};
use std::sync::Arc;

fn finalized_private(registry: &MemRegistry, descs: u32) -> (Arc<GlobalMem>, Arc<Adapter>) {
    let mem = registry
        .create_private(&PrivateSpec {
            tx_rings: 1,
            tx_descs: descs,
            rx_rings: 1,
            rx_descs: descs,
            extra_bufs: 0,
            n_pipes: 0,
        })
        .unwrap();
    let na = Adapter::new(AdapterConfig {
        name: "bench0".into(),
        mem: mem.clone(),
        num_tx_rings: 1,
        num_rx_rings: 1,
        num_tx_desc: descs,
        num_rx_desc: descs,
        flags: 0,
        device: None,
    });
    mem.finalize(&na).unwrap();
    (mem, na)
}

fn bench_buf_alloc_free(c: &mut Criterion) {
    let mut group = c.benchmark_group("buf_alloc_free");
    let registry = MemRegistry::new();

    for descs in [64u32, 256, 1024] {
        let (mem, _na) = finalized_private(&registry, descs);
        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::from_parameter(descs), &mem, |b, mem| {
            b.iter(|| {
                let idx = mem.alloc_buf().unwrap();
                mem.free_buf(idx).unwrap();
            });
        });
    }

    group.finish();
}

fn bench_extra_alloc_burst(c: &mut Criterion) {
    let mut group = c.benchmark_group("extra_alloc_burst");
    let registry = MemRegistry::new();
    let (mem, _na) = finalized_private(&registry, 1024);

    group.throughput(Throughput::Elements(64));
    group.bench_function("64_buffers", |b| {
        b.iter(|| {
            let (head, got) = mem.extra_alloc(64);
            assert_eq!(got, 64);
            mem.extra_free(head);
        });
    });

    group.finish();
}

fn bench_offset_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("ofstophys");
    let registry = MemRegistry::new();
    let (mem, _na) = finalized_private(&registry, 1024);
    let info = mem.get_info().unwrap();
    let off = (info.size - 1) as u64;

    group.bench_function("last_byte", |b| {
        b.iter(|| mem.ofstophys(off).unwrap());
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_buf_alloc_free,
    bench_extra_alloc_burst,
    bench_offset_lookup
);
criterion_main!(benches);
