// SPDX-License-Identifier: MIT OR Apache-2.0
//! Throughput of the stream pump: bytes through `cat`, in memory and spilled,
//! under both pump policies.

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use cvx_exec::{ByteSource, CommandSpec, ExecOptions, ProcessExecutor, PumpPolicy};
use std::hint::black_box;

// ── Helpers ─────────────────────────────────────────────────────────────

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .expect("tokio runtime")
}

fn run_cat(rt: &tokio::runtime::Runtime, executor: &ProcessExecutor, data: &[u8]) -> u64 {
    let spec = CommandSpec::builder("cat").build().expect("spec");
    rt.block_on(async {
        let producer = executor
            .execute(&spec, Some(ByteSource::from_bytes(data.to_vec())))
            .await
            .expect("cat succeeds");
        let out = producer.collect().await.expect("drain");
        out.len() as u64
    })
}

// ── Benchmarks ──────────────────────────────────────────────────────────

fn bench_cat_in_memory(c: &mut Criterion) {
    let rt = runtime();
    let executor = ProcessExecutor::new(ExecOptions::default());
    let mut group = c.benchmark_group("cat_in_memory");
    for size in [16 * 1024, 1024 * 1024, 4 * 1024 * 1024] {
        let data = payload(size);
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &data, |b, data| {
            b.iter(|| black_box(run_cat(&rt, &executor, data)));
        });
    }
    group.finish();
}

fn bench_cat_spilled(c: &mut Criterion) {
    let rt = runtime();
    let dir = tempfile::tempdir().expect("spill dir");
    let executor = ProcessExecutor::new(ExecOptions {
        spill_threshold: 64 * 1024,
        spill_dir: Some(dir.path().to_path_buf()),
        ..ExecOptions::default()
    });
    let mut group = c.benchmark_group("cat_spilled");
    group.sample_size(20);
    for size in [1024 * 1024, 8 * 1024 * 1024] {
        let data = payload(size);
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &data, |b, data| {
            b.iter(|| black_box(run_cat(&rt, &executor, data)));
        });
    }
    group.finish();
}

fn bench_policies(c: &mut Criterion) {
    let rt = runtime();
    let data = payload(8 * 1024);
    let mut group = c.benchmark_group("policy_small_input");
    group.throughput(Throughput::Bytes(data.len() as u64));
    for policy in [PumpPolicy::ConcurrentCopy, PumpPolicy::DrainWhileWaiting] {
        let executor = ProcessExecutor::new(ExecOptions {
            policy,
            ..ExecOptions::default()
        });
        group.bench_function(format!("{policy:?}"), |b| {
            b.iter(|| black_box(run_cat(&rt, &executor, &data)));
        });
    }
    group.finish();
}

criterion_group!(benches, bench_cat_in_memory, bench_cat_spilled, bench_policies);
criterion_main!(benches);
