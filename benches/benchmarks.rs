//! Performance benchmarks for fanout.
//!
//! This module contains benchmarks for:
//! - Fan-out of one command across many simulated targets
//! - Throughput of the merged result stream
//! - Target parsing
//!
//! Run with: `cargo bench`

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use fanout::core::{CommandDefinition, InvokeCommand, Target};
use fanout::transport::{HostScript, ScriptStep, SimulatedTransport};

// ============================================================================
// Fixtures
// ============================================================================

mod fixtures {
    use super::*;

    pub fn targets(count: usize) -> Vec<Target> {
        (0..count).map(|i| Target::computer(format!("node{i:04}"))).collect()
    }

    pub fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_multi_thread().enable_all().build().unwrap()
    }
}

// ============================================================================
// Fan-out Benchmarks
// ============================================================================

fn bench_fan_out(c: &mut Criterion) {
    let rt = fixtures::runtime();
    let transport = SimulatedTransport::new().with_default(HostScript::new().step(ScriptStep::EchoCommand));
    let command = CommandDefinition::script("hostname");

    let mut group = c.benchmark_group("fan_out");
    for count in [10, 100, 500] {
        group.throughput(Throughput::Elements(count as u64));
        for limit in [8, 32] {
            group.bench_with_input(BenchmarkId::new(format!("limit_{limit}"), count), &count, |b, &count| {
                let invoke = InvokeCommand::new().throttle_limit(limit);
                b.iter(|| {
                    rt.block_on(async {
                        let job = invoke
                            .start(Arc::new(transport.clone()), fixtures::targets(count), &command, Vec::new())
                            .unwrap();
                        black_box(job.wait_and_collect().await.unwrap())
                    })
                });
            });
        }
    }
    group.finish();
}

fn bench_result_stream(c: &mut Criterion) {
    let rt = fixtures::runtime();
    let command = CommandDefinition::script("report");

    let mut group = c.benchmark_group("result_stream");
    for records in [100u64, 1_000, 10_000] {
        let transport = SimulatedTransport::new().with_default(HostScript::new().step(ScriptStep::EmitSequence(records)));
        group.throughput(Throughput::Elements(records * 4));
        group.bench_with_input(BenchmarkId::from_parameter(records), &records, |b, _| {
            let invoke = InvokeCommand::new();
            b.iter(|| {
                rt.block_on(async {
                    let job =
                        invoke.start(Arc::new(transport.clone()), fixtures::targets(4), &command, Vec::new()).unwrap();
                    black_box(job.wait_and_collect().await.unwrap())
                })
            });
        });
    }
    group.finish();
}

// ============================================================================
// Parsing Benchmarks
// ============================================================================

fn bench_target_parse(c: &mut Criterion) {
    let specs = ["web01", "ssh://deploy@web02.example.com:2222", "vm:build-agent", "container:4f2a9c", "local"];

    c.bench_function("target_parse", |b| {
        b.iter(|| {
            for spec in &specs {
                black_box(Target::parse(black_box(spec)));
            }
        });
    });
}

criterion_group!(benches, bench_fan_out, bench_result_stream, bench_target_parse);
criterion_main!(benches);
