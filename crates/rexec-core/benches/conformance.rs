//! Harness benchmarks
//!
//! - Host/device transfers per memory location
//! - conv2d runs for each executor kind, accelerator against host CPU
//! - A full conformance comparison

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rexec_core::compiler::{build, BuildOptions, Computation, ComputationBuilder};
use rexec_core::{Comparator, ConnectionParams, DType, ExecutorKind, HostTensor, Location, Session, TargetDescriptor, Tolerance};

fn conv(size: usize) -> Computation {
    let mut b = ComputationBuilder::new("conv2d");
    let data = b.static_input("data", DType::F32, &[1, size, size, 3]);
    let weight = b.static_input("weight", DType::F32, &[5, 5, 3, 8]);
    let out = b.conv2d(&data, &weight, [1, 1], [2, 2, 2, 2]);
    b.output(&out);
    b.build().unwrap()
}

fn benchmark_transfers(c: &mut Criterion) {
    let mut group = c.benchmark_group("transfer");
    let session = Session::open(ConnectionParams::loopback("v68")).unwrap();

    for elements in [1_024, 65_536, 262_144] {
        let tensor = HostTensor::random(vec![elements], DType::F32, 1);
        group.throughput(Throughput::Bytes(tensor.byte_len() as u64));
        for location in [Location::DeviceDefault, Location::DeviceScratch] {
            group.bench_with_input(BenchmarkId::new(location.to_string(), elements), &tensor, |b, tensor| {
                b.iter(|| {
                    let buffer = session.copy_in_to(tensor, location).unwrap();
                    black_box(session.copy_out(&buffer).unwrap());
                });
            });
        }
    }

    group.finish();
}

fn benchmark_conv2d(c: &mut Criterion) {
    let mut group = c.benchmark_group("conv2d_run");
    group.sample_size(20);
    let sessions = [
        ("accel", Session::open(ConnectionParams::loopback("v68")).unwrap(), TargetDescriptor::accelerator("v68")),
        ("cpu", Session::open(ConnectionParams::loopback_host()).unwrap(), TargetDescriptor::host_cpu()),
    ];

    let computation = conv(64);
    let data = HostTensor::random(vec![1, 64, 64, 3], DType::F32, 2);
    let weight = HostTensor::random(vec![5, 5, 3, 8], DType::F32, 3);

    for (device, session, target) in &sessions {
        let x = session.copy_in(&data).unwrap();
        let w = session.copy_in(&weight).unwrap();
        for kind in [ExecutorKind::Graph, ExecutorKind::Aot, ExecutorKind::Vm] {
            let artifact = build(&computation, target, &BuildOptions::new(kind)).unwrap();
            let mut executor = session.stage(&artifact).unwrap();
            executor.set_positional(&[&x, &w]).unwrap();
            group.bench_function(BenchmarkId::new(*device, kind), |b| {
                b.iter(|| {
                    executor.run().unwrap();
                    black_box(executor.get_output(0).unwrap());
                });
            });
        }
    }

    group.finish();
}

fn benchmark_compare(c: &mut Criterion) {
    let mut group = c.benchmark_group("compare");
    group.sample_size(10);
    let remote = Session::open(ConnectionParams::loopback("v68")).unwrap();
    let reference = Session::open(ConnectionParams::loopback_host()).unwrap();
    let options = BuildOptions::new(ExecutorKind::Graph);

    for size in [16, 64] {
        let computation = conv(size);
        let mut remote_exec = remote
            .stage(&build(&computation, &TargetDescriptor::accelerator("v68"), &options).unwrap())
            .unwrap();
        let mut reference_exec = reference
            .stage(&build(&computation, &TargetDescriptor::host_cpu(), &options).unwrap())
            .unwrap();
        let inputs = [
            HostTensor::random(vec![1, size, size, 3], DType::F32, 4),
            HostTensor::random(vec![5, 5, 3, 8], DType::F32, 5),
        ];
        let comparator = Comparator::new(Tolerance::new(1e-4, 1e-5));
        group.bench_with_input(BenchmarkId::from_parameter(size), &inputs, |b, inputs| {
            b.iter(|| {
                let result = comparator.compare(&mut remote_exec, &mut reference_exec, inputs).unwrap();
                black_box(result.passed());
            });
        });
    }

    group.finish();
}

criterion_group!(benches, benchmark_transfers, benchmark_conv2d, benchmark_compare);
criterion_main!(benches);
