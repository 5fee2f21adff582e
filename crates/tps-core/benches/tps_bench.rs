//! Access gate benchmarks.

use std::sync::Arc;

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use tps_core::{CooperativeRuntime, NullObserver, TPS_SIZE, Tid, TpsDomain};

fn exclusive_domain() -> TpsDomain {
    let domain = TpsDomain::builder()
        .runtime(CooperativeRuntime::new(Tid(1)))
        .observer(NullObserver)
        .build();
    if let Err(err) = domain.create() {
        panic!("create failed: {err}");
    }
    domain
}

fn bench_exclusive_access(c: &mut Criterion) {
    let sizes: &[usize] = &[1, 64, 512, TPS_SIZE];
    let domain = exclusive_domain();
    let mut group = c.benchmark_group("exclusive_access");

    for &size in sizes {
        let data = vec![0x5A_u8; size];
        group.bench_with_input(BenchmarkId::new("write", size), &size, |b, &len| {
            b.iter(|| domain.write(0, len, criterion::black_box(&data)));
        });

        let mut out = vec![0_u8; size];
        group.bench_with_input(BenchmarkId::new("read", size), &size, |b, &len| {
            b.iter(|| {
                let res = domain.read(0, len, &mut out);
                criterion::black_box(&out);
                res
            });
        });
    }
    group.finish();
}

fn bench_cow_fork(c: &mut Criterion) {
    let mut group = c.benchmark_group("cow_fork");

    group.bench_function("clone_write_destroy", |b| {
        let rt = Arc::new(CooperativeRuntime::new(Tid(1)));
        let domain = TpsDomain::builder()
            .runtime(Arc::clone(&rt))
            .observer(NullObserver)
            .build();
        if let Err(err) = domain.create() {
            panic!("create failed: {err}");
        }
        rt.switch_to(Tid(2));

        b.iter(|| {
            let forked = domain
                .clone_from_thread(Tid(1))
                .and_then(|()| domain.write(0, 1, b"x"))
                .and_then(|()| domain.destroy());
            criterion::black_box(forked)
        });
    });

    group.finish();
}

criterion_group!(benches, bench_exclusive_access, bench_cow_fork);
criterion_main!(benches);
