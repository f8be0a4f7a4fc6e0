//! Host vs PIM tower arithmetic on double-CRT polynomials.
//!
//! The PIM variants are split the same way the manager exposes its steps:
//! execution alone, execution with both transfers, and each transfer alone.
//! Every configuration uses the whole pool, `towers * split == UNITS`.
use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use pim_dcrt::{DcrtParams, DcrtPoly, Format, KernelBinary, PimConfig, PimManager};
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;

const RING_DIMENSION: usize = 4096;
const UNITS: usize = 16;
const TOWER_ARGS: [usize; 5] = [1, 2, 4, 8, 16];

fn polys(towers: usize) -> (DcrtPoly, DcrtPoly) {
    let params = Arc::new(DcrtParams::generate(RING_DIMENSION, towers, 58).expect("parameters"));
    let mut rng = ChaCha20Rng::seed_from_u64(towers as u64);
    (
        DcrtPoly::random(&params, Format::Evaluation, &mut rng),
        DcrtPoly::random(&params, Format::Evaluation, &mut rng),
    )
}

fn manager() -> PimManager {
    PimManager::new(PimConfig::default().with_units(UNITS)).expect("unit allocation")
}

fn bench_host(c: &mut Criterion) {
    let mut group = c.benchmark_group("dcrt_host");
    for towers in TOWER_ARGS {
        let (a, b) = polys(towers);
        group.bench_with_input(BenchmarkId::new("add", towers), &towers, |bench, _| {
            let mut acc = a.clone();
            bench.iter(|| acc += black_box(&b));
        });
        group.bench_with_input(BenchmarkId::new("mul", towers), &towers, |bench, _| {
            let mut acc = a.clone();
            bench.iter(|| acc *= black_box(&b));
        });
    }
    group.finish();
}

fn bench_pim(c: &mut Criterion) {
    let mut pim = manager();
    let mut group = c.benchmark_group("dcrt_pim");
    for towers in TOWER_ARGS {
        let split = UNITS / towers;
        let (a, b) = polys(towers);
        let batch = pim.prepare_towers(a.towers(), b.towers(), split).expect("staging");

        for (name, kernel) in [("add", KernelBinary::DcrtAdd), ("mul", KernelBinary::DcrtMul)] {
            pim.load_kernel(kernel).expect("load");
            pim.copy_batch_to_units(&batch).expect("copy in");
            group.bench_with_input(BenchmarkId::new(format!("{}_wo_copy", name), towers), &towers, |bench, _| {
                bench.iter(|| pim.execute().expect("execute"));
            });
            group.bench_with_input(BenchmarkId::new(format!("{}_w_copy", name), towers), &towers, |bench, _| {
                bench.iter(|| {
                    pim.copy_batch_to_units(black_box(&batch)).expect("copy in");
                    pim.execute().expect("execute");
                    pim.copy_results_from_units(&batch).expect("copy out")
                });
            });
        }

        group.bench_with_input(BenchmarkId::new("copy_to_units", towers), &towers, |bench, _| {
            bench.iter(|| pim.copy_batch_to_units(black_box(&batch)).expect("copy in"));
        });
        let results = pim.copy_results_from_units(&batch).expect("copy out");
        let mut out = a.clone();
        group.bench_with_input(BenchmarkId::new("fill_poly", towers), &towers, |bench, _| {
            bench.iter(|| pim.fill_poly(&mut out, black_box(&results)).expect("fill"));
        });
    }
    group.finish();
}

criterion_group!(benches, bench_host, bench_pim);
criterion_main!(benches);
