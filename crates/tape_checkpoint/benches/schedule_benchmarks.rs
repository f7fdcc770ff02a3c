//! Criterion benchmarks for the binomial schedule.
//!
//! Measures the memoised replay-count table and a full dry run of the
//! schedule for representative tape lengths.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use tape_checkpoint::schedule::{extra_steps, simulate, BinomialSchedule, ExtraTable};

fn bench_extra_closed_form(c: &mut Criterion) {
    c.bench_function("extra_steps_closed_form", |b| {
        b.iter(|| {
            let mut total = 0u64;
            for n in 1..500 {
                total = total.wrapping_add(extra_steps(black_box(n), 8).unwrap_or(0));
            }
            total
        })
    });
}

fn bench_advance_table(c: &mut Criterion) {
    let mut group = c.benchmark_group("extra_table_advance");
    for &(n, s) in &[(100usize, 4usize), (1_000, 10), (5_000, 20)] {
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("n{}_s{}", n, s)),
            &(n, s),
            |b, &(n, s)| {
                b.iter(|| {
                    let mut table = ExtraTable::new(n, s);
                    black_box(table.advance(n, s))
                })
            },
        );
    }
    group.finish();
}

fn bench_simulate(c: &mut Criterion) {
    let mut group = c.benchmark_group("binomial_simulate");
    group.sample_size(20);
    for &(n, s) in &[(100usize, 5usize), (1_000, 10), (1_000, 50)] {
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("n{}_s{}", n, s)),
            &(n, s),
            |b, &(n, s)| {
                b.iter(|| {
                    let mut schedule = BinomialSchedule::new(n, s, 0).unwrap();
                    black_box(simulate(&mut schedule, n).unwrap().replayed_blocks)
                })
            },
        );
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_extra_closed_form,
    bench_advance_table,
    bench_simulate
);
criterion_main!(benches);
