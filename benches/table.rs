use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rand::Rng;

use ulark::dict::Dict;
use ulark::thread::Thread;
use ulark::value::Value;

const SIZES: [usize; 3] = [64, 1024, 16384];
const TOTAL_OPERATIONS: u64 = 1000;

fn random_keys(n: usize) -> Vec<Value> {
    let mut rng = rand::thread_rng();
    (0..n)
        .map(|_| Value::Int(rng.gen_range(0, 1_000_000)))
        .collect()
}

fn insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("insert");
    group.throughput(Throughput::Elements(TOTAL_OPERATIONS));

    for &size in SIZES.iter() {
        group.bench_with_input(BenchmarkId::new("unbudgeted", size), &size, |b, &size| {
            let keys = random_keys(size);
            b.iter(|| {
                let dict = Dict::new();
                for k in keys.iter().take(TOTAL_OPERATIONS as usize) {
                    dict.insert(k.clone(), Value::None).unwrap();
                }
            });
        });

        group.bench_with_input(BenchmarkId::new("budgeted", size), &size, |b, &size| {
            let keys = random_keys(size);
            b.iter(|| {
                let thread = Thread::new();
                let dict = Dict::new();
                for k in keys.iter().take(TOTAL_OPERATIONS as usize) {
                    dict.safe_insert(&thread, k.clone(), Value::None).unwrap();
                }
            });
        });
    }
    group.finish();
}

fn lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("lookup");
    group.throughput(Throughput::Elements(TOTAL_OPERATIONS));

    for &size in SIZES.iter() {
        let keys = random_keys(size);
        let dict = Dict::new();
        for k in &keys {
            dict.insert(k.clone(), Value::Int(1)).unwrap();
        }

        group.bench_with_input(BenchmarkId::new("hit", size), &size, |b, _| {
            b.iter(|| {
                for k in keys.iter().take(TOTAL_OPERATIONS as usize) {
                    dict.get(k).unwrap();
                }
            });
        });

        group.bench_with_input(BenchmarkId::new("budgeted hit", size), &size, |b, _| {
            let thread = Thread::new();
            b.iter(|| {
                for k in keys.iter().take(TOTAL_OPERATIONS as usize) {
                    dict.safe_get(&thread, k).unwrap();
                }
            });
        });
    }
    group.finish();
}

criterion_group!(benches, insert, lookup);
criterion_main!(benches);
