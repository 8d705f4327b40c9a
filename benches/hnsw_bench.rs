use criterion::{BatchSize, Criterion, black_box, criterion_group, criterion_main};
use hnsw_core::{Config, Index, Metric};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const DIM: usize = 128;
const N: usize = 10_000;

fn random_vector(rng: &mut StdRng) -> Vec<f32> {
    (0..DIM).map(|_| rng.r#gen::<f32>()).collect()
}

fn random_vectors(n: usize, seed: u64) -> Vec<Vec<f32>> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n).map(|_| random_vector(&mut rng)).collect()
}

fn build_index(metric: Metric, vectors: &[Vec<f32>], seed: u32) -> Index {
    let config = Config::new(DIM).with_metric(metric).with_seed(seed);
    let mut index = Index::new(config);
    for (i, vector) in vectors.iter().enumerate() {
        index.insert(format!("id-{i}"), vector).unwrap();
    }
    index
}

fn bench_insert_sift10k(c: &mut Criterion) {
    let vectors = random_vectors(N, 1);

    c.bench_function("hnsw_insert_sift10k", |b| {
        b.iter(|| {
            let mut index = Index::new(Config::new(DIM).with_metric(Metric::Euclidean));
            for (i, vector) in vectors.iter().enumerate() {
                index.insert(format!("id-{i}"), black_box(vector)).unwrap();
            }
        })
    });
}

fn bench_incremental_insert(c: &mut Criterion) {
    let vectors = random_vectors(N, 2);
    let query = random_vector(&mut StdRng::seed_from_u64(3));

    c.bench_function("hnsw_incremental_insert", |b| {
        b.iter_batched(
            || build_index(Metric::Euclidean, &vectors, 2),
            |mut index| {
                index
                    .insert("query", black_box(&query))
                    .unwrap();
            },
            BatchSize::SmallInput,
        )
    });
}

fn bench_search_layer(c: &mut Criterion) {
    let vectors = random_vectors(N, 4);
    let mut index = build_index(Metric::Euclidean, &vectors, 4);
    let query = random_vector(&mut StdRng::seed_from_u64(5));

    c.bench_function("hnsw_search_k10", |b| {
        b.iter(|| {
            index
                .search(black_box(&query), 10, Some(32), None)
                .unwrap();
        })
    });
}

fn bench_search_by_metric(c: &mut Criterion) {
    let mut group = c.benchmark_group("search_by_metric");
    for &metric in &[Metric::Euclidean, Metric::Cosine, Metric::InnerProduct] {
        let vectors = random_vectors(N, 6);
        let mut index = build_index(metric, &vectors, 6);
        let query = random_vector(&mut StdRng::seed_from_u64(7));

        group.bench_function(format!("{metric:?}/ef100/k10"), |b| {
            b.iter(|| {
                index
                    .search(black_box(&query), 10, Some(100), None)
                    .unwrap()
            })
        });
    }
    group.finish();
}

fn bench_search_filtered(c: &mut Criterion) {
    let vectors = random_vectors(N, 8);
    let mut index = build_index(Metric::Cosine, &vectors, 8);
    let query = random_vector(&mut StdRng::seed_from_u64(9));

    c.bench_function("hnsw_search_filtered_half", |b| {
        b.iter(|| {
            let filter = |ext_id: &str| ext_id.ends_with(['0', '2', '4', '6', '8']);
            index
                .search(black_box(&query), 10, Some(100), Some(&filter))
                .unwrap()
        })
    });
}

fn bench_compact_with_deletes(c: &mut Criterion) {
    let vectors = random_vectors(N, 10);

    c.bench_function("hnsw_compact_half_deleted", |b| {
        b.iter_batched(
            || {
                let mut index = build_index(Metric::Euclidean, &vectors, 10);
                for i in (0..N).step_by(2) {
                    index.delete(&format!("id-{i}"));
                }
                index
            },
            |index| black_box(index.compact()),
            BatchSize::LargeInput,
        )
    });
}

criterion_group!(
    benches,
    bench_insert_sift10k,
    bench_incremental_insert,
    bench_search_layer,
    bench_search_by_metric,
    bench_search_filtered,
    bench_compact_with_deletes
);

criterion_main!(benches);
