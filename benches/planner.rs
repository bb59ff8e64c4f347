//! Benchmark for the distribution planner
//!
//! The planner runs synchronously inside the REST request path, so a plan
//! over a realistic matrix should stay comfortably sub-millisecond.

use cloud_drive_operator::planner::plan_distribution;
use cloud_drive_operator::{StorageDecisionMatrix, StorageDecisionMatrixRow, StorageSpec};
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

fn synthetic_matrix(rows: usize) -> StorageDecisionMatrix {
    let bands: Vec<StorageDecisionMatrixRow> = (0..rows)
        .map(|i| StorageDecisionMatrixRow {
            iops: 500 + (i as u64) * 250,
            min_iops: None,
            max_iops: None,
            min_size: 32 * (1 + i as u64 % 8),
            max_size: 4096,
            drive_type: format!("tier-{}", i % 6),
            instance_min_drives: 1,
            instance_max_drives: 8,
            priority: (i % 3) as u32,
            region: String::new(),
            instance_type: String::new(),
            thin_provisioning: false,
        })
        .collect();
    StorageDecisionMatrix::new(bands).expect("synthetic rows are well-formed")
}

fn bench_plan_distribution(c: &mut Criterion) {
    let mut group = c.benchmark_group("planner");
    group.throughput(Throughput::Elements(1));

    for rows in [8usize, 64, 512] {
        let matrix = synthetic_matrix(rows);
        let spec = StorageSpec {
            iops: 2000,
            min_capacity_gib: 8192,
            max_capacity_gib: 65536,
            drive_type: None,
        };

        group.bench_function(format!("plan_{rows}_rows"), |b| {
            b.iter(|| {
                let plan = plan_distribution(black_box(&matrix), black_box(&spec), 3, 3);
                let _ = black_box(plan);
            });
        });
    }

    group.finish();
}

fn bench_filter_chain(c: &mut Criterion) {
    let mut group = c.benchmark_group("planner");
    group.throughput(Throughput::Elements(1));

    let matrix = synthetic_matrix(512);
    group.bench_function("filter_sort_chain_512_rows", |b| {
        b.iter(|| {
            let filtered = black_box(&matrix)
                .filter_by_drive_type("tier-3")
                .filter_by_iops(2000)
                .sort_by_iops()
                .sort_by_priority();
            let _ = black_box(filtered.len());
        });
    });

    group.finish();
}

criterion_group!(benches, bench_plan_distribution, bench_filter_chain);
criterion_main!(benches);
