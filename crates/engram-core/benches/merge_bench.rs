use criterion::{black_box, criterion_group, criterion_main, Criterion};
use engram_core::{
    allocate_quotas, build_id, merge_memories, Category, MemoryCandidate, MemoryRecord,
    MergeOptions,
};
use time::{Duration, OffsetDateTime};

fn bench_now() -> OffsetDateTime {
    OffsetDateTime::UNIX_EPOCH + Duration::days(20_000)
}

fn category_for(index: usize) -> Category {
    Category::ALL[index % Category::ALL.len()]
}

#[allow(clippy::cast_precision_loss)]
fn mk_record(index: usize) -> MemoryRecord {
    let category = category_for(index);
    let content = format!("bench fact {index}");
    let updated_at = bench_now() - Duration::hours(i64::try_from(index % 500).unwrap_or(0));
    MemoryRecord {
        id: build_id(category, &content),
        category,
        content,
        rationale: Some("benchmark fixture".to_string()),
        confidence: Some((index % 100) as f64 / 100.0),
        weight: None,
        created_at: updated_at,
        updated_at,
    }
}

#[allow(clippy::cast_precision_loss)]
fn mk_candidate(index: usize) -> MemoryCandidate {
    // Every other candidate re-observes an existing record.
    let content = if index % 2 == 0 {
        format!("bench fact {index}")
    } else {
        format!("fresh fact {index}")
    };
    MemoryCandidate::new(category_for(index), content, (index % 10) as f64 / 10.0)
}

fn bench_merge(c: &mut Criterion) {
    let existing = (0..1_000).map(mk_record).collect::<Vec<_>>();
    let candidates = (0..100).map(mk_candidate).collect::<Vec<_>>();
    let options = MergeOptions::new(bench_now()).with_max_memories(200);

    c.bench_function("merge_1000_records_100_candidates", |b| {
        b.iter(|| {
            let merged = merge_memories(&existing, &candidates, &options);
            assert!(merged.len() <= 200, "merge exceeded capacity");
        });
    });
}

fn bench_quota(c: &mut Criterion) {
    let options = MergeOptions::new(bench_now())
        .with_max_memories(1_000)
        .with_max_per_type(Category::Profile, 300.0)
        .with_max_per_type(Category::Temp, 10.0);

    c.bench_function("allocate_quotas_with_overrides", |b| {
        b.iter(|| allocate_quotas(black_box(options.max_memories), &options.max_per_type));
    });
}

criterion_group!(merge_benches, bench_merge, bench_quota);
criterion_main!(merge_benches);
