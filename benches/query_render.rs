use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use rillview::{Filter, QueryBuilder, SortSpec, provider::limiting_filter};
use serde_json::json;

fn wide_filter(leaves: usize) -> Filter {
    Filter::And(
        (0..leaves)
            .map(|i| match i % 3 {
                0 => Filter::eq(format!("f{i}"), i as i64),
                1 => Filter::between(format!("f{i}"), 0, i as i64),
                _ => Filter::negate(Filter::is_null(format!("f{i}"))),
            })
            .collect(),
    )
}

fn bench_render(c: &mut Criterion) {
    let sort = SortSpec::new().asc("group").desc("name").with_identifier("id");
    let mut group = c.benchmark_group("query_render");
    group.throughput(Throughput::Elements(1));

    for leaves in [4usize, 32] {
        let filter = wide_filter(leaves);
        group.bench_function(BenchmarkId::new("named", leaves), |b| {
            b.iter(|| {
                QueryBuilder::new("person", "obj")
                    .build("obj.id", Some(&filter), Some(&sort), false, None)
                    .unwrap()
            })
        });
        group.bench_function(BenchmarkId::new("positional", leaves), |b| {
            let rendered = QueryBuilder::new("person", "obj")
                .build("obj.id", Some(&filter), Some(&sort), false, None)
                .unwrap();
            b.iter(|| rendered.to_positional().unwrap())
        });
    }

    group.bench_function("sibling_predicate", |b| {
        let values = [json!(1), json!("B"), json!(42)];
        b.iter(|| limiting_filter(sort.keys(), &values, false))
    });

    group.finish();
}

criterion_group!(benches, bench_render);
criterion_main!(benches);
