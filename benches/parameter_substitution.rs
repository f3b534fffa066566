//! Parameter substitution benchmark
//!
//! Measures `substitute` across params shapes of increasing reference
//! density: no references (pass-through), a single whole-value reference,
//! and many spliced references inside a template string.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use serde_json::{json, Value};

use gleitzeit_kernel::substitution::substitute;

fn resolver(results: &[(String, Value)]) -> impl Fn(&str) -> Option<&Value> + Copy + '_ {
    move |task_id: &str| results.iter().find(|(id, _)| id == task_id).map(|(_, v)| v)
}

fn bench_no_references(c: &mut Criterion) {
    let params = json!({
        "prompt": "summarize the quarterly report",
        "temperature": 0.2,
        "max_tokens": 512,
    });
    let results: Vec<(String, Value)> = vec![];

    c.bench_function("parameter_substitution/no_references", |b| {
        b.iter(|| substitute(&params, resolver(&results)).unwrap());
    });
}

fn bench_whole_value_reference(c: &mut Criterion) {
    let params = json!({ "input": "${t1.output}" });
    let results = vec![("t1".to_string(), json!({"output": {"text": "hello", "tokens": 3}}))];

    c.bench_function("parameter_substitution/whole_value", |b| {
        b.iter(|| substitute(&params, resolver(&results)).unwrap());
    });
}

/// A template string with `n` spliced references, plus `n` upstream results
/// to resolve them against.
fn bench_dense_template(c: &mut Criterion) {
    let mut group = c.benchmark_group("parameter_substitution/dense_template");

    for n in [1usize, 10, 50] {
        let template: String = (0..n).map(|i| format!("[${{t{i}.value}}]")).collect();
        let params = json!({ "prompt": template });
        let results: Vec<(String, Value)> = (0..n).map(|i| (format!("t{i}"), json!({"value": i}))).collect();

        group.throughput(Throughput::Elements(n as u64));
        group.bench_with_input(BenchmarkId::new("refs", n), &(params, results), |b, (params, results)| {
            b.iter(|| substitute(params, resolver(results)).unwrap());
        });
    }

    group.finish();
}

criterion_group!(benches, bench_no_references, bench_whole_value_reference, bench_dense_template);
criterion_main!(benches);
