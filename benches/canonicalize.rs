use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use playback_proxy::url::{clear_params, pathnize};

fn bench_pathnize(c: &mut Criterion) {
    let mut group = c.benchmark_group("pathnize");

    for query_len in [0, 100, 1_000] {
        let url = format!(
            "http://example.com:8080/static/js/app.js?v={}",
            "x".repeat(query_len)
        );
        group.bench_with_input(BenchmarkId::from_parameter(query_len), &url, |b, url| {
            b.iter(|| pathnize(black_box(url), black_box("GET")));
        });
    }

    group.finish();
}

fn bench_clear_params(c: &mut Criterion) {
    let names = vec!["sid".to_string(), "_".to_string(), "ts".to_string()];
    let url = "http://example.com/search?q=rust&sid=123456&page=2&_=1699999999&ts=42#top";

    c.bench_function("clear_params", |b| {
        b.iter(|| clear_params(black_box(url), black_box(&names)));
    });
}

criterion_group!(benches, bench_pathnize, bench_clear_params);
criterion_main!(benches);
