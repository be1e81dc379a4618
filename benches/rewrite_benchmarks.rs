//! Benchmarks for the per-request string rewriting helpers

use bifrost_relay::common::{rewrite_cookie_property, url_join};
use criterion::{Criterion, black_box, criterion_group, criterion_main};
use std::collections::BTreeMap;

fn bench_url_join(c: &mut Criterion) {
    let mut group = c.benchmark_group("url_join");

    group.bench_function("target_and_request_path", |b| {
        b.iter(|| black_box(url_join(black_box(&["/api/v1", "/users/42?expand=true"]))));
    });

    group.bench_function("absolute_url_with_slash_runs", |b| {
        b.iter(|| {
            black_box(url_join(black_box(&[
                "http://backend.local//base/",
                "//nested///path",
                "?q=a?b",
            ])))
        });
    });

    group.finish();
}

fn bench_cookie_rewrite(c: &mut Criterion) {
    let mut group = c.benchmark_group("cookie_rewrite");

    let domains = BTreeMap::from([
        ("backend.internal".to_string(), Some("example.com".to_string())),
        ("*".to_string(), None),
    ]);
    let cookie = "session=abc123; Domain=backend.internal; Path=/app; HttpOnly; Secure";

    group.bench_function("domain_match", |b| {
        b.iter(|| black_box(rewrite_cookie_property(black_box(cookie), &domains, "domain")));
    });

    let paths = BTreeMap::from([("*".to_string(), Some("/".to_string()))]);
    group.bench_function("path_wildcard", |b| {
        b.iter(|| black_box(rewrite_cookie_property(black_box(cookie), &paths, "path")));
    });

    group.finish();
}

criterion_group!(benches, bench_url_join, bench_cookie_rewrite);
criterion_main!(benches);
