//! Header propagation and request building benchmarks

use bytes::Bytes;
use criterion::{Criterion, black_box, criterion_group, criterion_main};
use http_body_util::Empty;
use hyper::header::{HeaderMap, HeaderName, HeaderValue};
use hyper::Request;
use relay_proxy::builder::RequestBuilder;
use relay_proxy::config::RequestConfig;
use relay_proxy::headers::HeaderFilter;
use relay_proxy::rewrite::{DynamicRewrite, FixedTargetRewrite, UriRewrite};
use std::sync::Arc;

fn browser_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in [
        ("host", "shop.example.com"),
        ("user-agent", "Mozilla/5.0 (X11; Linux x86_64)"),
        ("accept", "text/html,application/xhtml+xml"),
        ("accept-language", "en-US,en;q=0.9"),
        ("accept-encoding", "gzip, deflate"),
        ("connection", "keep-alive, x-trace"),
        ("keep-alive", "timeout=5"),
        ("x-trace", "abc123"),
        ("cookie", "session=1"),
        ("cookie", "theme=dark"),
        ("cache-control", "no-cache"),
        ("upgrade-insecure-requests", "1"),
    ] {
        headers.append(HeaderName::from_static(name), HeaderValue::from_static(value));
    }
    headers
}

fn bench_header_copy(c: &mut Criterion) {
    let mut group = c.benchmark_group("header_copy");
    let src = browser_headers();
    let filter = HeaderFilter::default();
    let extended = HeaderFilter::new(vec![
        HeaderName::from_static("cookie"),
        HeaderName::from_static("x-internal-token"),
    ]);

    group.bench_function("request_default_filter", |b| {
        b.iter(|| {
            let mut dst = HeaderMap::with_capacity(src.len());
            filter.copy_request_headers(black_box(&src), &mut dst, false);
            black_box(dst);
        });
    });

    group.bench_function("request_extended_filter", |b| {
        b.iter(|| {
            let mut dst = HeaderMap::with_capacity(src.len());
            extended.copy_request_headers(black_box(&src), &mut dst, true);
            black_box(dst);
        });
    });

    group.bench_function("response", |b| {
        b.iter(|| {
            let mut count = 0;
            filter.copy_response_headers(black_box(&src), |_, _| count += 1);
            black_box(count);
        });
    });

    group.finish();
}

fn bench_rewrite(c: &mut Criterion) {
    let mut group = c.benchmark_group("rewrite");
    let (head, ()) = Request::builder()
        .uri("/api/v1/orders?page=3&sort=desc")
        .header("host", "shop.example.com")
        .body(())
        .unwrap()
        .into_parts();

    let fixed = FixedTargetRewrite::new("http://backend.internal:3000/app").unwrap();
    let dynamic = DynamicRewrite::new();

    group.bench_function("fixed_target", |b| {
        b.iter(|| black_box(fixed.rewrite(black_box(&head)).unwrap()));
    });

    group.bench_function("dynamic_host_header", |b| {
        b.iter(|| black_box(dynamic.rewrite(black_box(&head)).unwrap()));
    });

    group.finish();
}

fn bench_build(c: &mut Criterion) {
    let rewrite = FixedTargetRewrite::new("http://backend.internal:3000").unwrap();
    let builder = RequestBuilder::new(Arc::new(rewrite), RequestConfig::default(), HeaderFilter::default());
    let headers = browser_headers();

    c.bench_function("build_outbound_request", |b| {
        b.iter(|| {
            let mut request = Request::new(Empty::<Bytes>::new());
            *request.uri_mut() = "/checkout?step=2".parse().unwrap();
            *request.headers_mut() = headers.clone();
            black_box(builder.build(request).unwrap());
        });
    });
}

criterion_group!(benches, bench_header_copy, bench_rewrite, bench_build);
criterion_main!(benches);
