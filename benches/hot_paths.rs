use criterion::{black_box, criterion_group, criterion_main, Criterion};

use relayoor::clock::ManualClock;
use relayoor::config::SamplerConfig;
use relayoor::proto::parse;
use relayoor::sampler::Sampler;

fn build_sampler(threshold: i64) -> Sampler {
    let cfg = SamplerConfig {
        threshold,
        reservoir_size: threshold.max(0) as usize,
        ..Default::default()
    };
    let clock = ManualClock::new(1_700_000_000);
    Sampler::with_seed(&cfg, Box::new(clock), 42).expect("valid sampler config")
}

fn bench_parse(c: &mut Criterion) {
    let plain = b"servers.api.req_time:23.5|ms";
    let tagged = b"a.b.c.__tag1=v1.__tag2=v2:v2:42.000|ms|@0.2";

    c.bench_function("parse/plain_timer", |b| {
        b.iter(|| parse(black_box(plain)).expect("parse plain"))
    });

    c.bench_function("parse/tagged_with_rate", |b| {
        b.iter(|| parse(black_box(tagged)).expect("parse tagged"))
    });
}

fn bench_consider(c: &mut Criterion) {
    let counter_line = parse(b"servers.api.requests:1|c").expect("valid");
    let timer_line = parse(b"servers.api.req_time:23.5|ms").expect("valid");

    c.bench_function("consider/counter_sampling", |b| {
        let mut sampler = build_sampler(0);
        sampler.consider_counter(&counter_line);
        b.iter(|| sampler.consider_counter(black_box(&counter_line)))
    });

    c.bench_function("consider/timer_sampling", |b| {
        let mut sampler = build_sampler(8);
        for _ in 0..16 {
            sampler.consider_timer(&timer_line);
        }
        b.iter(|| sampler.consider_timer(black_box(&timer_line)))
    });
}

fn bench_flush(c: &mut Criterion) {
    c.bench_function("flush/hundred_hot_counters", |b| {
        let mut sampler = build_sampler(0);
        let mut raw_lines = Vec::new();
        for i in 0..100 {
            raw_lines.push(format!("servers.api.metric_{i}:1|c").into_bytes());
        }
        b.iter(|| {
            for raw in &raw_lines {
                let line = parse(raw).expect("valid");
                sampler.consider_counter(&line);
                sampler.consider_counter(&line);
            }
            let mut emitted = 0usize;
            let mut sink = |_key: &[u8], line: &[u8]| {
                emitted += black_box(line.len());
            };
            sampler.flush(&mut sink);
            black_box(emitted)
        })
    });
}

fn bench_suite(c: &mut Criterion) {
    bench_parse(c);
    bench_consider(c);
    bench_flush(c);
}

criterion_group!(benches, bench_suite);
criterion_main!(benches);
