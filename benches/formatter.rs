//! Benchmark suite for the output formatters.
//!
//! Isolates formatter performance from async runtime overhead.

use criterion::{Criterion, Throughput, black_box, criterion_group, criterion_main};
use qardioarm_listener::sink::influxdb::InfluxDbFormatter;
use qardioarm_listener::sink::json::JsonFormatter;
use qardioarm_listener::{DeviceIdentity, OutputFormatter, Reading};
use std::time::{Duration, SystemTime};

fn reading(identity: DeviceIdentity) -> Reading {
    Reading {
        systolic_mmhg: 120,
        diastolic_mmhg: 80,
        pulse_bpm: 72,
        is_intermediate: false,
        is_failed: false,
        timestamp: SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000),
        identity,
    }
}

/// Benchmark each formatter on a typical reading
fn bench_formats(c: &mut Criterion) {
    let mut group = c.benchmark_group("format");
    group.throughput(Throughput::Elements(1));

    let r = reading(DeviceIdentity::new("Qardio", "QardioARM"));

    let influx = InfluxDbFormatter::default();
    group.bench_function("influxdb", |b| {
        b.iter(|| black_box(influx.format(black_box(&r))))
    });

    group.bench_function("json", |b| {
        b.iter(|| black_box(JsonFormatter.format(black_box(&r))))
    });

    group.finish();
}

/// Benchmark tag escaping with identity strings that need it
fn bench_tag_escaping(c: &mut Criterion) {
    let mut group = c.benchmark_group("influxdb_tags");
    group.throughput(Throughput::Elements(1));
    let formatter = InfluxDbFormatter::default();

    let plain = reading(DeviceIdentity::default());
    group.bench_function("plain", |b| {
        b.iter(|| black_box(formatter.format(black_box(&plain))))
    });

    let escaped = reading(DeviceIdentity::new("Qardio, Inc.", "QardioARM A100=B"));
    group.bench_function("escaped", |b| {
        b.iter(|| black_box(formatter.format(black_box(&escaped))))
    });

    group.finish();
}

criterion_group!(benches, bench_formats, bench_tag_escaping);
criterion_main!(benches);
