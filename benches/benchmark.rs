use chrono::Utc;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use image::{DynamicImage, Rgb, RgbImage};
use page_capture::{
    generate_thumbnail_key, image_transform, CaptureOptions, Config, ImageFormat, Preset,
    UrlValidator,
};
use std::time::Duration;

#[cfg(feature = "integration_benchmarks")]
use page_capture::{CaptureService, Metrics};
#[cfg(feature = "integration_benchmarks")]
use std::sync::Arc;
#[cfg(feature = "integration_benchmarks")]
use tokio::runtime::Runtime;

// Fast settings for all benchmarks
fn configure_fast_group(group: &mut criterion::BenchmarkGroup<criterion::measurement::WallTime>) {
    group.warm_up_time(Duration::from_millis(500));
    group.measurement_time(Duration::from_millis(500));
    group.sample_size(20);
}

fn page_like_image(width: u32, height: u32) -> DynamicImage {
    DynamicImage::ImageRgb8(RgbImage::from_fn(width, height, |x, y| {
        if (x / 3 + y / 5) % 7 == 0 {
            Rgb([30, 30, 30])
        } else {
            Rgb([250, (y % 256) as u8, (x % 256) as u8])
        }
    }))
}

// === UNIT BENCHMARKS ===

fn benchmark_config_creation(c: &mut Criterion) {
    let mut group = c.benchmark_group("config");
    configure_fast_group(&mut group);

    group.bench_function("creation", |b| {
        b.iter(|| black_box(Config::default()));
    });

    group.bench_function("options_validation", |b| {
        b.iter(|| {
            let options = CaptureOptions {
                preset: Some(Preset::DesktopFhd),
                format: ImageFormat::Webp,
                ..Default::default()
            };
            black_box(options.validated().is_ok())
        });
    });

    group.finish();
}

fn benchmark_url_validation(c: &mut Criterion) {
    let mut group = c.benchmark_group("url_validation");
    configure_fast_group(&mut group);

    let validator = UrlValidator::default();
    let test_urls = [
        "https://example.com",
        "http://example.com/path?q=1",
        "http://192.168.0.10/admin",
        "http://metadata.google.internal/",
        "invalid-url",
    ];

    group.bench_function("validate", |b| {
        b.iter(|| {
            for url in &test_urls {
                let _ = black_box(validator.validate(url));
            }
        });
    });

    group.finish();
}

fn benchmark_storage_keys(c: &mut Criterion) {
    let mut group = c.benchmark_group("storage_keys");
    configure_fast_group(&mut group);

    let now = Utc::now();
    group.bench_function("thumbnail_key", |b| {
        b.iter(|| black_box(generate_thumbnail_key("user-42", ImageFormat::Webp, now)));
    });

    group.bench_function("preset_lookup", |b| {
        b.iter(|| {
            for name in ["iphone-14", "desktop-4k", "youtube-thumbnail"] {
                let _ = black_box(name.parse::<Preset>());
            }
        });
    });

    group.finish();
}

fn benchmark_image_encoding(c: &mut Criterion) {
    let mut group = c.benchmark_group("image_encoding");
    configure_fast_group(&mut group);

    let img = page_like_image(640, 400);
    for format in [ImageFormat::Png, ImageFormat::Jpeg, ImageFormat::Webp] {
        group.bench_function(format.as_str(), |b| {
            b.iter(|| black_box(image_transform::encode(&img, format, 85)));
        });
    }

    group.finish();
}

fn benchmark_format_utilities(c: &mut Criterion) {
    let mut group = c.benchmark_group("format_utilities");
    configure_fast_group(&mut group);

    let test_durations = [Duration::from_millis(100), Duration::from_secs(5)];
    let test_byte_sizes = [1024, 1048576];

    group.bench_function("format_duration", |b| {
        b.iter(|| {
            for duration in &test_durations {
                black_box(page_capture::format_duration(*duration));
            }
        });
    });

    group.bench_function("format_bytes", |b| {
        b.iter(|| {
            for size in &test_byte_sizes {
                black_box(page_capture::format_bytes(*size));
            }
        });
    });

    group.finish();
}

// === INTEGRATION BENCHMARKS (require Chrome) ===

#[cfg(feature = "integration_benchmarks")]
fn bench_config(dir: &tempfile::TempDir) -> Config {
    Config {
        uploads_dir: dir.path().join("uploads"),
        temp_dir: dir.path().join("temp"),
        ..Default::default()
    }
}

#[cfg(feature = "integration_benchmarks")]
fn benchmark_real_world_capture(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let dir = tempfile::TempDir::new().unwrap();
    let service = CaptureService::with_chromium(bench_config(&dir), Arc::new(Metrics::new())).unwrap();
    let mut group = c.benchmark_group("real_world_capture");
    configure_fast_group(&mut group);

    group.bench_function("single_url", |b| {
        b.iter(|| {
            rt.block_on(async {
                let result = service
                    .capture_url("https://example.com", CaptureOptions::default())
                    .await;
                black_box(result.is_ok());
            })
        });
    });

    group.finish();
    rt.block_on(service.shutdown());
}

#[cfg(feature = "integration_benchmarks")]
fn benchmark_concurrent_captures(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let dir = tempfile::TempDir::new().unwrap();
    let service = CaptureService::with_chromium(bench_config(&dir), Arc::new(Metrics::new())).unwrap();
    let mut group = c.benchmark_group("concurrent_captures");
    configure_fast_group(&mut group);

    group.bench_function("concurrent_3", |b| {
        b.iter(|| {
            rt.block_on(async {
                let urls = [
                    "https://example.com",
                    "https://httpbin.org/html",
                    "https://www.rust-lang.org",
                ];
                let captures = urls
                    .iter()
                    .map(|url| service.capture_url(url, CaptureOptions::default()));
                let results = futures::future::join_all(captures).await;
                black_box(results.iter().filter(|r| r.is_ok()).count());
            })
        });
    });

    group.finish();
    rt.block_on(service.shutdown());
}

// === BENCHMARK GROUPS ===

criterion_group!(
    unit_benches,
    benchmark_config_creation,
    benchmark_url_validation,
    benchmark_storage_keys,
    benchmark_image_encoding,
    benchmark_format_utilities,
);

#[cfg(feature = "integration_benchmarks")]
criterion_group!(
    integration_benches,
    benchmark_real_world_capture,
    benchmark_concurrent_captures,
);

#[cfg(feature = "integration_benchmarks")]
criterion_main!(unit_benches, integration_benches);

#[cfg(not(feature = "integration_benchmarks"))]
criterion_main!(unit_benches);
