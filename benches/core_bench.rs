use chrono::Utc;
use criterion::{criterion_group, criterion_main, Criterion};
use sensor_verify::{
    audit::merkle_root, fingerprint, modules::SignalProfile, DatasetCategory, DatasetMetadata, DeclaredSource,
    EngineConfig, SensorType, VerificationEngine,
};

fn noisy(len: usize) -> Vec<u8> {
    let mut x: u64 = 0x9E37_79B9_7F4A_7C15;
    (0..len)
        .map(|_| {
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            ((x % 181) * 255 / 180) as u8
        })
        .collect()
}

fn metadata(size: usize) -> DatasetMetadata {
    DatasetMetadata {
        id: "bench".to_string(),
        title: "bench".to_string(),
        category: DatasetCategory::Locomotion,
        source: DeclaredSource {
            device_model: Some("unitree-go2".to_string()),
            sensor_types: vec![SensorType::Camera, SensorType::Lidar, SensorType::Imu],
            ..Default::default()
        },
        file_size: size as u64,
        file_format: "bag".to_string(),
        upload_timestamp: Utc::now(),
        uploader_id: "bench".to_string(),
        telemetry: None,
    }
}

fn bench_fingerprint(c: &mut Criterion) {
    let buffer = noisy(1 << 20);
    let meta = metadata(buffer.len());
    c.bench_function("fingerprint_generation", |b| {
        b.iter(|| {
            let profile = SignalProfile::observe(&buffer);
            fingerprint::generate_fingerprint(&meta, &profile).unwrap();
        })
    });
}

fn bench_merkle(c: &mut Criterion) {
    let leaves: Vec<[u8; 32]> = (0..64u8).map(|i| [i; 32]).collect();
    c.bench_function("merkle_root_64_steps", |b| b.iter(|| merkle_root(&leaves)));
}

fn bench_verify(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let buffer = noisy(4 << 20);
    let engine = VerificationEngine::in_memory(EngineConfig {
        rng_seed: Some(42),
        ..Default::default()
    });

    let mut group = c.benchmark_group("verify");
    group.sample_size(10);
    group.bench_function("full_4mb", |b| {
        b.to_async(&rt)
            .iter(|| engine.verify(metadata(buffer.len()), buffer.clone()))
    });
    group.finish();
}

criterion_group!(benches, bench_fingerprint, bench_merkle, bench_verify);
criterion_main!(benches);
