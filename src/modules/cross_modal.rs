//! 跨模态一致性：多传感器数据集中，任意两路传感器流在时间、空间与统计签名上是否自洽

use serde::{Deserialize, Serialize};

use crate::model::{
    AnomalyKind, DatasetMetadata, GeoPoint, Metric, ModuleName, ModuleResult, SensorType, Severity,
    VerificationAnomaly,
};
use crate::modules::{AnalysisInput, ModuleError};
use crate::signal;

const FEATURE_SAMPLE: usize = 256 * 1024;
const SPECTRAL_BANDS: usize = 8;
const CORRELATION_BLOCKS: usize = 64;
const CONSISTENCY_THRESHOLD: f64 = 0.6;
const CRITICAL_THRESHOLD: f64 = 0.4;
const EMBEDDING_OUTLIER: f64 = 0.5;

/// 预期存在相关性的模态组合（无序）
const CORRELATED_PAIRS: &[(SensorType, SensorType)] = &[
    (SensorType::Camera, SensorType::Depth),
    (SensorType::Gps, SensorType::Imu),
    (SensorType::Camera, SensorType::Lidar),
    (SensorType::Imu, SensorType::Camera),
];

pub fn expected_correlated(a: SensorType, b: SensorType) -> bool {
    CORRELATED_PAIRS
        .iter()
        .any(|&(x, y)| (x == a && y == b) || (x == b && y == a))
}

/// 一路传感器流：缓冲区中的一段 + 该传感器的时间/空间轨迹
#[derive(Debug, Clone, Copy)]
pub struct SensorStream<'a> {
    pub sensor: SensorType,
    pub data: &'a [u8],
    pub timestamps: &'a [f64],
    pub gps: &'a [GeoPoint],
}

/// 按声明顺序把缓冲区切成等长的连续片段，最后一段吸收余数
pub fn split_streams<'a>(metadata: &'a DatasetMetadata, buffer: &'a [u8]) -> Vec<SensorStream<'a>> {
    let sensors = &metadata.source.sensor_types;
    if sensors.is_empty() {
        return Vec::new();
    }
    let telemetry = metadata.telemetry.as_ref();
    let segment = buffer.len() / sensors.len();

    sensors
        .iter()
        .enumerate()
        .map(|(i, &sensor)| {
            let start = i * segment;
            let end = if i + 1 == sensors.len() { buffer.len() } else { start + segment };
            let timestamps = telemetry
                .and_then(|t| t.sensor_timestamps.get(&sensor))
                .map(Vec::as_slice)
                .unwrap_or_else(|| metadata.timestamps());
            let gps = telemetry
                .and_then(|t| t.sensor_gps.get(&sensor))
                .map(Vec::as_slice)
                .unwrap_or_else(|| {
                    if sensor == SensorType::Gps {
                        metadata.gps_track()
                    } else {
                        &[]
                    }
                });
            SensorStream {
                sensor,
                data: &buffer[start..end],
                timestamps,
                gps,
            }
        })
        .collect()
}

/// 统计 + 粗频谱特征向量（全部非负、量纲归一）
pub fn feature_vector(data: &[u8]) -> Vec<f64> {
    let sample = signal::sample(data, FEATURE_SAMPLE);
    let hist = signal::histogram(&sample);
    let total = sample.len().max(1) as f64;
    let (mean, std) = signal::mean_std(&sample);

    let mut features = vec![
        mean / 255.0,
        (std / 127.5).min(1.0),
        signal::entropy_from_histogram(&hist, sample.len() as u64) / 8.0,
        hist[0x00] as f64 / total,
        hist[0xFF] as f64 / total,
    ];
    features.extend(signal::band_energies(&sample, SPECTRAL_BANDS));
    features
}

/// 一对模态的对齐结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrossModalAlignment {
    pub pair: (SensorType, SensorType),
    pub temporal_alignment: Option<f64>,
    pub spatial_alignment: Option<f64>,
    pub embedding_distance: f64,
    pub correlation: Option<f64>,
    pub consistency: f64,
    pub anomalies: Vec<VerificationAnomaly>,
}

fn temporal_alignment(a: &[f64], b: &[f64]) -> Option<f64> {
    let range = |ts: &[f64]| {
        let lo = ts.iter().copied().fold(f64::INFINITY, f64::min);
        let hi = ts.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        (lo, hi)
    };
    if a.is_empty() || b.is_empty() {
        return None;
    }
    let (a_lo, a_hi) = range(a);
    let (b_lo, b_hi) = range(b);
    let union = a_hi.max(b_hi) - a_lo.min(b_lo);
    let overlap = (a_hi.min(b_hi) - a_lo.max(b_lo)).max(0.0);
    let overlap_ratio = if union <= 0.0 { 1.0 } else { overlap / union };

    let density = |n: usize, lo: f64, hi: f64| if hi > lo { n as f64 / (hi - lo) } else { n as f64 };
    let (da, db) = (density(a.len(), a_lo, a_hi), density(b.len(), b_lo, b_hi));
    let density_ratio = if da.max(db) > 0.0 { da.min(db) / da.max(db) } else { 1.0 };

    Some((0.7 * overlap_ratio + 0.3 * density_ratio).clamp(0.0, 1.0))
}

fn centroid(track: &[GeoPoint]) -> GeoPoint {
    let n = track.len().max(1) as f64;
    GeoPoint::new(
        track.iter().map(|p| p.lat).sum::<f64>() / n,
        track.iter().map(|p| p.lon).sum::<f64>() / n,
    )
}

fn spatial_alignment(a: &[GeoPoint], b: &[GeoPoint]) -> Option<f64> {
    if a.is_empty() || b.is_empty() {
        return None;
    }
    let km = signal::haversine_km(centroid(a), centroid(b));
    Some(match km {
        d if d <= 0.1 => 1.0,
        d if d <= 1.0 => 0.8,
        d if d <= 10.0 => 0.5,
        d if d <= 100.0 => 0.2,
        _ => 0.0,
    })
}

fn block_correlation(a: &[u8], b: &[u8]) -> f64 {
    let sa = signal::sample(a, FEATURE_SAMPLE);
    let sb = signal::sample(b, FEATURE_SAMPLE);
    let ma = signal::block_means(&sa, CORRELATION_BLOCKS);
    let mb = signal::block_means(&sb, CORRELATION_BLOCKS);
    signal::pearson(&ma, &mb).map(f64::abs).unwrap_or(0.0)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CrossModalChecker;

impl CrossModalChecker {
    pub fn new() -> Self {
        Self
    }

    pub fn align(&self, a: &SensorStream<'_>, b: &SensorStream<'_>) -> CrossModalAlignment {
        let module = ModuleName::CrossModal;
        let temporal = temporal_alignment(a.timestamps, b.timestamps);
        let spatial = spatial_alignment(a.gps, b.gps);
        let embedding_distance = signal::cosine_distance(&feature_vector(a.data), &feature_vector(b.data));
        let correlation = expected_correlated(a.sensor, b.sensor).then(|| block_correlation(a.data, b.data));

        let consistency = (0.3 * temporal.unwrap_or(1.0)
            + 0.2 * spatial.unwrap_or(1.0)
            + 0.3 * (1.0 - embedding_distance)
            + 0.2 * correlation.unwrap_or(1.0))
        .clamp(0.0, 1.0);

        let mut anomalies = Vec::new();
        if consistency < CONSISTENCY_THRESHOLD {
            let severity = if consistency < CRITICAL_THRESHOLD {
                Severity::Critical
            } else {
                Severity::High
            };
            anomalies.push(VerificationAnomaly::new(
                module,
                AnomalyKind::CrossModalInconsistency,
                severity,
                1.0 - consistency,
                format!(
                    "{}↔{} 一致性不足: consistency={:.2}, embedding={:.2}, correlation={}",
                    a.sensor,
                    b.sensor,
                    consistency,
                    embedding_distance,
                    correlation.map(|c| format!("{:.2}", c)).unwrap_or_else(|| "n/a".into())
                ),
            ));
        }
        if embedding_distance > EMBEDDING_OUTLIER {
            anomalies.push(VerificationAnomaly::new(
                module,
                AnomalyKind::EmbeddingOutlier,
                Severity::Medium,
                embedding_distance,
                format!("{}↔{} 特征距离过大: {:.2}", a.sensor, b.sensor, embedding_distance),
            ));
        }

        CrossModalAlignment {
            pair: (a.sensor, b.sensor),
            temporal_alignment: temporal,
            spatial_alignment: spatial,
            embedding_distance,
            correlation,
            consistency,
            anomalies,
        }
    }

    /// 逐对检查全部无序模态组合
    pub fn align_all(&self, metadata: &DatasetMetadata, buffer: &[u8]) -> Result<Vec<CrossModalAlignment>, ModuleError> {
        if buffer.is_empty() {
            return Err(ModuleError::EmptyBuffer);
        }
        let streams = split_streams(metadata, buffer);
        if streams.len() < 2 {
            return Err(ModuleError::Malformed(format!(
                "跨模态检查至少需要两路传感器，实际 {}",
                streams.len()
            )));
        }
        let mut alignments = Vec::new();
        for (i, a) in streams.iter().enumerate() {
            for b in &streams[i + 1..] {
                alignments.push(self.align(a, b));
            }
        }
        Ok(alignments)
    }

    pub fn check(&self, input: &AnalysisInput) -> Result<ModuleResult, ModuleError> {
        let alignments = self.align_all(&input.metadata, &input.buffer)?;
        let consistencies: Vec<f64> = alignments.iter().map(|a| a.consistency).collect();
        let mean_consistency = signal::mean(&consistencies).unwrap_or(0.0);
        let anomalies: Vec<VerificationAnomaly> =
            alignments.iter().flat_map(|a| a.anomalies.iter().cloned()).collect();
        let confidence = if anomalies.is_empty() { 0.9 } else { 0.7 };

        let mut result = ModuleResult::new(ModuleName::CrossModal, mean_consistency * 10.0, confidence, anomalies)
            .with_metric("pairs", alignments.len())
            .with_metric("mean_consistency", mean_consistency);
        for a in &alignments {
            let key = format!("{}_{}", a.pair.0, a.pair.1);
            result.intermediate.insert(
                key,
                Metric::Series(vec![
                    a.temporal_alignment.unwrap_or(-1.0),
                    a.spatial_alignment.unwrap_or(-1.0),
                    a.embedding_distance,
                    a.correlation.unwrap_or(-1.0),
                    a.consistency,
                ]),
            );
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DatasetCategory, DeclaredSource, Telemetry};
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn noisy(len: usize, seed: u64) -> Vec<u8> {
        let mut x = seed | 1;
        (0..len)
            .map(|_| {
                x ^= x << 13;
                x ^= x >> 7;
                x ^= x << 17;
                (x >> 24) as u8
            })
            .collect()
    }

    fn meta(sensors: Vec<SensorType>, telemetry: Option<Telemetry>) -> DatasetMetadata {
        DatasetMetadata {
            id: "ds".into(),
            title: String::new(),
            category: DatasetCategory::Navigation,
            source: DeclaredSource {
                sensor_types: sensors,
                ..Default::default()
            },
            file_size: 0,
            file_format: "bin".into(),
            upload_timestamp: Utc::now(),
            uploader_id: "u".into(),
            telemetry,
        }
    }

    #[test]
    fn streams_split_in_declaration_order() {
        let m = meta(vec![SensorType::Camera, SensorType::Imu, SensorType::Gps], None);
        let buf = vec![0u8; 10];
        let s = split_streams(&m, &buf);
        assert_eq!(s.len(), 3);
        assert_eq!(s[0].data.len(), 3);
        assert_eq!(s[2].data.len(), 4);
        assert_eq!(s[1].sensor, SensorType::Imu);
    }

    #[test]
    fn zeros_vs_noise_is_inconsistent_for_correlated_pair() {
        let mut buf = noisy(128 * 1024, 11);
        buf.extend(vec![0u8; 128 * 1024]);
        let m = meta(vec![SensorType::Camera, SensorType::Imu], None);
        let alignments = CrossModalChecker::new().align_all(&m, &buf).unwrap();
        assert_eq!(alignments.len(), 1);
        let a = &alignments[0];
        assert!(a.embedding_distance > 0.9, "{}", a.embedding_distance);
        assert_eq!(a.correlation, Some(0.0));
        assert!(a
            .anomalies
            .iter()
            .any(|x| x.kind == AnomalyKind::CrossModalInconsistency));
    }

    #[test]
    fn similar_streams_are_consistent() {
        let buf = noisy(256 * 1024, 5);
        let m = meta(vec![SensorType::Lidar, SensorType::Imu], None);
        let alignments = CrossModalChecker::new().align_all(&m, &buf).unwrap();
        assert!(alignments[0].anomalies.is_empty());
        assert!(alignments[0].consistency > 0.9);
    }

    #[test]
    fn temporal_and_spatial_alignment_use_telemetry() {
        let mut sensor_timestamps = BTreeMap::new();
        sensor_timestamps.insert(SensorType::Camera, (0..100).map(|i| i as f64 * 0.1).collect());
        sensor_timestamps.insert(SensorType::Lidar, (0..50).map(|i| 100.0 + i as f64 * 0.1).collect());
        let mut sensor_gps = BTreeMap::new();
        sensor_gps.insert(SensorType::Camera, vec![GeoPoint::new(31.0, 121.0)]);
        sensor_gps.insert(SensorType::Lidar, vec![GeoPoint::new(40.0, 116.0)]);
        let m = meta(
            vec![SensorType::Camera, SensorType::Lidar],
            Some(Telemetry {
                sensor_timestamps,
                sensor_gps,
                ..Default::default()
            }),
        );
        let buf = noisy(64 * 1024, 3);
        let a = &CrossModalChecker::new().align_all(&m, &buf).unwrap()[0];
        // 两段时间完全不重叠，只剩密度项
        assert!(a.temporal_alignment.unwrap() <= 0.3 + 1e-9);
        assert_eq!(a.spatial_alignment, Some(0.0));
    }

    #[test]
    fn single_sensor_is_rejected() {
        let m = meta(vec![SensorType::Camera], None);
        assert!(CrossModalChecker::new().align_all(&m, &[1, 2, 3]).is_err());
    }
}
