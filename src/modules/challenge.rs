//! 挑战-响应：主动扰动缓冲区，观察响应是否符合真实传感器的行为
//!
//! 四个探针彼此独立，并发执行。随机源全部由种子派生，
//! 同一种子 + 同一缓冲区必然得到同样的结论。

use image::codecs::jpeg::JpegEncoder;
use image::{ColorType, DynamicImage, GrayImage, ImageFormat};
use img_hash::{HashAlg, HasherConfig};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::model::{AnomalyKind, Metric, ModuleName, ModuleResult, SensorType, Severity, VerificationAnomaly};
use crate::modules::{AnalysisInput, ModuleError};
use crate::signal;

const PROBE_PREFIX: usize = 64 * 1024;
const MAX_IMAGE_SIDE: usize = 256;
const MIN_IMAGE_SIDE: usize = 16;
const SKIPPED_CONFIDENCE: f64 = 0.8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeKind {
    Perturbation,
    CompressionRoundTrip,
    NoiseInjection,
    TemporalShift,
}

impl ProbeKind {
    fn index(self) -> u64 {
        match self {
            ProbeKind::Perturbation => 0,
            ProbeKind::CompressionRoundTrip => 1,
            ProbeKind::NoiseInjection => 2,
            ProbeKind::TemporalShift => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProbeKind::Perturbation => "perturbation",
            ProbeKind::CompressionRoundTrip => "compression_round_trip",
            ProbeKind::NoiseInjection => "noise_injection",
            ProbeKind::TemporalShift => "temporal_shift",
        }
    }
}

/// 单个探针的结果（只存在于本次确证内）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChallengeTest {
    pub probe: ProbeKind,
    pub parameters: BTreeMap<String, Metric>,
    pub expected: String,
    pub actual: String,
    pub passed: bool,
    pub confidence: f64,
    pub skipped: bool,
}

impl ChallengeTest {
    fn skipped(probe: ProbeKind, reason: &str) -> Self {
        Self {
            probe,
            parameters: BTreeMap::new(),
            expected: "n/a".into(),
            actual: reason.into(),
            passed: true,
            confidence: SKIPPED_CONFIDENCE,
            skipped: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChallengeConfig {
    /// 每隔多少字节抖动一次
    pub jitter_stride: usize,
    pub jitter_amplitude: i16,
    pub max_entropy_drift: f64,
    pub noise_sigma: f64,
    pub snr_band_db: (f64, f64),
    pub jpeg_quality: u8,
    /// JPEG 体积 / 原始体积
    pub size_ratio_band: (f64, f64),
    /// 往返后的平均绝对像素误差
    pub artifact_band: (f64, f64),
    pub time_shift_secs: f64,
    pub shift_tolerance_secs: f64,
}

impl Default for ChallengeConfig {
    fn default() -> Self {
        Self {
            jitter_stride: 97,
            jitter_amplitude: 4,
            max_entropy_drift: 0.5,
            noise_sigma: 3.0,
            snr_band_db: (15.0, 40.0),
            jpeg_quality: 85,
            size_ratio_band: (0.03, 0.95),
            artifact_band: (0.3, 14.0),
            time_shift_secs: 3600.5,
            shift_tolerance_secs: 1e-3,
        }
    }
}

/// 1. 扰动探针：抖动后熵漂移应当很小
pub fn perturbation_probe(data: &[u8], cfg: &ChallengeConfig, rng: &mut StdRng) -> ChallengeTest {
    let prefix = &data[..data.len().min(PROBE_PREFIX)];
    let before = signal::shannon_entropy(prefix);
    let mut jittered = prefix.to_vec();
    let amp = cfg.jitter_amplitude.max(1);
    for i in (0..jittered.len()).step_by(cfg.jitter_stride.max(1)) {
        let delta: i16 = rng.gen_range(-amp..=amp);
        jittered[i] = (jittered[i] as i16 + delta).clamp(0, 255) as u8;
    }
    let after = signal::shannon_entropy(&jittered);
    let drift = (after - before).abs();
    let passed = drift < cfg.max_entropy_drift;
    let confidence = if passed {
        (1.0 - drift).clamp(0.5, 0.95)
    } else {
        (1.0 - drift / 2.0).clamp(0.2, 0.7)
    };

    let mut parameters = BTreeMap::new();
    parameters.insert("stride".into(), Metric::from(cfg.jitter_stride));
    parameters.insert("amplitude".into(), Metric::Count(amp as u64));
    ChallengeTest {
        probe: ProbeKind::Perturbation,
        parameters,
        expected: format!("entropy drift < {:.2}", cfg.max_entropy_drift),
        actual: format!("drift={:.4} ({:.3} -> {:.3})", drift, before, after),
        passed,
        confidence,
        skipped: false,
    }
}

/// 2. 压缩往返探针：把前缀当作灰度图做一次 JPEG 编解码
pub fn compression_probe(
    data: &[u8],
    sensors: &[SensorType],
    cfg: &ChallengeConfig,
) -> Result<ChallengeTest, ModuleError> {
    let probe = ProbeKind::CompressionRoundTrip;
    if !sensors.iter().any(|s| s.is_image()) {
        return Ok(ChallengeTest::skipped(probe, "未声明图像类传感器"));
    }
    let width = ((data.len() as f64).sqrt().floor() as usize).min(MAX_IMAGE_SIDE);
    if width < MIN_IMAGE_SIDE {
        return Ok(ChallengeTest::skipped(probe, "数据不足以构成图像"));
    }
    let height = (data.len() / width).min(MAX_IMAGE_SIDE);
    let raw = data[..width * height].to_vec();

    let mut encoded = Vec::new();
    JpegEncoder::new_with_quality(&mut encoded, cfg.jpeg_quality)
        .encode(&raw, width as u32, height as u32, ColorType::L8)
        .map_err(|e| ModuleError::Codec(e.to_string()))?;
    let decoded = image::load_from_memory_with_format(&encoded, ImageFormat::Jpeg)
        .map_err(|e| ModuleError::Codec(e.to_string()))?
        .to_luma8();

    let artifact = raw
        .iter()
        .zip(decoded.as_raw())
        .map(|(a, b)| (*a as f64 - *b as f64).abs())
        .sum::<f64>()
        / raw.len() as f64;
    let size_ratio = encoded.len() as f64 / raw.len() as f64;

    // 感知哈希距离只作为参考指标
    let original = GrayImage::from_raw(width as u32, height as u32, raw)
        .ok_or_else(|| ModuleError::Malformed("灰度图尺寸不一致".into()))?;
    let hasher = HasherConfig::new()
        .hash_alg(HashAlg::Gradient)
        .hash_size(8, 8)
        .to_hasher();
    let phash_distance = hasher
        .hash_image(&DynamicImage::ImageLuma8(original))
        .dist(&hasher.hash_image(&DynamicImage::ImageLuma8(decoded)));

    let (ratio_lo, ratio_hi) = cfg.size_ratio_band;
    let (art_lo, art_hi) = cfg.artifact_band;
    let ratio_ok = (ratio_lo..=ratio_hi).contains(&size_ratio);
    let artifact_ok = (art_lo..=art_hi).contains(&artifact);
    let passed = ratio_ok && artifact_ok;
    let confidence = if passed {
        (0.9 - phash_distance as f64 / 128.0).clamp(0.6, 0.9)
    } else if size_ratio < ratio_lo && artifact < art_lo {
        // 过于平滑：几乎无损、极易压缩，典型的渲染/合成画面
        0.3
    } else {
        0.6
    };

    let mut parameters = BTreeMap::new();
    parameters.insert("quality".into(), Metric::Count(cfg.jpeg_quality as u64));
    parameters.insert("width".into(), Metric::from(width));
    parameters.insert("height".into(), Metric::from(height));
    parameters.insert("phash_distance".into(), Metric::Count(phash_distance as u64));
    Ok(ChallengeTest {
        probe,
        parameters,
        expected: format!(
            "size ratio in [{:.2}, {:.2}], artifact in [{:.2}, {:.2}]",
            ratio_lo, ratio_hi, art_lo, art_hi
        ),
        actual: format!("size ratio={:.3}, artifact={:.3}", size_ratio, artifact),
        passed,
        confidence,
        skipped: false,
    })
}

/// Box-Muller 标准正态采样
fn gaussian(rng: &mut StdRng) -> f64 {
    let u1: f64 = 1.0 - rng.gen::<f64>(); // (0, 1]
    let u2: f64 = rng.gen::<f64>();
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
}

/// 3. 噪声注入探针：注入高斯噪声后 SNR 应落在真实传感器区间
pub fn noise_probe(data: &[u8], cfg: &ChallengeConfig, rng: &mut StdRng) -> ChallengeTest {
    let prefix = &data[..data.len().min(PROBE_PREFIX)];
    let (_, std) = signal::mean_std(prefix);
    let signal_power = std * std;
    let noise_power = prefix
        .iter()
        .map(|&b| {
            let noisy = (b as f64 + cfg.noise_sigma * gaussian(rng)).round().clamp(0.0, 255.0);
            let d = noisy - b as f64;
            d * d
        })
        .sum::<f64>()
        / prefix.len().max(1) as f64;

    let snr_db = if noise_power <= 0.0 {
        f64::INFINITY
    } else if signal_power <= 0.0 {
        f64::NEG_INFINITY
    } else {
        10.0 * (signal_power / noise_power).log10()
    };
    let (lo, hi) = cfg.snr_band_db;
    let passed = (lo..=hi).contains(&snr_db);
    let confidence = if passed {
        0.85
    } else if snr_db > lo - 10.0 && snr_db < hi + 10.0 {
        0.6
    } else {
        0.4
    };

    let mut parameters = BTreeMap::new();
    parameters.insert("sigma".into(), Metric::Number(cfg.noise_sigma));
    ChallengeTest {
        probe: ProbeKind::NoiseInjection,
        parameters,
        expected: format!("SNR in [{:.0}, {:.0}] dB", lo, hi),
        actual: format!("SNR={:.2} dB", snr_db),
        passed,
        confidence,
        skipped: false,
    }
}

/// 4. 时移探针：整体平移时间戳后帧间隔应保持不变
pub fn temporal_shift_probe(timestamps: &[f64], cfg: &ChallengeConfig) -> ChallengeTest {
    let probe = ProbeKind::TemporalShift;
    if timestamps.len() < 2 {
        return ChallengeTest::skipped(probe, "无时间戳元数据");
    }
    let shifted: Vec<f64> = timestamps.iter().map(|t| t + cfg.time_shift_secs).collect();
    let max_drift = timestamps
        .windows(2)
        .zip(shifted.windows(2))
        .map(|(o, s)| ((s[1] - s[0]) - (o[1] - o[0])).abs())
        .fold(0.0f64, f64::max);
    let passed = max_drift.is_finite() && max_drift <= cfg.shift_tolerance_secs;

    let mut parameters = BTreeMap::new();
    parameters.insert("shift_secs".into(), Metric::Number(cfg.time_shift_secs));
    parameters.insert("frames".into(), Metric::from(timestamps.len()));
    ChallengeTest {
        probe,
        parameters,
        expected: format!("interval drift <= {:.4}s", cfg.shift_tolerance_secs),
        actual: format!("max drift={:.6}s", max_drift),
        passed,
        confidence: if passed { 0.95 } else { 0.45 },
        skipped: false,
    }
}

/// 挑战-响应模块
#[derive(Debug, Clone)]
pub struct ChallengeResponder {
    config: ChallengeConfig,
    seed: u64,
}

impl ChallengeResponder {
    pub fn new(config: ChallengeConfig, seed: u64) -> Self {
        Self { config, seed }
    }

    fn probe_rng(&self, probe: ProbeKind) -> StdRng {
        StdRng::seed_from_u64(self.seed.wrapping_add(probe.index().wrapping_mul(0x9E37_79B9_7F4A_7C15)))
    }

    /// 并发运行四个探针，结果按固定顺序返回
    pub async fn run_probes(&self, input: Arc<AnalysisInput>) -> Result<Vec<ChallengeTest>, ModuleError> {
        input.non_empty_buffer()?;

        let perturbation = {
            let (input, cfg, mut rng) = (input.clone(), self.config.clone(), self.probe_rng(ProbeKind::Perturbation));
            tokio::task::spawn_blocking(move || Ok::<_, ModuleError>(perturbation_probe(&input.buffer, &cfg, &mut rng)))
        };
        let compression = {
            let (input, cfg) = (input.clone(), self.config.clone());
            tokio::task::spawn_blocking(move || {
                compression_probe(&input.buffer, &input.metadata.source.sensor_types, &cfg)
            })
        };
        let noise = {
            let (input, cfg, mut rng) = (input.clone(), self.config.clone(), self.probe_rng(ProbeKind::NoiseInjection));
            tokio::task::spawn_blocking(move || Ok::<_, ModuleError>(noise_probe(&input.buffer, &cfg, &mut rng)))
        };
        let shift = {
            let (input, cfg) = (input.clone(), self.config.clone());
            tokio::task::spawn_blocking(move || {
                Ok::<_, ModuleError>(temporal_shift_probe(input.metadata.timestamps(), &cfg))
            })
        };

        let (a, b, c, d) = tokio::join!(perturbation, compression, noise, shift);
        [a, b, c, d]
            .into_iter()
            .map(|joined| joined.map_err(|e| ModuleError::Task(e.to_string()))?)
            .collect()
    }

    pub async fn respond(&self, input: Arc<AnalysisInput>) -> Result<ModuleResult, ModuleError> {
        let module = ModuleName::ChallengeResponse;
        let tests = self.run_probes(input).await?;

        let anomalies: Vec<VerificationAnomaly> = tests
            .iter()
            .filter(|t| !t.passed)
            .map(|t| {
                let severity = if t.confidence < 0.5 { Severity::Critical } else { Severity::High };
                VerificationAnomaly::new(
                    module,
                    AnomalyKind::ChallengeFailure,
                    severity,
                    t.confidence,
                    format!("{} 探针未通过: 预期 {}, 实际 {}", t.probe.as_str(), t.expected, t.actual),
                )
            })
            .collect();

        let total = tests.len().max(1) as f64;
        let passed = tests.iter().filter(|t| t.passed).count();
        let confidence = tests.iter().map(|t| t.confidence).sum::<f64>() / total;

        let mut result = ModuleResult::new(module, 10.0 * passed as f64 / total, confidence, anomalies)
            .with_metric("passed", passed)
            .with_metric("total", tests.len())
            .with_metric("seed", self.seed);
        for t in &tests {
            result
                .intermediate
                .insert(format!("{}.passed", t.probe.as_str()), Metric::Flag(t.passed));
            result
                .intermediate
                .insert(format!("{}.actual", t.probe.as_str()), Metric::Text(t.actual.clone()));
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DatasetCategory, DatasetMetadata, DeclaredSource, Telemetry};
    use chrono::Utc;

    fn noisy(len: usize, seed: u64) -> Vec<u8> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..len).map(|_| rng.gen_range(0..=255u8)).collect()
    }

    fn input(buffer: Vec<u8>, sensors: Vec<SensorType>, timestamps: Vec<f64>) -> Arc<AnalysisInput> {
        let metadata = DatasetMetadata {
            id: "ds".into(),
            title: String::new(),
            category: DatasetCategory::Other,
            source: DeclaredSource {
                sensor_types: sensors,
                ..Default::default()
            },
            file_size: buffer.len() as u64,
            file_format: "bin".into(),
            upload_timestamp: Utc::now(),
            uploader_id: "u".into(),
            telemetry: Some(Telemetry {
                timestamps,
                ..Default::default()
            }),
        };
        Arc::new(AnalysisInput::new(metadata, buffer))
    }

    #[test]
    fn perturbation_keeps_entropy_of_noise() {
        let data = noisy(32 * 1024, 1);
        let mut rng = StdRng::seed_from_u64(7);
        let t = perturbation_probe(&data, &ChallengeConfig::default(), &mut rng);
        assert!(t.passed, "{}", t.actual);
    }

    #[test]
    fn noise_probe_rejects_flat_signal() {
        let mut rng = StdRng::seed_from_u64(7);
        let t = noise_probe(&[0u8; 4096], &ChallengeConfig::default(), &mut rng);
        assert!(!t.passed);
        assert!(t.confidence < 0.5);

        let t = noise_probe(&noisy(4096, 3), &ChallengeConfig::default(), &mut rng);
        assert!(t.passed, "{}", t.actual);
    }

    #[test]
    fn compression_is_skipped_without_image_sensor() {
        let t = compression_probe(&noisy(4096, 2), &[SensorType::Imu], &ChallengeConfig::default()).unwrap();
        assert!(t.skipped && t.passed);
    }

    #[test]
    fn compression_flags_flat_images() {
        let t = compression_probe(&vec![128u8; 256 * 256], &[SensorType::Camera], &ChallengeConfig::default())
            .unwrap();
        assert!(!t.passed);
        assert!(t.confidence < 0.5);
    }

    #[test]
    fn temporal_shift_is_invariant() {
        let ts: Vec<f64> = (0..100).map(|i| 1_700_000_000.0 + i as f64 * 0.033).collect();
        let t = temporal_shift_probe(&ts, &ChallengeConfig::default());
        assert!(t.passed && !t.skipped);
        assert!(temporal_shift_probe(&[], &ChallengeConfig::default()).skipped);
    }

    #[tokio::test]
    async fn same_seed_same_outcome() {
        let inp = input(noisy(100_000, 9), vec![SensorType::Camera], vec![]);
        let a = ChallengeResponder::new(ChallengeConfig::default(), 42).respond(inp.clone()).await.unwrap();
        let b = ChallengeResponder::new(ChallengeConfig::default(), 42).respond(inp).await.unwrap();
        assert_eq!(a.score, b.score);
        assert_eq!(a.confidence, b.confidence);
        assert_eq!(a.anomalies, b.anomalies);
        assert_eq!(a.intermediate, b.intermediate);
    }

    #[tokio::test]
    async fn failing_probes_become_anomalies() {
        let inp = input(vec![0u8; 8192], vec![SensorType::Camera], vec![]);
        let r = ChallengeResponder::new(ChallengeConfig::default(), 1).respond(inp).await.unwrap();
        assert!(r.score < 10.0);
        assert!(r
            .anomalies
            .iter()
            .all(|a| a.kind == AnomalyKind::ChallengeFailure));
        assert!(!r.anomalies.is_empty());
    }
}
