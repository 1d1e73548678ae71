use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::model::{AnomalyKind, ModuleName, ModuleResult, SensorType, Severity, VerificationAnomaly};
use crate::modules::{penalty_score, AnalysisInput, AnalysisModule, ModuleError};
use crate::signal;

/// 计算信号画像所用的前缀长度
const PROFILE_PREFIX: usize = 1024 * 1024;
/// 合成模式检测所用的前缀长度
const PATTERN_PREFIX: usize = 64 * 1024;
const WINDOW: usize = 10;
const MATCH_THRESHOLD: f64 = 0.7;

/// 传感器预期统计区间
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorSignature {
    pub entropy: (f64, f64),
    pub noise_floor: (f64, f64),
    pub spectral_peak: (f64, f64),
}

pub fn expected_signature(sensor: SensorType) -> SensorSignature {
    let (entropy, noise_floor, spectral_peak) = match sensor {
        SensorType::Camera => ((6.0, 7.95), (0.25, 0.75), (0.0, 0.6)),
        SensorType::Lidar => ((5.5, 7.9), (0.2, 0.7), (0.0, 0.8)),
        SensorType::Imu => ((4.5, 7.8), (0.15, 0.7), (0.0, 1.0)),
        SensorType::Gps => ((3.5, 7.0), (0.05, 0.5), (0.0, 1.0)),
        SensorType::Depth => ((5.0, 7.8), (0.15, 0.65), (0.0, 0.5)),
        SensorType::Radar => ((5.0, 7.9), (0.2, 0.7), (0.0, 1.0)),
        SensorType::Thermal => ((5.0, 7.6), (0.1, 0.6), (0.0, 0.4)),
        SensorType::Audio => ((5.5, 7.9), (0.1, 0.6), (0.0, 1.0)),
        SensorType::Force => ((3.5, 7.2), (0.05, 0.5), (0.0, 1.0)),
        SensorType::Joint => ((3.0, 7.0), (0.05, 0.5), (0.0, 1.0)),
    };
    SensorSignature {
        entropy,
        noise_floor,
        spectral_peak,
    }
}

/// 观测到的信号画像，同时也是设备指纹的输入之一
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SignalProfile {
    pub entropy: f64,
    pub noise_floor: f64,
    /// 能量最高频带的归一化位置 ∈ [0, 1]
    pub spectral_peak: f64,
}

impl SignalProfile {
    pub fn observe(buffer: &[u8]) -> Self {
        let prefix = &buffer[..buffer.len().min(PROFILE_PREFIX)];
        let bands = signal::band_energies(prefix, 8);
        let peak = bands
            .iter()
            .enumerate()
            .fold((0usize, 0.0f64), |best, (i, &e)| if e > best.1 { (i, e) } else { best })
            .0;
        Self {
            entropy: signal::shannon_entropy(prefix),
            noise_floor: signal::noise_floor(prefix),
            spectral_peak: peak as f64 / (bands.len().max(2) - 1) as f64,
        }
    }
}

/// 区间外的相对偏差，区间内为 0，上限 1
fn relative_deviation(value: f64, (lo, hi): (f64, f64)) -> f64 {
    let width = (hi - lo).max(f64::EPSILON);
    let outside = if value < lo {
        lo - value
    } else if value > hi {
        value - hi
    } else {
        0.0
    };
    (outside / width).min(1.0)
}

/// 画像与预期签名的匹配度 ∈ [0, 1]
pub fn match_score(profile: &SignalProfile, expected: &SensorSignature) -> f64 {
    let dev = 0.6 * relative_deviation(profile.entropy, expected.entropy)
        + 0.4 * relative_deviation(profile.noise_floor, expected.noise_floor);
    (1.0 - dev).clamp(0.0, 1.0)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SyntheticAssessment {
    /// 合成概率 ∈ [0, 1]
    pub probability: f64,
    pub entropy: f64,
    /// 前缀中重复 10 字节窗口的占比
    pub repeat_ratio: f64,
    pub is_synthetic: bool,
}

/// 通用合成模式检测：熵越界或重复窗口过多
pub fn detect_synthetic_pattern(buffer: &[u8]) -> SyntheticAssessment {
    let prefix = &buffer[..buffer.len().min(PATTERN_PREFIX)];
    let entropy = signal::shannon_entropy(prefix);

    let total = prefix.len() / WINDOW;
    let repeat_ratio = if total >= 2 {
        let distinct: HashSet<&[u8]> = prefix.chunks_exact(WINDOW).collect();
        1.0 - distinct.len() as f64 / total as f64
    } else {
        0.0
    };

    let entropy_component = if entropy < 5.0 {
        0.5 + 0.5 * (5.0 - entropy) / 5.0
    } else if entropy > 8.5 {
        0.6
    } else {
        0.0
    };
    let excessive_repeats = repeat_ratio > 0.5;
    let is_synthetic = entropy_component > 0.0 || excessive_repeats;
    SyntheticAssessment {
        probability: entropy_component.max(repeat_ratio).clamp(0.0, 1.0),
        entropy,
        repeat_ratio,
        is_synthetic,
    }
}

/// 传感器签名分类器
#[derive(Debug, Clone, Copy, Default)]
pub struct SensorSignatureClassifier;

impl SensorSignatureClassifier {
    pub fn new() -> Self {
        Self
    }

    pub fn classify(&self, sensors: &[SensorType], buffer: &[u8]) -> ModuleResult {
        let module = ModuleName::SensorSignature;
        let profile = SignalProfile::observe(buffer);
        let mut anomalies = Vec::new();
        let mut matches = Vec::with_capacity(sensors.len());

        for sensor in sensors {
            let expected = expected_signature(*sensor);
            let score = match_score(&profile, &expected);
            matches.push(score);
            if score < MATCH_THRESHOLD {
                let severity = if score < 0.4 { Severity::High } else { Severity::Medium };
                anomalies.push(VerificationAnomaly::new(
                    module,
                    AnomalyKind::SensorMismatch,
                    severity,
                    1.0 - score,
                    format!(
                        "{} 签名不匹配: match={:.2}, entropy={:.2}, noise_floor={:.2}",
                        sensor, score, profile.entropy, profile.noise_floor
                    ),
                ));
            }
        }

        let synthetic = detect_synthetic_pattern(buffer);
        if synthetic.is_synthetic {
            anomalies.push(VerificationAnomaly::new(
                module,
                AnomalyKind::SensorMismatch,
                Severity::Critical,
                synthetic.probability,
                format!(
                    "疑似合成数据 (likely synthetic): p={:.2}, entropy={:.2}, repeats={:.2}",
                    synthetic.probability, synthetic.entropy, synthetic.repeat_ratio
                ),
            ));
        }

        let confidence = if anomalies.is_empty() { 0.9 } else { 0.6 };
        let mut result = ModuleResult::new(module, penalty_score(anomalies.len(), 2.0), confidence, anomalies)
            .with_metric("entropy", profile.entropy)
            .with_metric("noise_floor", profile.noise_floor)
            .with_metric("spectral_peak", profile.spectral_peak)
            .with_metric("synthetic_probability", synthetic.probability)
            .with_metric("repeat_ratio", synthetic.repeat_ratio);
        result.intermediate.insert("match_scores".into(), matches.into());
        result
    }
}

impl AnalysisModule for SensorSignatureClassifier {
    fn name(&self) -> ModuleName {
        ModuleName::SensorSignature
    }

    fn preconditions(&self, input: &AnalysisInput) -> Vec<String> {
        let sensors: Vec<&str> = input
            .metadata
            .source
            .sensor_types
            .iter()
            .map(|s| s.as_str())
            .collect();
        vec![
            format!("buffer_len={}", input.buffer.len()),
            format!("sensors={}", sensors.join(",")),
        ]
    }

    fn analyze(&self, input: &AnalysisInput) -> Result<ModuleResult, ModuleError> {
        let buffer = input.non_empty_buffer()?;
        Ok(self.classify(&input.metadata.source.sensor_types, buffer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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

    #[test]
    fn realistic_buffer_matches_camera_lidar_imu() {
        let data = noisy(256 * 1024);
        let r = SensorSignatureClassifier::new().classify(
            &[SensorType::Camera, SensorType::Lidar, SensorType::Imu],
            &data,
        );
        assert!(r.anomalies.is_empty(), "{:?}", r.anomalies);
        assert!(r.score >= 7.0);
        assert_eq!(r.confidence, 0.9);
    }

    #[test]
    fn alternating_pattern_is_flagged_synthetic() {
        let data: Vec<u8> = (0..64 * 1024).map(|i| if i % 2 == 0 { 0 } else { 0xFF }).collect();
        let assessment = detect_synthetic_pattern(&data);
        assert!(assessment.is_synthetic);
        assert!(assessment.probability > 0.7);

        let r = SensorSignatureClassifier::new().classify(&[SensorType::Camera], &data);
        assert!(r.anomalies.iter().any(|a| a.severity == Severity::Critical));
        assert_eq!(r.confidence, 0.6);
    }

    #[test]
    fn zeros_have_maximum_synthetic_probability() {
        let a = detect_synthetic_pattern(&[0u8; 100]);
        assert!(a.is_synthetic);
        assert!((a.probability - 1.0).abs() < 1e-9);
    }

    #[test]
    fn match_score_is_one_inside_ranges() {
        let p = SignalProfile {
            entropy: 7.0,
            noise_floor: 0.5,
            spectral_peak: 0.1,
        };
        assert_eq!(match_score(&p, &expected_signature(SensorType::Camera)), 1.0);
        let off = SignalProfile {
            entropy: 2.0,
            noise_floor: 0.01,
            spectral_peak: 0.1,
        };
        assert!(match_score(&off, &expected_signature(SensorType::Camera)) < 0.4);
    }
}
