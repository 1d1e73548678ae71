use crate::model::{AnomalyKind, ModuleName, ModuleResult, Severity, VerificationAnomaly};
use crate::modules::{penalty_score, AnalysisInput, AnalysisModule, ModuleError};
use crate::signal;

const SAMPLE_LEN: usize = 1024 * 1024;
const OUTLIER_SAMPLE: usize = 100_000;
const PERIOD_SAMPLE: usize = 64 * 1024;
const MAX_PERIOD: usize = 64;
const LONG_PERIODS: [usize; 4] = [128, 256, 512, 1024];
const DEGENERATE_RATIO: f64 = 0.3;

const JPEG_SOI: [u8; 3] = [0xFF, 0xD8, 0xFF];
const JPEG_MARKERS: [u8; 4] = [0xE0, 0xE1, 0xDB, 0xEE];
const PNG_SIGNATURE: [u8; 8] = [0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];

/// 声明为原始传感器数据的格式（出现内嵌 JPEG/PNG 即视为二次编码）
const RAW_FORMATS: &[&str] = &["bin", "raw", "bag", "rosbag", "mcap", "hdf5", "h5", "npy", "npz", "pcd", "las"];

/// 与传感器无关的统计异常扫描
#[derive(Debug, Clone, Copy, Default)]
pub struct AnomalyDetector;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Periodicity {
    pub period: usize,
    pub match_ratio: f64,
}

/// 在固定偏移上比较字节是否相等，返回匹配率最高的周期
pub fn strongest_period(data: &[u8]) -> Option<Periodicity> {
    let data = &data[..data.len().min(PERIOD_SAMPLE)];
    (1..=MAX_PERIOD)
        .chain(LONG_PERIODS)
        .filter(|&p| data.len() >= 2 * p + 8)
        .map(|p| {
            let n = data.len() - p;
            let matches = (0..n).filter(|&i| data[i] == data[i + p]).count();
            Periodicity {
                period: p,
                match_ratio: matches as f64 / n as f64,
            }
        })
        .fold(None, |best: Option<Periodicity>, cur| match best {
            Some(b) if b.match_ratio >= cur.match_ratio => Some(b),
            _ => Some(cur),
        })
}

/// 3σ 离群点个数
pub fn outlier_count(data: &[u8]) -> usize {
    let data = &data[..data.len().min(OUTLIER_SAMPLE)];
    let (mean, std) = signal::mean_std(data);
    if std <= f64::EPSILON {
        return 0;
    }
    data.iter()
        .filter(|&&b| ((b as f64 - mean) / std).abs() > 3.0)
        .count()
}

/// 查找内嵌图像签名，返回首个偏移
pub fn find_embedded_image(data: &[u8]) -> Option<(usize, &'static str)> {
    let jpeg = data
        .windows(4)
        .position(|w| w[..3] == JPEG_SOI && JPEG_MARKERS.contains(&w[3]))
        .map(|i| (i, "JPEG"));
    let png = data
        .windows(PNG_SIGNATURE.len())
        .position(|w| w == PNG_SIGNATURE)
        .map(|i| (i, "PNG"));
    match (jpeg, png) {
        (Some(j), Some(p)) => Some(if j.0 <= p.0 { j } else { p }),
        (j, p) => j.or(p),
    }
}

impl AnomalyDetector {
    pub fn new() -> Self {
        Self
    }

    pub fn scan(&self, buffer: &[u8], file_format: &str) -> ModuleResult {
        let module = ModuleName::AnomalyDetector;
        let sample = signal::sample(buffer, SAMPLE_LEN);
        let mut anomalies = Vec::new();

        // (a) 离群点
        let bounded = sample.len().min(OUTLIER_SAMPLE).max(1);
        let outliers = outlier_count(&sample);
        let outlier_ratio = outliers as f64 / bounded as f64;
        if outlier_ratio > 0.01 {
            let severity = if outlier_ratio > 0.05 { Severity::High } else { Severity::Medium };
            anomalies.push(VerificationAnomaly::new(
                module,
                AnomalyKind::QualityIssue,
                severity,
                0.7,
                format!("3σ 离群点占比 {:.2}%", outlier_ratio * 100.0),
            ));
        }

        // (b) 熵边界
        let hist = signal::histogram(&sample);
        let entropy = signal::entropy_from_histogram(&hist, sample.len() as u64);
        if entropy < 4.0 {
            anomalies.push(VerificationAnomaly::new(
                module,
                AnomalyKind::QualityIssue,
                Severity::High,
                0.85,
                format!("熵过低 ({:.2} bits)，疑似合成或压缩数据", entropy),
            ));
        } else if entropy > 8.5 {
            anomalies.push(VerificationAnomaly::new(
                module,
                AnomalyKind::TamperDetected,
                Severity::Medium,
                0.6,
                format!("熵过高 ({:.2} bits)，疑似加密或被篡改", entropy),
            ));
        }

        // (c) 周期性
        let period = strongest_period(&sample);
        if let Some(p) = period.filter(|p| p.match_ratio > 0.7) {
            let severity = if p.match_ratio > 0.9 { Severity::High } else { Severity::Medium };
            anomalies.push(VerificationAnomaly::new(
                module,
                AnomalyKind::QualityIssue,
                severity,
                p.match_ratio,
                format!("人工周期性: period={} match={:.2}", p.period, p.match_ratio),
            ));
        }

        // (d) 内嵌压缩标记
        let format = file_format.trim().trim_start_matches('.').to_ascii_lowercase();
        if RAW_FORMATS.contains(&format.as_str()) {
            let head = &buffer[..buffer.len().min(SAMPLE_LEN)];
            if let Some((offset, kind)) = find_embedded_image(head) {
                anomalies.push(
                    VerificationAnomaly::new(
                        module,
                        AnomalyKind::TamperDetected,
                        Severity::Medium,
                        0.7,
                        format!("原始数据中发现内嵌 {} 签名，疑似二次编码", kind),
                    )
                    .with_indices(vec![offset]),
                );
            }
        }

        // (e) 退化分布
        let total = sample.len().max(1) as f64;
        let zero_ratio = hist[0x00] as f64 / total;
        let ff_ratio = hist[0xFF] as f64 / total;
        if zero_ratio > DEGENERATE_RATIO || ff_ratio > DEGENERATE_RATIO {
            let severity = if zero_ratio + ff_ratio > 0.9 {
                Severity::Critical
            } else {
                Severity::High
            };
            anomalies.push(VerificationAnomaly::new(
                module,
                AnomalyKind::TamperDetected,
                severity,
                0.9,
                format!(
                    "字节分布退化: 0x00={:.1}% 0xFF={:.1}%",
                    zero_ratio * 100.0,
                    ff_ratio * 100.0
                ),
            ));
        }

        let highs = anomalies.iter().filter(|a| a.severity == Severity::High).count();
        let confidence = if anomalies.is_empty() {
            0.95
        } else if anomalies.iter().any(|a| a.severity == Severity::Critical) {
            0.4
        } else if highs > 2 {
            0.5
        } else if highs > 0 {
            0.7
        } else {
            0.85
        };

        ModuleResult::new(module, penalty_score(anomalies.len(), 2.0), confidence, anomalies)
            .with_metric("entropy", entropy)
            .with_metric("outliers", outliers)
            .with_metric("zero_ratio", zero_ratio)
            .with_metric("ff_ratio", ff_ratio)
            .with_metric(
                "period_match",
                period.map(|p| p.match_ratio).unwrap_or_default(),
            )
    }
}

impl AnalysisModule for AnomalyDetector {
    fn name(&self) -> ModuleName {
        ModuleName::AnomalyDetector
    }

    fn analyze(&self, input: &AnalysisInput) -> Result<ModuleResult, ModuleError> {
        let buffer = input.non_empty_buffer()?;
        Ok(self.scan(buffer, &input.metadata.file_format))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noisy(len: usize) -> Vec<u8> {
        let mut x: u64 = 0x2545_F491_4F6C_DD1D;
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
    fn noise_is_clean() {
        let r = AnomalyDetector::new().scan(&noisy(200_000), "bin");
        assert!(r.anomalies.is_empty(), "{:?}", r.anomalies);
        assert_eq!(r.score, 10.0);
        assert_eq!(r.confidence, 0.95);
    }

    #[test]
    fn zeros_are_degenerate_and_low_entropy() {
        let r = AnomalyDetector::new().scan(&[0u8; 100], "bin");
        assert!(r
            .anomalies
            .iter()
            .any(|a| a.kind == AnomalyKind::TamperDetected && a.severity == Severity::Critical));
        assert!(r.anomalies.iter().any(|a| a.description.contains("熵过低")));
        assert_eq!(r.confidence, 0.4);
    }

    #[test]
    fn alternating_bytes_are_periodic_and_degenerate() {
        let data: Vec<u8> = (0..10_000).map(|i| if i % 2 == 0 { 0 } else { 0xFF }).collect();
        let p = strongest_period(&data).unwrap();
        assert!(p.match_ratio > 0.99);
        assert_eq!(p.period % 2, 0);

        let r = AnomalyDetector::new().scan(&data, "bin");
        assert!(r.anomalies.iter().any(|a| a.description.contains("周期")));
        assert!(r.anomalies.iter().any(|a| a.description.contains("退化")));
    }

    #[test]
    fn embedded_jpeg_only_flagged_for_raw_formats() {
        let mut data = noisy(50_000);
        data[1000..1004].copy_from_slice(&[0xFF, 0xD8, 0xFF, 0xE0]);
        assert_eq!(find_embedded_image(&data), Some((1000, "JPEG")));

        let raw = AnomalyDetector::new().scan(&data, "bin");
        assert!(raw.anomalies.iter().any(|a| a.kind == AnomalyKind::TamperDetected));
        let jpg = AnomalyDetector::new().scan(&data, "jpg");
        assert!(jpg.anomalies.is_empty());
    }

    #[test]
    fn outliers_counted_past_three_sigma() {
        let mut data = vec![100u8; 10_000];
        for (i, b) in data.iter_mut().enumerate() {
            *b = 100 + (i % 5) as u8;
        }
        data[10] = 255;
        assert_eq!(outlier_count(&data), 1);
    }
}
