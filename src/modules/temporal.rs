use crate::model::{AnomalyKind, GeoPoint, ModuleName, ModuleResult, Severity, VerificationAnomaly};
use crate::modules::{penalty_score, AnalysisInput, AnalysisModule, ModuleError};
use crate::signal;

const ONE_YEAR_SECS: f64 = 365.0 * 24.0 * 3600.0;
const DEFAULT_MAX_INTERVAL_SECS: f64 = 1.0;
const DUPLICATE_EPSILON: f64 = 1e-9;
const GPS_JUMP_KM: f64 = 1.0;
const GPS_STUCK_MIN_SAMPLES: usize = 10;

/// 时间戳流完整性 + GPS 轨迹合理性
#[derive(Debug, Clone, Copy, Default)]
pub struct TemporalSpatialChecker;

impl TemporalSpatialChecker {
    pub fn new() -> Self {
        Self
    }

    /// `now` 为参考时间（Unix 秒），只有超前一年以上才算越界
    pub fn check_timestamps(
        &self,
        timestamps: &[f64],
        declared_rate: Option<f64>,
        now: f64,
    ) -> Vec<VerificationAnomaly> {
        let module = ModuleName::TemporalSpatial;
        let mut anomalies = Vec::new();
        if timestamps.is_empty() {
            return anomalies;
        }

        let threshold = declared_rate
            .map(|r| 2.0 / r)
            .unwrap_or(DEFAULT_MAX_INTERVAL_SECS);

        let mut gaps = Vec::new();
        let mut backwards = 0usize;
        let mut duplicates = Vec::new();
        for (i, pair) in timestamps.windows(2).enumerate() {
            let dt = pair[1] - pair[0];
            if dt.abs() <= DUPLICATE_EPSILON {
                duplicates.push(i + 1);
            } else if dt < 0.0 {
                backwards += 1;
                gaps.push(i + 1);
            } else if dt > threshold {
                gaps.push(i + 1);
            }
        }
        let intervals = timestamps.len().saturating_sub(1).max(1);

        if !gaps.is_empty() {
            let severity = if backwards > 0 || gaps.len() * 20 > intervals {
                Severity::High
            } else {
                Severity::Medium
            };
            anomalies.push(
                VerificationAnomaly::new(
                    module,
                    AnomalyKind::TemporalGap,
                    severity,
                    0.9,
                    format!(
                        "检测到 {} 处时间间隙（其中 {} 处时间倒退），阈值 {:.3}s",
                        gaps.len(),
                        backwards,
                        threshold
                    ),
                )
                .with_indices(gaps),
            );
        }

        if !duplicates.is_empty() {
            let severity = if duplicates.len() * 20 > intervals {
                Severity::High
            } else {
                Severity::Medium
            };
            anomalies.push(
                VerificationAnomaly::new(
                    module,
                    AnomalyKind::DuplicateFrames,
                    severity,
                    0.9,
                    format!("检测到 {} 个重复时间戳", duplicates.len()),
                )
                .with_indices(duplicates),
            );
        }

        let out_of_range: Vec<usize> = timestamps
            .iter()
            .enumerate()
            .filter(|(_, &t)| t < 0.0 || t - now > ONE_YEAR_SECS)
            .map(|(i, _)| i)
            .collect();
        if !out_of_range.is_empty() {
            anomalies.push(
                VerificationAnomaly::new(
                    module,
                    AnomalyKind::TemporalGap,
                    Severity::High,
                    0.85,
                    format!("{} 个时间戳超出合理范围（负值或晚于参考时间一年以上）", out_of_range.len()),
                )
                .with_indices(out_of_range),
            );
        }

        if let (Some(rate), Some(first), Some(last)) =
            (declared_rate, timestamps.first(), timestamps.last())
        {
            let span = last - first;
            if timestamps.len() >= 2 && span > 0.0 {
                let observed = (timestamps.len() - 1) as f64 / span;
                let deviation = (observed - rate).abs() / rate;
                let severity = if deviation > 0.5 {
                    Some(Severity::High)
                } else if deviation > 0.2 {
                    Some(Severity::Medium)
                } else {
                    None
                };
                if let Some(severity) = severity {
                    anomalies.push(VerificationAnomaly::new(
                        module,
                        AnomalyKind::MetadataMismatch,
                        severity,
                        0.8,
                        format!(
                            "实测帧率 {:.2}Hz 偏离声明值 {:.2}Hz ({:.0}%)",
                            observed,
                            rate,
                            deviation * 100.0
                        ),
                    ));
                }
            }
        }

        anomalies
    }

    pub fn check_gps(&self, track: &[GeoPoint]) -> Vec<VerificationAnomaly> {
        let module = ModuleName::TemporalSpatial;
        let mut anomalies = Vec::new();
        if track.is_empty() {
            return anomalies;
        }

        let invalid: Vec<usize> = track
            .iter()
            .enumerate()
            .filter(|(_, p)| !p.is_valid())
            .map(|(i, _)| i)
            .collect();
        if !invalid.is_empty() {
            anomalies.push(
                VerificationAnomaly::new(
                    module,
                    AnomalyKind::SpatialInconsistency,
                    Severity::High,
                    0.95,
                    format!("{} 个 GPS 坐标越界", invalid.len()),
                )
                .with_indices(invalid),
            );
        }

        let jumps: Vec<usize> = track
            .windows(2)
            .enumerate()
            .filter(|(_, w)| w[0].is_valid() && w[1].is_valid())
            .filter(|(_, w)| signal::haversine_km(w[0], w[1]) > GPS_JUMP_KM)
            .map(|(i, _)| i + 1)
            .collect();
        if !jumps.is_empty() {
            let severity = if jumps.len() > 2 { Severity::High } else { Severity::Medium };
            anomalies.push(
                VerificationAnomaly::new(
                    module,
                    AnomalyKind::SpatialInconsistency,
                    severity,
                    0.85,
                    format!("GPS 轨迹出现 {} 次超过 1km 的跳变", jumps.len()),
                )
                .with_indices(jumps),
            );
        }

        if track.len() >= GPS_STUCK_MIN_SAMPLES && track.iter().all(|p| *p == track[0]) {
            anomalies.push(VerificationAnomaly::new(
                module,
                AnomalyKind::SpatialInconsistency,
                Severity::Medium,
                0.75,
                format!("GPS 在 {} 个采样点上完全静止", track.len()),
            ));
        }

        anomalies
    }
}

impl AnalysisModule for TemporalSpatialChecker {
    fn name(&self) -> ModuleName {
        ModuleName::TemporalSpatial
    }

    fn preconditions(&self, input: &AnalysisInput) -> Vec<String> {
        vec![
            format!("timestamps={}", input.metadata.timestamps().len()),
            format!("gps_points={}", input.metadata.gps_track().len()),
        ]
    }

    fn analyze(&self, input: &AnalysisInput) -> Result<ModuleResult, ModuleError> {
        let meta = &input.metadata;
        // 以上传时间为参考，同一输入重复运行结果一致
        let now = meta.upload_timestamp.timestamp_millis() as f64 / 1000.0;
        let mut anomalies = self.check_timestamps(meta.timestamps(), meta.declared_frame_rate(), now);
        anomalies.extend(self.check_gps(meta.gps_track()));

        let confidence = if anomalies.is_empty() { 0.95 } else { 0.7 };
        Ok(
            ModuleResult::new(self.name(), penalty_score(anomalies.len(), 1.5), confidence, anomalies)
                .with_metric("timestamps", meta.timestamps().len())
                .with_metric("gps_points", meta.gps_track().len()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: f64 = 1_760_000_000.0;

    fn steady(n: usize, hz: f64) -> Vec<f64> {
        (0..n).map(|i| NOW - 60.0 + i as f64 / hz).collect()
    }

    #[test]
    fn steady_stream_is_clean() {
        let ts = steady(300, 30.0);
        let a = TemporalSpatialChecker::new().check_timestamps(&ts, Some(30.0), NOW);
        assert!(a.is_empty(), "{:?}", a);
    }

    #[test]
    fn gaps_and_duplicates_are_separate_anomalies() {
        let mut ts = steady(100, 10.0);
        ts[50] = ts[49]; // 重复
        for t in ts.iter_mut().skip(80) {
            *t += 5.0; // 间隙
        }
        let a = TemporalSpatialChecker::new().check_timestamps(&ts, Some(10.0), NOW);
        assert!(a.iter().any(|x| x.kind == AnomalyKind::DuplicateFrames));
        assert!(a.iter().any(|x| x.kind == AnomalyKind::TemporalGap));
    }

    #[test]
    fn negative_interval_counts_as_high_gap() {
        let ts = vec![NOW, NOW + 0.1, NOW + 0.05, NOW + 0.2];
        let a = TemporalSpatialChecker::new().check_timestamps(&ts, None, NOW);
        let gap = a.iter().find(|x| x.kind == AnomalyKind::TemporalGap).unwrap();
        assert_eq!(gap.severity, Severity::High);
    }

    #[test]
    fn out_of_range_timestamps() {
        let ts = vec![-5.0, NOW + 2.0 * ONE_YEAR_SECS];
        let a = TemporalSpatialChecker::new().check_timestamps(&ts, None, NOW);
        assert!(a.iter().any(|x| x.description.contains("超出合理范围")));
    }

    #[test]
    fn archival_stream_is_not_out_of_range() {
        let ts: Vec<f64> = steady(100, 10.0).iter().map(|t| t - 2.0 * ONE_YEAR_SECS).collect();
        let a = TemporalSpatialChecker::new().check_timestamps(&ts, Some(10.0), NOW);
        assert!(a.is_empty(), "{:?}", a);
    }

    #[test]
    fn range_check_uses_upload_time() {
        use crate::model::{DatasetCategory, DatasetMetadata, DeclaredSource, Telemetry};
        use chrono::{TimeZone, Utc};

        let upload = Utc.timestamp_opt(NOW as i64, 0).unwrap();
        let ts: Vec<f64> = steady(50, 10.0).iter().map(|t| t + 0.5 * ONE_YEAR_SECS).collect();
        let metadata = DatasetMetadata {
            id: "archive".into(),
            title: String::new(),
            category: DatasetCategory::Other,
            source: DeclaredSource::default(),
            file_size: 0,
            file_format: "bag".into(),
            upload_timestamp: upload,
            uploader_id: "alice".into(),
            telemetry: Some(Telemetry {
                timestamps: ts,
                ..Default::default()
            }),
        };
        let input = AnalysisInput::new(metadata, Vec::new());
        let checker = TemporalSpatialChecker::new();
        let first = checker.analyze(&input).unwrap();
        let second = checker.analyze(&input).unwrap();
        assert!(first.anomalies.is_empty(), "{:?}", first.anomalies);
        assert_eq!(first.score, second.score);
    }

    #[test]
    fn frame_rate_deviation_bands() {
        let ts = steady(100, 20.0);
        let checker = TemporalSpatialChecker::new();
        // 声明 30Hz，实测 20Hz：偏差 33% → medium
        let a = checker.check_timestamps(&ts, Some(30.0), NOW);
        let rate = a.iter().find(|x| x.kind == AnomalyKind::MetadataMismatch).unwrap();
        assert_eq!(rate.severity, Severity::Medium);
        // 声明 60Hz：偏差 67% → high
        let a = checker.check_timestamps(&steady(100, 20.0), Some(60.0), NOW);
        assert!(a
            .iter()
            .any(|x| x.kind == AnomalyKind::MetadataMismatch && x.severity == Severity::High));
    }

    #[test]
    fn gps_jumps_and_stuck() {
        let checker = TemporalSpatialChecker::new();
        let stuck = vec![GeoPoint::new(31.2, 121.5); 12];
        let a = checker.check_gps(&stuck);
        assert_eq!(a.len(), 1);
        assert_eq!(a[0].severity, Severity::Medium);

        let jumpy: Vec<GeoPoint> = (0..5).map(|i| GeoPoint::new(31.0 + i as f64 * 0.5, 121.5)).collect();
        let a = checker.check_gps(&jumpy);
        assert!(a.iter().any(|x| x.severity == Severity::High));
    }
}
