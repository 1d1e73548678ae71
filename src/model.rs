use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize}; // 所有实体都要能转成 JSON 交给外部（CLI / HTTP / 存储）
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Instant;

use crate::audit::AuditChain;
use crate::registry::ReputationScore;

// ==========================================
// 1. 声明来源 (Declared Source)
// ==========================================

/// 传感器类型（封闭枚举）
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorType {
    Camera,
    Lidar,
    Imu,
    Gps,
    Depth,
    Radar,
    Thermal,
    Audio,
    Force,
    Joint,
}

impl SensorType {
    pub const ALL: [SensorType; 10] = [
        SensorType::Camera,
        SensorType::Lidar,
        SensorType::Imu,
        SensorType::Gps,
        SensorType::Depth,
        SensorType::Radar,
        SensorType::Thermal,
        SensorType::Audio,
        SensorType::Force,
        SensorType::Joint,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SensorType::Camera => "camera",
            SensorType::Lidar => "lidar",
            SensorType::Imu => "imu",
            SensorType::Gps => "gps",
            SensorType::Depth => "depth",
            SensorType::Radar => "radar",
            SensorType::Thermal => "thermal",
            SensorType::Audio => "audio",
            SensorType::Force => "force",
            SensorType::Joint => "joint",
        }
    }

    /// 以二维像素阵列方式采集的传感器（压缩往返探针只对它们生效）
    pub fn is_image(&self) -> bool {
        matches!(self, SensorType::Camera | SensorType::Depth | SensorType::Thermal)
    }
}

impl fmt::Display for SensorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SensorType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim().to_ascii_lowercase();
        SensorType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == needle)
            .ok_or_else(|| anyhow::anyhow!("未知传感器类型: {}", s))
    }
}

/// 数据集类别（封闭枚举）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DatasetCategory {
    Manipulation,
    Locomotion,
    Navigation,
    AutonomousDriving,
    Aerial,
    Industrial,
    Humanoid,
    #[default]
    Other,
}

/// WGS84 坐标
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lon.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lon)
    }
}

/// 上传方提取好的时间/空间轨迹
///
/// 时间戳单位为秒（Unix epoch, f64）。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Telemetry {
    #[serde(default)]
    pub timestamps: Vec<f64>,
    #[serde(default)]
    pub frame_rate_hz: Option<f64>,
    #[serde(default)]
    pub gps_track: Vec<GeoPoint>,
    /// 单个传感器自己的时间戳流；缺省时沿用 `timestamps`
    #[serde(default)]
    pub sensor_timestamps: BTreeMap<SensorType, Vec<f64>>,
    /// 单个传感器自己的定位轨迹（例如相机外参里带的 GNSS）
    #[serde(default)]
    pub sensor_gps: BTreeMap<SensorType, Vec<GeoPoint>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeclaredSource {
    #[serde(default)]
    pub device_model: Option<String>,
    #[serde(default)]
    pub sensor_types: Vec<SensorType>,
    #[serde(default)]
    pub gps: Option<GeoPoint>,
    #[serde(default)]
    pub environment: Option<String>,
    #[serde(default)]
    pub hardware_spec: BTreeMap<String, String>,
}

/// 单次确证的输入元数据，进入核心后只读
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetMetadata {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub category: DatasetCategory,
    #[serde(default)]
    pub source: DeclaredSource,
    pub file_size: u64,
    pub file_format: String,
    pub upload_timestamp: DateTime<Utc>,
    pub uploader_id: String,
    #[serde(default)]
    pub telemetry: Option<Telemetry>,
}

impl DatasetMetadata {
    /// 边界校验：不合法的元数据不进入分析管线
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.id.trim().is_empty() {
            anyhow::bail!("dataset id 不能为空");
        }
        if self.uploader_id.trim().is_empty() {
            anyhow::bail!("uploader id 不能为空");
        }
        if let Some(t) = &self.telemetry {
            let all_ts = t
                .timestamps
                .iter()
                .chain(t.sensor_timestamps.values().flatten());
            if all_ts.into_iter().any(|ts| !ts.is_finite()) {
                anyhow::bail!("telemetry 中存在非有限时间戳");
            }
            if let Some(rate) = t.frame_rate_hz {
                if !rate.is_finite() || rate <= 0.0 {
                    anyhow::bail!("frame_rate_hz 必须为正数: {}", rate);
                }
            }
        }
        Ok(())
    }

    /// 声明帧率：telemetry 优先，其次硬件规格表里的 `frame_rate_hz`
    pub fn declared_frame_rate(&self) -> Option<f64> {
        self.telemetry
            .as_ref()
            .and_then(|t| t.frame_rate_hz)
            .or_else(|| {
                self.source
                    .hardware_spec
                    .get("frame_rate_hz")
                    .and_then(|v| v.trim().parse::<f64>().ok())
            })
            .filter(|r| r.is_finite() && *r > 0.0)
    }

    pub fn timestamps(&self) -> &[f64] {
        self.telemetry
            .as_ref()
            .map(|t| t.timestamps.as_slice())
            .unwrap_or(&[])
    }

    pub fn gps_track(&self) -> &[GeoPoint] {
        self.telemetry
            .as_ref()
            .map(|t| t.gps_track.as_slice())
            .unwrap_or(&[])
    }
}

// ==========================================
// 2. 异常 (Anomalies)
// ==========================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    MetadataMismatch,
    TemporalGap,
    SpatialInconsistency,
    DuplicateFrames,
    SensorMismatch,
    QualityIssue,
    TamperDetected,
    CrossModalInconsistency,
    ChallengeFailure,
    EmbeddingOutlier,
}

/// 严重程度，按声明顺序全序：Low < Medium < High < Critical
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// 产出结果的分析模块。声明顺序即审计链中的规范顺序。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleName {
    MetadataValidator,
    SensorSignature,
    AnomalyDetector,
    TemporalSpatial,
    ChallengeResponse,
    CrossModal,
    Orchestrator,
}

impl ModuleName {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModuleName::MetadataValidator => "metadata_validator",
            ModuleName::SensorSignature => "sensor_signature",
            ModuleName::AnomalyDetector => "anomaly_detector",
            ModuleName::TemporalSpatial => "temporal_spatial",
            ModuleName::ChallengeResponse => "challenge_response",
            ModuleName::CrossModal => "cross_modal",
            ModuleName::Orchestrator => "orchestrator",
        }
    }
}

impl fmt::Display for ModuleName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationAnomaly {
    pub kind: AnomalyKind,
    pub severity: Severity,
    pub description: String,
    pub confidence: f64,
    pub module: ModuleName,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affected_indices: Option<Vec<usize>>,
}

impl VerificationAnomaly {
    pub fn new(
        module: ModuleName,
        kind: AnomalyKind,
        severity: Severity,
        confidence: f64,
        description: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            severity,
            description: description.into(),
            confidence: clamp_confidence(confidence),
            module,
            affected_indices: None,
        }
    }

    /// 只保留前 64 个下标，避免报告被长序列撑爆
    pub fn with_indices(mut self, mut indices: Vec<usize>) -> Self {
        indices.truncate(64);
        self.affected_indices = Some(indices);
        self
    }
}

// ==========================================
// 3. 模块结果 (Module Results)
// ==========================================

/// 模块附加指标：封闭的带标签变体，替代任意 JSON
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Metric {
    Number(f64),
    Count(u64),
    Text(String),
    Flag(bool),
    Series(Vec<f64>),
}

impl From<f64> for Metric {
    fn from(v: f64) -> Self {
        Metric::Number(v)
    }
}

impl From<u64> for Metric {
    fn from(v: u64) -> Self {
        Metric::Count(v)
    }
}

impl From<usize> for Metric {
    fn from(v: usize) -> Self {
        Metric::Count(v as u64)
    }
}

impl From<bool> for Metric {
    fn from(v: bool) -> Self {
        Metric::Flag(v)
    }
}

impl From<String> for Metric {
    fn from(v: String) -> Self {
        Metric::Text(v)
    }
}

impl From<&str> for Metric {
    fn from(v: &str) -> Self {
        Metric::Text(v.to_string())
    }
}

impl From<Vec<f64>> for Metric {
    fn from(v: Vec<f64>) -> Self {
        Metric::Series(v)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleResult {
    pub module: ModuleName,
    pub score: f64,
    pub confidence: f64,
    pub anomalies: Vec<VerificationAnomaly>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Metric>,
    /// 处理耗时（微秒）
    pub processing_time_us: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_hash: Option<String>,
    #[serde(default)]
    pub preconditions: Vec<String>,
    #[serde(default)]
    pub intermediate: BTreeMap<String, Metric>,
    /// 模块完成时刻，审计链据此计算步骤耗时；不参与序列化
    #[serde(skip)]
    pub completed_at: Option<Instant>,
}

impl ModuleResult {
    /// 构造时即钳制分数与置信度
    pub fn new(
        module: ModuleName,
        score: f64,
        confidence: f64,
        anomalies: Vec<VerificationAnomaly>,
    ) -> Self {
        Self {
            module,
            score: clamp_score(score),
            confidence: clamp_confidence(confidence),
            anomalies,
            metadata: BTreeMap::new(),
            processing_time_us: 0,
            input_hash: None,
            preconditions: Vec::new(),
            intermediate: BTreeMap::new(),
            completed_at: None,
        }
    }

    /// 模块内部失败：零分零置信度 + 一条描述性异常
    pub fn failed(module: ModuleName, reason: impl fmt::Display) -> Self {
        let anomaly = VerificationAnomaly::new(
            module,
            AnomalyKind::QualityIssue,
            Severity::High,
            0.0,
            format!("{} 执行失败: {}", module, reason),
        );
        let mut result = Self::new(module, 0.0, 0.0, vec![anomaly]);
        result.metadata.insert("failed".into(), Metric::Flag(true));
        result
    }

    pub fn with_metric(mut self, key: &str, value: impl Into<Metric>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

// ==========================================
// 4. 判决与报告 (Verdict & Report)
// ==========================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Authentic,
    LikelyAuthentic,
    Suspicious,
    LikelySynthetic,
    Synthetic,
    Tampered,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Authentic => "authentic",
            Verdict::LikelyAuthentic => "likely_authentic",
            Verdict::Suspicious => "suspicious",
            Verdict::LikelySynthetic => "likely_synthetic",
            Verdict::Synthetic => "synthetic",
            Verdict::Tampered => "tampered",
        }
    }

    /// CLI 退出码 0 的判决
    pub fn is_passing(&self) -> bool {
        matches!(self, Verdict::Authentic | Verdict::LikelyAuthentic)
    }

    pub fn is_synthetic(&self) -> bool {
        matches!(self, Verdict::Synthetic | Verdict::LikelySynthetic)
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 确证报告：返回后不可变
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationReport {
    pub dataset_id: String,
    pub verdict: Verdict,
    pub overall_confidence: f64,
    pub quality_score: f64,
    pub metadata_score: f64,
    pub source_match_score: f64,
    pub cross_modal_score: Option<f64>,
    pub challenge_response_score: Option<f64>,
    pub anomalies: Vec<VerificationAnomaly>,
    pub module_results: Vec<ModuleResult>,
    pub explanation: String,
    pub badges: Vec<String>,
    pub timestamp: DateTime<Utc>,
    pub total_duration_ms: u64,
    pub audit_chain: AuditChain,
    pub reproducibility_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sensor_fingerprint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reputation: Option<ReputationScore>,
}

pub fn clamp_score(score: f64) -> f64 {
    if score.is_nan() {
        0.0
    } else {
        score.clamp(0.0, 10.0)
    }
}

pub fn clamp_confidence(confidence: f64) -> f64 {
    if confidence.is_nan() {
        0.0
    } else {
        confidence.clamp(0.0, 1.0)
    }
}
