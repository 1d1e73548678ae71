use crate::model::{
    AnomalyKind, DatasetMetadata, ModuleName, ModuleResult, SensorType, Severity,
    VerificationAnomaly,
};
use crate::modules::{AnalysisInput, AnalysisModule, ModuleError};

const MIN_FILE_SIZE: u64 = 1024 * 1024; // 1MB
const MAX_FILE_SIZE: u64 = 100 * 1024 * 1024 * 1024; // 100GB

/// 已知设备画像
#[derive(Debug, Clone, Copy)]
pub struct DeviceProfile {
    pub model: &'static str,
    pub aliases: &'static [&'static str],
    pub sensors: &'static [SensorType],
}

impl DeviceProfile {
    fn matches(&self, declared: &str) -> bool {
        let key = normalize(declared);
        normalize(self.model) == key || self.aliases.iter().any(|a| normalize(a) == key)
    }
}

pub const KNOWN_DEVICES: &[DeviceProfile] = &[
    DeviceProfile {
        model: "unitree-go2",
        aliases: &["unitree go2", "go2"],
        sensors: &[SensorType::Camera, SensorType::Lidar, SensorType::Imu],
    },
    DeviceProfile {
        model: "boston-dynamics-spot",
        aliases: &["spot", "bd spot"],
        sensors: &[SensorType::Camera, SensorType::Depth, SensorType::Imu],
    },
    DeviceProfile {
        model: "franka-panda",
        aliases: &["panda", "franka emika panda"],
        sensors: &[SensorType::Camera, SensorType::Force, SensorType::Joint],
    },
    DeviceProfile {
        model: "clearpath-husky",
        aliases: &["husky"],
        sensors: &[SensorType::Camera, SensorType::Lidar, SensorType::Imu, SensorType::Gps],
    },
    DeviceProfile {
        model: "dji-matrice-300",
        aliases: &["matrice 300", "m300 rtk"],
        sensors: &[SensorType::Camera, SensorType::Gps, SensorType::Imu],
    },
    DeviceProfile {
        model: "agility-digit",
        aliases: &["digit"],
        sensors: &[SensorType::Camera, SensorType::Lidar, SensorType::Imu],
    },
    DeviceProfile {
        model: "ur5e",
        aliases: &["universal robots ur5e", "ur5"],
        sensors: &[SensorType::Force, SensorType::Joint],
    },
];

pub const ACCEPTED_FORMATS: &[&str] = &[
    "bag", "rosbag", "mcap", "hdf5", "h5", "parquet", "csv", "json", "jsonl", "npy", "npz",
    "zip", "tar", "mp4", "jpg", "jpeg", "png", "pcd", "las", "ply", "bin", "raw", "wav",
];

fn normalize(s: &str) -> String {
    s.trim()
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c == '_' || c == ' ' { '-' } else { c })
        .collect()
}

pub fn find_profile(model: &str) -> Option<&'static DeviceProfile> {
    KNOWN_DEVICES.iter().find(|p| p.matches(model))
}

/// 元数据校验器：纯函数，只看声明与文件大小
#[derive(Debug, Clone, Copy, Default)]
pub struct MetadataValidator;

impl MetadataValidator {
    pub fn new() -> Self {
        Self
    }

    pub fn validate(&self, metadata: &DatasetMetadata) -> ModuleResult {
        let module = ModuleName::MetadataValidator;
        let mut anomalies = Vec::new();
        let declared = &metadata.source.sensor_types;

        match metadata.source.device_model.as_deref().map(find_profile) {
            Some(Some(profile)) => {
                let missing: Vec<&str> = profile
                    .sensors
                    .iter()
                    .filter(|s| !declared.contains(s))
                    .map(|s| s.as_str())
                    .collect();
                if !missing.is_empty() {
                    anomalies.push(VerificationAnomaly::new(
                        module,
                        AnomalyKind::MetadataMismatch,
                        Severity::Medium,
                        0.8,
                        format!("设备 {} 缺少预期传感器: {}", profile.model, missing.join(", ")),
                    ));
                }
            }
            Some(None) => anomalies.push(VerificationAnomaly::new(
                module,
                AnomalyKind::MetadataMismatch,
                Severity::Low,
                0.6,
                format!(
                    "未知设备型号: {}",
                    metadata.source.device_model.as_deref().unwrap_or_default()
                ),
            )),
            None => anomalies.push(VerificationAnomaly::new(
                module,
                AnomalyKind::MetadataMismatch,
                Severity::Low,
                0.6,
                "未声明设备型号",
            )),
        }

        if declared.is_empty() {
            anomalies.push(VerificationAnomaly::new(
                module,
                AnomalyKind::SensorMismatch,
                Severity::Medium,
                0.9,
                "未声明任何传感器",
            ));
        }

        let format = metadata.file_format.trim().trim_start_matches('.').to_ascii_lowercase();
        if !ACCEPTED_FORMATS.contains(&format.as_str()) {
            anomalies.push(VerificationAnomaly::new(
                module,
                AnomalyKind::MetadataMismatch,
                Severity::Low,
                0.7,
                format!("不在接受列表中的文件格式: {}", metadata.file_format),
            ));
        }

        if metadata.file_size < MIN_FILE_SIZE {
            anomalies.push(VerificationAnomaly::new(
                module,
                AnomalyKind::QualityIssue,
                Severity::High,
                0.85,
                format!("文件过小，可疑 (suspiciously small): {} bytes", metadata.file_size),
            ));
        } else if metadata.file_size > MAX_FILE_SIZE {
            anomalies.push(VerificationAnomaly::new(
                module,
                AnomalyKind::QualityIssue,
                Severity::Low,
                0.5,
                format!("文件异常大: {} bytes", metadata.file_size),
            ));
        }

        let penalty: f64 = anomalies
            .iter()
            .map(|a| match a.severity {
                Severity::Critical => 4.0,
                Severity::High => 2.0,
                Severity::Medium => 1.0,
                Severity::Low => 0.0,
            })
            .sum();
        let confidence = match anomalies.len() {
            0 => 0.95,
            1..=2 => 0.75,
            _ => 0.5,
        };

        let known = metadata
            .source
            .device_model
            .as_deref()
            .and_then(find_profile)
            .is_some();
        ModuleResult::new(module, 10.0 - penalty, confidence, anomalies)
            .with_metric("known_device", known)
            .with_metric("declared_sensors", declared.len())
            .with_metric("file_size", metadata.file_size)
    }
}

impl AnalysisModule for MetadataValidator {
    fn name(&self) -> ModuleName {
        ModuleName::MetadataValidator
    }

    fn preconditions(&self, input: &AnalysisInput) -> Vec<String> {
        vec![
            format!("file_size={}", input.metadata.file_size),
            format!("file_format={}", input.metadata.file_format),
        ]
    }

    fn analyze(&self, input: &AnalysisInput) -> Result<ModuleResult, ModuleError> {
        Ok(self.validate(&input.metadata))
    }
}
