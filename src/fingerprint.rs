use serde::Serialize;
use std::collections::BTreeMap;

use crate::model::{DatasetMetadata, SensorType};
use crate::modules::SignalProfile;

/// 指纹长度（hex 字符）
pub const FINGERPRINT_LEN: usize = 16;

/// 参与指纹计算的规范化输入
///
/// 字段顺序固定、集合全部排序，保证同一套设备配置在不同上传之间得到同一个指纹。
#[derive(Debug, Serialize)]
struct FingerprintInput<'a> {
    device_model: String,
    sensors: Vec<SensorType>,
    hardware_spec: &'a BTreeMap<String, String>,
    /// 熵按 0.5 bit 分桶
    entropy_bucket: i64,
    /// 噪底按 0.1 分桶
    noise_bucket: i64,
}

/// 设备指纹：blake3(规范化输入) 截断为 16 个 hex 字符
///
/// 信号统计只取粗粒度分桶：同一台设备的不同批次数据应当落在同一个桶里，
/// 而换了传感器（或伪造的数据）通常会跨桶。
pub fn generate_fingerprint(metadata: &DatasetMetadata, signal: &SignalProfile) -> anyhow::Result<String> {
    let mut sensors = metadata.source.sensor_types.clone();
    sensors.sort();
    sensors.dedup();

    let input = FingerprintInput {
        device_model: metadata
            .source
            .device_model
            .as_deref()
            .map(|m| m.trim().to_ascii_lowercase())
            .unwrap_or_else(|| "unknown".to_string()),
        sensors,
        hardware_spec: &metadata.source.hardware_spec,
        entropy_bucket: (signal.entropy * 2.0).round() as i64,
        noise_bucket: (signal.noise_floor * 10.0).round() as i64,
    };

    let payload = serde_json::to_vec(&input)?;
    let digest = blake3::hash(&payload);
    let mut hex = digest.to_hex().to_string();
    hex.truncate(FINGERPRINT_LEN);
    Ok(hex)
}
