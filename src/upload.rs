use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::model::{DatasetCategory, DatasetMetadata, DeclaredSource, SensorType};
use crate::signal;

/// 最小上传描述：只有文件名 / MIME / 上传者
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UploadDescriptor {
    pub filename: String,
    #[serde(default)]
    pub mime_type: Option<String>,
    pub uploader_id: String,
    #[serde(default)]
    pub title: Option<String>,
}

pub fn extension(filename: &str) -> String {
    std::path::Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default()
}

/// 由扩展名 / MIME 推断传感器组合，兜底为 camera
pub fn infer_sensors(filename: &str, mime_type: Option<&str>) -> Vec<SensorType> {
    let ext = extension(filename);
    let by_ext = match ext.as_str() {
        "bag" | "mcap" | "db3" => Some(vec![SensorType::Camera, SensorType::Lidar, SensorType::Imu]),
        "pcd" | "las" | "laz" | "ply" => Some(vec![SensorType::Lidar]),
        "jpg" | "jpeg" | "png" | "bmp" | "tiff" | "mp4" | "avi" | "mkv" | "mov" => Some(vec![SensorType::Camera]),
        "imu" | "csv" => Some(vec![SensorType::Imu]),
        "gpx" | "nmea" => Some(vec![SensorType::Gps]),
        "wav" | "flac" => Some(vec![SensorType::Audio]),
        _ => None,
    };
    if let Some(sensors) = by_ext {
        return sensors;
    }

    let mime = mime_type.unwrap_or_default().to_ascii_lowercase();
    if mime.starts_with("image/") || mime.starts_with("video/") {
        vec![SensorType::Camera]
    } else if mime.starts_with("audio/") {
        vec![SensorType::Audio]
    } else {
        vec![SensorType::Camera]
    }
}

/// 构造完整元数据；dataset id 由缓冲区哈希派生
pub fn build_metadata(descriptor: &UploadDescriptor, buffer: &[u8]) -> DatasetMetadata {
    let digest = signal::sha256_hex(buffer);
    let ext = extension(&descriptor.filename);
    DatasetMetadata {
        id: format!("inline-{}", &digest[..12]),
        title: descriptor
            .title
            .clone()
            .unwrap_or_else(|| descriptor.filename.clone()),
        category: DatasetCategory::Other,
        source: DeclaredSource {
            sensor_types: infer_sensors(&descriptor.filename, descriptor.mime_type.as_deref()),
            ..Default::default()
        },
        file_size: buffer.len() as u64,
        file_format: if ext.is_empty() { "bin".to_string() } else { ext },
        upload_timestamp: Utc::now(),
        uploader_id: descriptor.uploader_id.clone(),
        telemetry: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inference_table() {
        assert_eq!(
            infer_sensors("run_01.BAG", None),
            vec![SensorType::Camera, SensorType::Lidar, SensorType::Imu]
        );
        assert_eq!(infer_sensors("scan.pcd", None), vec![SensorType::Lidar]);
        assert_eq!(infer_sensors("track.gpx", None), vec![SensorType::Gps]);
        assert_eq!(infer_sensors("clip", Some("video/mp4")), vec![SensorType::Camera]);
        assert_eq!(infer_sensors("blob.xyz", None), vec![SensorType::Camera]);
    }

    #[test]
    fn metadata_id_derives_from_content() {
        let d = UploadDescriptor {
            filename: "a.imu".into(),
            uploader_id: "u".into(),
            ..Default::default()
        };
        let m = build_metadata(&d, b"hello");
        assert!(m.id.starts_with("inline-"));
        assert_eq!(m.id.len(), "inline-".len() + 12);
        assert_eq!(m.file_format, "imu");
        assert_eq!(m.file_size, 5);
        assert_eq!(build_metadata(&d, b"hello").id, m.id);
    }
}
