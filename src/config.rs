use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;

use crate::model::Severity;

// ==========================================
// 1. 引擎配置 (EngineConfig)
// ==========================================

/// 每个严重级别的扣分权重，用于质量分
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnomalyWeights {
    pub critical: f64,
    pub high: f64,
    pub medium: f64,
    pub low: f64,
}

impl Default for AnomalyWeights {
    fn default() -> Self {
        Self {
            critical: 4.0,
            high: 2.0,
            medium: 1.0,
            low: 0.5,
        }
    }
}

impl AnomalyWeights {
    pub fn weight(&self, severity: Severity) -> f64 {
        match severity {
            Severity::Critical => self.critical,
            Severity::High => self.high,
            Severity::Medium => self.medium,
            Severity::Low => self.low,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub strict_mode: bool,
    pub parallel_processing: bool,
    pub min_confidence_threshold: f64,
    pub anomaly_weights: AnomalyWeights,
    pub enable_challenge_response: bool,
    pub enable_cross_modal: bool,
    pub enable_audit_chain: bool,
    pub enable_reputation: bool,
    /// 每 N 个 4KB 块取一个；None 表示全量
    pub sample_rate: Option<usize>,
    /// 挑战-响应的随机种子；None 时由输入哈希派生
    pub rng_seed: Option<u64>,
    pub timeout_ms: u64,
    pub noise_sigma: f64,
    pub jpeg_quality: u8,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            strict_mode: false,
            parallel_processing: true,
            min_confidence_threshold: 0.6,
            anomaly_weights: AnomalyWeights::default(),
            enable_challenge_response: true,
            enable_cross_modal: true,
            enable_audit_chain: true,
            enable_reputation: true,
            sample_rate: None,
            rng_seed: None,
            timeout_ms: 30_000,
            noise_sigma: 3.0,
            jpeg_quality: 85,
        }
    }
}

impl EngineConfig {
    /// 严格模式把阈值上调 0.15，封顶 0.95
    pub fn effective_threshold(&self) -> f64 {
        if self.strict_mode {
            (self.min_confidence_threshold + 0.15).min(0.95)
        } else {
            self.min_confidence_threshold
        }
    }

    /// 从 JSON 文件加载，缺失字段取默认值
    pub fn from_json_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("读取配置文件失败 {}: {}", path.display(), e))?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if !(0.0..=1.0).contains(&self.min_confidence_threshold) {
            anyhow::bail!("min_confidence_threshold 必须在 [0,1] 内: {}", self.min_confidence_threshold);
        }
        if self.sample_rate == Some(0) {
            anyhow::bail!("sample_rate 必须 >= 1");
        }
        if !(1..=100).contains(&self.jpeg_quality) {
            anyhow::bail!("jpeg_quality 必须在 1..=100 内: {}", self.jpeg_quality);
        }
        Ok(())
    }
}

// ==========================================
// 2. 服务配置 (环境变量)
// ==========================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryBackend {
    Sled,
    Memory,
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub host: String,
    pub port: u16,
    pub registry_path: String,
    pub registry_backend: RegistryBackend,
}

impl ServiceConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let port = env::var("PORT").unwrap_or_else(|_| "3000".to_string());
        let backend = env::var("REGISTRY_BACKEND").unwrap_or_else(|_| "sled".to_string());
        Ok(Self {
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: port
                .parse()
                .map_err(|_| anyhow::anyhow!("PORT 必须是数字: {}", port))?,
            registry_path: env::var("REGISTRY_PATH").unwrap_or_else(|_| "data/db/registry".to_string()),
            registry_backend: match backend.to_ascii_lowercase().as_str() {
                "sled" => RegistryBackend::Sled,
                "memory" => RegistryBackend::Memory,
                other => anyhow::bail!("未知的 REGISTRY_BACKEND: {}", other),
            },
        })
    }
}
