//! 分析模块
//!
//! 四个彼此独立的核心模块实现 [`AnalysisModule`]，由编排器统一扇出；
//! 挑战-响应与跨模态检查的输入形状不同，由编排器单独接线。

pub mod anomaly;
pub mod challenge;
pub mod cross_modal;
pub mod metadata;
pub mod signature;
pub mod temporal;

pub use anomaly::AnomalyDetector;
pub use challenge::{ChallengeConfig, ChallengeResponder, ChallengeTest, ProbeKind};
pub use cross_modal::{CrossModalAlignment, CrossModalChecker, SensorStream};
pub use metadata::MetadataValidator;
pub use signature::{SensorSignatureClassifier, SignalProfile, SyntheticAssessment};
pub use temporal::TemporalSpatialChecker;

use crate::model::{DatasetMetadata, ModuleName, ModuleResult};

/// 模块内部错误，由编排器转换成零置信度结果，不会中断整次确证
#[derive(Debug, Clone, thiserror::Error)]
pub enum ModuleError {
    #[error("缓冲区为空")]
    EmptyBuffer,
    #[error("输入格式错误: {0}")]
    Malformed(String),
    #[error("编解码失败: {0}")]
    Codec(String),
    #[error("任务异常退出: {0}")]
    Task(String),
}

/// 单次确证共享的只读输入
#[derive(Debug, Clone)]
pub struct AnalysisInput {
    pub metadata: DatasetMetadata,
    pub buffer: Vec<u8>,
    /// 缓冲区 SHA-256 (hex)
    pub input_hash: String,
}

impl AnalysisInput {
    pub fn new(metadata: DatasetMetadata, buffer: Vec<u8>) -> Self {
        let input_hash = crate::signal::sha256_hex(&buffer);
        Self {
            metadata,
            buffer,
            input_hash,
        }
    }

    pub fn non_empty_buffer(&self) -> Result<&[u8], ModuleError> {
        if self.buffer.is_empty() {
            Err(ModuleError::EmptyBuffer)
        } else {
            Ok(&self.buffer)
        }
    }
}

/// 统一的分析接口：一次输入，一个 [`ModuleResult`]
pub trait AnalysisModule: Send + Sync {
    fn name(&self) -> ModuleName;

    /// 写入审计链的前置条件描述
    fn preconditions(&self, input: &AnalysisInput) -> Vec<String> {
        vec![format!("buffer_len={}", input.buffer.len())]
    }

    fn analyze(&self, input: &AnalysisInput) -> Result<ModuleResult, ModuleError>;
}

/// 按异常个数线性扣分
pub(crate) fn penalty_score(anomaly_count: usize, per_anomaly: f64) -> f64 {
    10.0 - per_anomaly * anomaly_count as f64
}
