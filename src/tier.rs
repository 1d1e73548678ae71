use serde::{Deserialize, Serialize};
use std::borrow::Cow;

use crate::config::EngineConfig;

pub const SAMPLED_THRESHOLD: u64 = 50 * 1024 * 1024;
pub const METADATA_ONLY_THRESHOLD: u64 = 500 * 1024 * 1024;
/// 只做元数据级确证时保留的头部字节数
pub const METADATA_ONLY_HEAD: usize = 4 * 1024 * 1024;
pub const SAMPLED_RATE: usize = 4;

/// 按文件大小选择的确证档位，由调用方在进入核心前决定
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationTier {
    Full,
    Sampled,
    MetadataOnly,
}

impl VerificationTier {
    pub fn for_size(bytes: u64) -> Self {
        if bytes > METADATA_ONLY_THRESHOLD {
            VerificationTier::MetadataOnly
        } else if bytes >= SAMPLED_THRESHOLD {
            VerificationTier::Sampled
        } else {
            VerificationTier::Full
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            VerificationTier::Full => "full",
            VerificationTier::Sampled => "sampled",
            VerificationTier::MetadataOnly => "metadata_only",
        }
    }

    /// 调整配置：采样档设置 sample_rate（已有更稀疏的设置则保留）
    pub fn apply(&self, config: &EngineConfig) -> EngineConfig {
        let mut config = config.clone();
        if *self == VerificationTier::Sampled {
            config.sample_rate = Some(config.sample_rate.unwrap_or(1).max(SAMPLED_RATE));
        }
        config
    }

    /// 截取送入核心的缓冲区：元数据档只保留头部
    pub fn prepare<'a>(&self, buffer: &'a [u8]) -> Cow<'a, [u8]> {
        match self {
            VerificationTier::MetadataOnly => Cow::Borrowed(&buffer[..buffer.len().min(METADATA_ONLY_HEAD)]),
            _ => Cow::Borrowed(buffer),
        }
    }
}
