use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::time::Instant;

use crate::model::{Metric, ModuleName, ModuleResult};

/// 空链的根：32 个零字节
pub const EMPTY_ROOT: [u8; 32] = [0u8; 32];

// ==========================================
// 1. 计算记录 (Compute Transcript)
// ==========================================

/// 审计链中的一步，对应一次模块执行
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComputeTranscript {
    pub step_id: u32,
    pub module: ModuleName,
    pub input_hash: String,
    pub preconditions: Vec<String>,
    pub output: BTreeMap<String, Metric>,
    pub score: f64,
    pub confidence: f64,
    pub anomaly_count: u32,
    /// SHA-256(bcs(StepDigest)) 的 hex
    pub step_hash: String,
    pub timestamp: DateTime<Utc>,
    /// 相对上一步（首步相对运行开始）的耗时
    pub duration_us: u64,
}

/// 参与哈希的确定性字段。浮点数转成千分位定点整数，bcs 不接受浮点。
#[derive(Serialize)]
struct StepDigest<'a> {
    step_id: u32,
    module: &'a str,
    input_hash: &'a str,
    preconditions: &'a [String],
    score_milli: u64,
    confidence_milli: u64,
    anomaly_count: u32,
}

fn to_milli(v: f64) -> u64 {
    if v.is_finite() && v > 0.0 {
        (v * 1000.0).round() as u64
    } else {
        0
    }
}

impl ComputeTranscript {
    pub fn compute_hash(&self) -> anyhow::Result<[u8; 32]> {
        let digest = StepDigest {
            step_id: self.step_id,
            module: self.module.as_str(),
            input_hash: &self.input_hash,
            preconditions: &self.preconditions,
            score_milli: to_milli(self.score),
            confidence_milli: to_milli(self.confidence),
            anomaly_count: self.anomaly_count,
        };
        let encoded = bcs::to_bytes(&digest)?;
        Ok(Sha256::digest(&encoded).into())
    }
}

// ==========================================
// 2. Merkle 折叠
// ==========================================

fn hash_pair(left: &[u8; 32], right: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}

/// 两两相邻哈希，奇数层复制最后一个，直到剩一个
pub fn merkle_root(leaves: &[[u8; 32]]) -> [u8; 32] {
    if leaves.is_empty() {
        return EMPTY_ROOT;
    }
    let mut level = leaves.to_vec();
    while level.len() > 1 {
        if level.len() % 2 == 1 {
            if let Some(last) = level.last().copied() {
                level.push(last);
            }
        }
        level = level.chunks(2).map(|pair| hash_pair(&pair[0], &pair[1])).collect();
    }
    level[0]
}

fn decode_hash(hex_str: &str) -> anyhow::Result<[u8; 32]> {
    let bytes = hex::decode(hex_str)?;
    bytes
        .try_into()
        .map_err(|b: Vec<u8>| anyhow::anyhow!("哈希长度错误: {} 字节", b.len()))
}

// ==========================================
// 3. 审计链
// ==========================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditChain {
    pub steps: Vec<ComputeTranscript>,
    pub merkle_root: String,
    pub started_at: DateTime<Utc>,
}

impl AuditChain {
    /// 空链（降级报告 / 关闭审计时使用）
    pub fn empty() -> Self {
        Self {
            steps: Vec::new(),
            merkle_root: hex::encode(EMPTY_ROOT),
            started_at: Utc::now(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// 从导出的步骤重算根
    pub fn recompute_root(&self) -> anyhow::Result<String> {
        let leaves = self
            .steps
            .iter()
            .map(|s| decode_hash(&s.step_hash))
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(hex::encode(merkle_root(&leaves)))
    }

    /// 逐步重算步骤哈希，再重算根并与记录值比对
    pub fn verify(&self) -> anyhow::Result<bool> {
        for step in &self.steps {
            if hex::encode(step.compute_hash()?) != step.step_hash {
                tracing::warn!(step = step.step_id, module = %step.module, "审计步骤哈希不匹配");
                return Ok(false);
            }
        }
        Ok(self.recompute_root()? == self.merkle_root)
    }
}

/// 只追加的审计链构建器，在运行开始时创建
pub struct AuditChainBuilder {
    input_hash: String,
    steps: Vec<ComputeTranscript>,
    started_at: DateTime<Utc>,
    started: Instant,
    last_tick: Instant,
}

impl AuditChainBuilder {
    pub fn new(input_hash: impl Into<String>) -> Self {
        let started = Instant::now();
        Self {
            input_hash: input_hash.into(),
            steps: Vec::new(),
            started_at: Utc::now(),
            started,
            last_tick: started,
        }
    }

    /// 时间戳取模块完成时刻；耗时相对上一步完成（首步相对运行开始）。
    /// 并行完成顺序与记录顺序不一致时，较早完成的步骤耗时记为 0。
    pub fn record(&mut self, result: &ModuleResult) -> anyhow::Result<&ComputeTranscript> {
        let completed = result.completed_at.unwrap_or_else(Instant::now);
        let duration_us = completed.saturating_duration_since(self.last_tick).as_micros() as u64;
        self.last_tick = self.last_tick.max(completed);
        let offset = chrono::Duration::from_std(completed.saturating_duration_since(self.started))
            .unwrap_or_else(|_| chrono::Duration::zero());

        let mut step = ComputeTranscript {
            step_id: self.steps.len() as u32,
            module: result.module,
            input_hash: result.input_hash.clone().unwrap_or_else(|| self.input_hash.clone()),
            preconditions: result.preconditions.clone(),
            output: result.metadata.clone(),
            score: result.score,
            confidence: result.confidence,
            anomaly_count: result.anomalies.len() as u32,
            step_hash: String::new(),
            timestamp: self.started_at + offset,
            duration_us,
        };
        step.step_hash = hex::encode(step.compute_hash()?);
        self.steps.push(step);
        Ok(&self.steps[self.steps.len() - 1])
    }

    pub fn finalize(self) -> anyhow::Result<AuditChain> {
        let leaves = self
            .steps
            .iter()
            .map(|s| decode_hash(&s.step_hash))
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(AuditChain {
            merkle_root: hex::encode(merkle_root(&leaves)),
            steps: self.steps,
            started_at: self.started_at,
        })
    }
}

/// 可复现哈希：dataset id + 输入哈希 + (模块, 分数) + Merkle 根
pub fn reproducibility_hash(
    dataset_id: &str,
    input_hash: &str,
    module_scores: &[(ModuleName, f64)],
    merkle_root: &str,
) -> anyhow::Result<String> {
    let scores: Vec<(&str, u64)> = module_scores
        .iter()
        .map(|(m, s)| (m.as_str(), to_milli(*s)))
        .collect();
    let encoded = bcs::to_bytes(&(dataset_id, input_hash, scores, merkle_root))?;
    Ok(hex::encode(Sha256::digest(&encoded)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(module: ModuleName, score: f64) -> ModuleResult {
        let mut r = ModuleResult::new(module, score, 0.9, vec![]);
        r.preconditions = vec![format!("score={}", score)];
        r
    }

    fn chain_of(n: usize) -> AuditChain {
        let modules = [
            ModuleName::MetadataValidator,
            ModuleName::SensorSignature,
            ModuleName::AnomalyDetector,
            ModuleName::TemporalSpatial,
            ModuleName::ChallengeResponse,
        ];
        let mut b = AuditChainBuilder::new("abc");
        for i in 0..n {
            b.record(&result(modules[i % modules.len()], i as f64)).unwrap();
        }
        b.finalize().unwrap()
    }

    #[test]
    fn empty_root_is_zeros() {
        assert_eq!(merkle_root(&[]), EMPTY_ROOT);
        assert_eq!(chain_of(0).merkle_root, hex::encode(EMPTY_ROOT));
    }

    #[test]
    fn single_leaf_is_its_own_root() {
        let leaf = [7u8; 32];
        assert_eq!(merkle_root(&[leaf]), leaf);
    }

    #[test]
    fn odd_level_duplicates_last() {
        let (a, b, c) = ([1u8; 32], [2u8; 32], [3u8; 32]);
        let expected = hash_pair(&hash_pair(&a, &b), &hash_pair(&c, &c));
        assert_eq!(merkle_root(&[a, b, c]), expected);
    }

    #[test]
    fn exported_chain_verifies() {
        for n in 0..7 {
            let chain = chain_of(n);
            assert_eq!(chain.recompute_root().unwrap(), chain.merkle_root);
            assert!(chain.verify().unwrap());
        }
    }

    #[test]
    fn tampered_step_fails_verification() {
        let mut chain = chain_of(4);
        chain.steps[2].score = 9.9;
        assert!(!chain.verify().unwrap());

        let mut chain = chain_of(4);
        chain.steps.swap(0, 1);
        assert!(!chain.verify().unwrap());
    }

    #[test]
    fn durations_follow_completion_times() {
        let mut b = AuditChainBuilder::new("abc");
        let base = b.started;
        let mut first = result(ModuleName::MetadataValidator, 8.0);
        first.completed_at = Some(base + std::time::Duration::from_micros(300));
        let mut second = result(ModuleName::SensorSignature, 7.0);
        second.completed_at = Some(base + std::time::Duration::from_micros(1_000));
        // 先于上一步完成（并行）
        let mut third = result(ModuleName::AnomalyDetector, 6.0);
        third.completed_at = Some(base + std::time::Duration::from_micros(500));
        for r in [&first, &second, &third] {
            b.record(r).unwrap();
        }
        let chain = b.finalize().unwrap();

        let durations: Vec<u64> = chain.steps.iter().map(|s| s.duration_us).collect();
        assert_eq!(durations, vec![300, 700, 0]);
        assert_eq!(
            chain.steps[1].timestamp - chain.started_at,
            chrono::Duration::microseconds(1_000)
        );
        assert!(chain.steps[2].timestamp < chain.steps[1].timestamp);
    }

    #[test]
    fn identical_runs_share_a_root() {
        assert_eq!(chain_of(5).merkle_root, chain_of(5).merkle_root);
        let a = reproducibility_hash("ds", "abc", &[(ModuleName::AnomalyDetector, 7.0)], "00").unwrap();
        let b = reproducibility_hash("ds", "abc", &[(ModuleName::AnomalyDetector, 7.0)], "00").unwrap();
        let c = reproducibility_hash("ds", "abc", &[(ModuleName::AnomalyDetector, 7.5)], "00").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
