//! 确证编排器
//!
//! 扇出四个核心模块（并行或串行），按需接入挑战-响应与跨模态检查，
//! 汇总出判决，再更新信誉、封装审计链与可复现哈希。
//! `verify` 永远返回一份报告：任何内部错误或超时都落到降级报告上。

use chrono::Utc;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::audit::{self, AuditChain, AuditChainBuilder};
use crate::config::{AnomalyWeights, EngineConfig};
use crate::model::{
    clamp_confidence, clamp_score, AnomalyKind, DatasetMetadata, ModuleName, ModuleResult, Severity,
    Verdict, VerificationAnomaly, VerificationReport,
};
use crate::modules::{
    AnalysisInput, AnalysisModule, AnomalyDetector, ChallengeConfig, ChallengeResponder, CrossModalChecker,
    MetadataValidator, SensorSignatureClassifier, SignalProfile, TemporalSpatialChecker,
};
use crate::registry::{MemoryRegistryStorage, RegistryStorage, ReputationScore, SensorRegistryManager};
use crate::signal;
use crate::tier::VerificationTier;
use crate::upload::{self, UploadDescriptor};

pub const BADGE_VERIFIED_SOURCE: &str = "Verified Source";
pub const BADGE_HIGH_FIDELITY: &str = "High Fidelity";
pub const BADGE_NO_ANOMALIES: &str = "No Anomalies";
pub const BADGE_QUALITY_ISSUES: &str = "Quality Issues";

// ==========================================
// 1. 判决（纯函数）
// ==========================================

/// 判决只取决于平均分、平均置信度与异常严重度
pub fn decide_verdict(
    avg_score: f64,
    avg_confidence: f64,
    anomalies: &[VerificationAnomaly],
    confidence_threshold: f64,
) -> Verdict {
    let critical = anomalies.iter().any(|a| a.severity == Severity::Critical);
    let high = anomalies.iter().filter(|a| a.severity == Severity::High).count();

    if critical {
        Verdict::Synthetic
    } else if high > 2 {
        Verdict::LikelySynthetic
    } else if avg_score < 5.0 || avg_confidence < confidence_threshold {
        Verdict::Suspicious
    } else if avg_score >= 8.0 && avg_confidence >= 0.85 {
        Verdict::Authentic
    } else {
        Verdict::LikelyAuthentic
    }
}

pub fn badges(verdict: Verdict, avg_score: f64, anomalies: &[VerificationAnomaly]) -> Vec<String> {
    let mut out = Vec::new();
    if verdict == Verdict::Authentic {
        out.push(BADGE_VERIFIED_SOURCE.to_string());
    }
    if avg_score >= 9.0 {
        out.push(BADGE_HIGH_FIDELITY.to_string());
    }
    if anomalies.is_empty() {
        out.push(BADGE_NO_ANOMALIES.to_string());
    }
    if anomalies.iter().any(|a| a.severity >= Severity::High) {
        out.push(BADGE_QUALITY_ISSUES.to_string());
    }
    out
}

/// 质量分：10 减去按严重度加权的异常扣分
pub fn quality_score(anomalies: &[VerificationAnomaly], weights: &AnomalyWeights) -> f64 {
    clamp_score(10.0 - anomalies.iter().map(|a| weights.weight(a.severity)).sum::<f64>())
}

fn explain(
    verdict: Verdict,
    avg_score: f64,
    avg_confidence: f64,
    results: &[ModuleResult],
    anomalies: &[VerificationAnomaly],
) -> String {
    let mut text = format!(
        "判决: {} (平均分 {:.1}/10, 置信度 {:.0}%)。",
        verdict,
        avg_score,
        avg_confidence * 100.0
    );
    let best = results.iter().max_by(|a, b| a.score.total_cmp(&b.score));
    let worst = results.iter().min_by(|a, b| a.score.total_cmp(&b.score));
    if let (Some(best), Some(worst)) = (best, worst) {
        text.push_str(&format!(
            "最佳模块 {} ({:.1})，最弱模块 {} ({:.1})。",
            best.module, best.score, worst.module, worst.score
        ));
    }
    if anomalies.is_empty() {
        text.push_str("未发现异常。");
    } else {
        let count = |s: Severity| anomalies.iter().filter(|a| a.severity == s).count();
        text.push_str(&format!(
            "共 {} 个异常: 严重 {} / 高 {} / 中 {} / 低 {}。",
            anomalies.len(),
            count(Severity::Critical),
            count(Severity::High),
            count(Severity::Medium),
            count(Severity::Low)
        ));
    }
    text
}

// ==========================================
// 2. 降级报告
// ==========================================

/// 编排级失败：suspicious、零分、一条 critical quality_issue、空审计链
pub fn fallback_report(dataset_id: &str, reason: &str, elapsed: Duration) -> VerificationReport {
    let anomaly = VerificationAnomaly::new(
        ModuleName::Orchestrator,
        AnomalyKind::QualityIssue,
        Severity::Critical,
        1.0,
        format!("确证流程失败: {}", reason),
    );
    let audit_chain = AuditChain::empty();
    let reproducibility_hash =
        audit::reproducibility_hash(dataset_id, "", &[], &audit_chain.merkle_root).unwrap_or_default();
    let anomalies = vec![anomaly];
    VerificationReport {
        dataset_id: dataset_id.to_string(),
        verdict: Verdict::Suspicious,
        overall_confidence: 0.0,
        quality_score: 0.0,
        metadata_score: 0.0,
        source_match_score: 0.0,
        cross_modal_score: None,
        challenge_response_score: None,
        badges: badges(Verdict::Suspicious, 0.0, &anomalies),
        explanation: format!("判决: {}。确证流程未能完成: {}", Verdict::Suspicious, reason),
        anomalies,
        module_results: Vec::new(),
        timestamp: Utc::now(),
        total_duration_ms: elapsed.as_millis() as u64,
        audit_chain,
        reproducibility_hash,
        sensor_fingerprint: None,
        reputation: None,
    }
}

// ==========================================
// 3. 模块执行
// ==========================================

fn run_module(module: &dyn AnalysisModule, input: &AnalysisInput) -> ModuleResult {
    let started = Instant::now();
    let preconditions = module.preconditions(input);
    let mut result = match module.analyze(input) {
        Ok(result) => result,
        Err(e) => {
            tracing::warn!(module = %module.name(), error = %e, "模块执行失败，按零置信度处理");
            ModuleResult::failed(module.name(), e)
        }
    };
    result.processing_time_us = started.elapsed().as_micros() as u64;
    result.completed_at = Some(Instant::now());
    result.input_hash = Some(input.input_hash.clone());
    result.preconditions = preconditions;
    tracing::debug!(
        module = %result.module,
        score = result.score,
        confidence = result.confidence,
        anomalies = result.anomalies.len(),
        "模块完成"
    );
    result
}

fn joined(module: ModuleName, outcome: Result<ModuleResult, tokio::task::JoinError>) -> ModuleResult {
    outcome.unwrap_or_else(|e| {
        tracing::warn!(module = %module, error = %e, "模块任务异常退出");
        ModuleResult::failed(module, e)
    })
}

/// 挑战-响应种子：配置优先，否则取输入哈希前 8 字节
fn challenge_seed(config: &EngineConfig, input_hash: &str) -> u64 {
    config
        .rng_seed
        .unwrap_or_else(|| u64::from_str_radix(&input_hash[..16.min(input_hash.len())], 16).unwrap_or(0))
}

// ==========================================
// 4. 编排器
// ==========================================

pub struct VerificationEngine {
    config: EngineConfig,
    modules: Vec<Arc<dyn AnalysisModule>>,
    cross_modal: CrossModalChecker,
    registry: SensorRegistryManager,
}

impl VerificationEngine {
    pub fn new(config: EngineConfig, storage: Arc<dyn RegistryStorage>) -> Self {
        let modules: Vec<Arc<dyn AnalysisModule>> = vec![
            Arc::new(MetadataValidator::new()),
            Arc::new(SensorSignatureClassifier::new()),
            Arc::new(AnomalyDetector::new()),
            Arc::new(TemporalSpatialChecker::new()),
        ];
        Self {
            config,
            modules,
            cross_modal: CrossModalChecker::new(),
            registry: SensorRegistryManager::new(storage),
        }
    }

    /// 内存注册表，生命周期跟随本实例
    pub fn in_memory(config: EngineConfig) -> Self {
        Self::new(config, Arc::new(MemoryRegistryStorage::new()))
    }

    pub fn registry(&self) -> &SensorRegistryManager {
        &self.registry
    }

    /// 核心入口：总是返回报告
    pub async fn verify(&self, metadata: DatasetMetadata, buffer: Vec<u8>) -> VerificationReport {
        self.verify_with(&self.config, metadata, buffer).await
    }

    /// 按大小档位确证：元数据档只看头部，采样档按块降采样
    pub async fn verify_tiered(&self, metadata: DatasetMetadata, buffer: &[u8]) -> VerificationReport {
        let tier = VerificationTier::for_size(buffer.len() as u64);
        tracing::debug!(dataset = %metadata.id, bytes = buffer.len(), tier = tier.as_str(), "选择确证档位");
        let config = tier.apply(&self.config);
        self.verify_with(&config, metadata, tier.prepare(buffer).into_owned()).await
    }

    async fn verify_with(&self, config: &EngineConfig, metadata: DatasetMetadata, buffer: Vec<u8>) -> VerificationReport {
        let started = Instant::now();
        let dataset_id = metadata.id.clone();
        let budget = Duration::from_millis(config.timeout_ms);

        let report = match tokio::time::timeout(budget, self.run(config, metadata, buffer, started)).await {
            Ok(Ok(report)) => report,
            Ok(Err(e)) => {
                tracing::warn!(dataset = %dataset_id, error = %e, "确证失败，返回降级报告");
                fallback_report(&dataset_id, &e.to_string(), started.elapsed())
            }
            Err(_) => {
                tracing::warn!(dataset = %dataset_id, timeout_ms = config.timeout_ms, "确证超时，返回降级报告");
                fallback_report(
                    &dataset_id,
                    &format!("超出时间预算 {}ms", config.timeout_ms),
                    started.elapsed(),
                )
            }
        };

        tracing::info!(
            dataset = %report.dataset_id,
            verdict = %report.verdict,
            confidence = report.overall_confidence,
            anomalies = report.anomalies.len(),
            duration_ms = report.total_duration_ms,
            "确证完成"
        );
        report
    }

    /// 最小上传描述入口：推断传感器后交给 [`verify`](Self::verify)
    pub async fn verify_inline(&self, descriptor: &UploadDescriptor, buffer: Vec<u8>) -> VerificationReport {
        let metadata = upload::build_metadata(descriptor, &buffer);
        tracing::debug!(
            dataset = %metadata.id,
            sensors = ?metadata.source.sensor_types,
            "inline 上传已推断传感器"
        );
        self.verify(metadata, buffer).await
    }

    async fn run_core(&self, config: &EngineConfig, input: &Arc<AnalysisInput>) -> Vec<ModuleResult> {
        let mut results = Vec::with_capacity(self.modules.len());
        if config.parallel_processing {
            let handles: Vec<_> = self
                .modules
                .iter()
                .map(|module| {
                    let (module, input) = (module.clone(), input.clone());
                    let name = module.name();
                    (name, tokio::task::spawn_blocking(move || run_module(module.as_ref(), &input)))
                })
                .collect();
            for (name, handle) in handles {
                results.push(joined(name, handle.await));
            }
        } else {
            for module in &self.modules {
                let name = module.name();
                let (module, input) = (module.clone(), input.clone());
                let outcome = tokio::task::spawn_blocking(move || run_module(module.as_ref(), &input)).await;
                results.push(joined(name, outcome));
            }
        }
        results.sort_by_key(|r| r.module);
        results
    }

    async fn run_challenge(&self, config: &EngineConfig, input: &Arc<AnalysisInput>) -> ModuleResult {
        let module = ModuleName::ChallengeResponse;
        let seed = challenge_seed(config, &input.input_hash);
        let probes = ChallengeConfig {
            noise_sigma: config.noise_sigma,
            jpeg_quality: config.jpeg_quality,
            ..Default::default()
        };
        let started = Instant::now();
        let mut result = match ChallengeResponder::new(probes, seed).respond(input.clone()).await {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(module = %module, error = %e, "挑战-响应失败，按零置信度处理");
                ModuleResult::failed(module, e)
            }
        };
        result.processing_time_us = started.elapsed().as_micros() as u64;
        result.completed_at = Some(Instant::now());
        result.input_hash = Some(input.input_hash.clone());
        result.preconditions = vec![
            format!("buffer_len={}", input.buffer.len()),
            format!("seed={}", seed),
        ];
        result
    }

    async fn run_cross_modal(&self, input: &Arc<AnalysisInput>) -> ModuleResult {
        let module = ModuleName::CrossModal;
        let (checker, task_input) = (self.cross_modal, input.clone());
        let started = Instant::now();
        let outcome = tokio::task::spawn_blocking(move || checker.check(&task_input)).await;
        let mut result = match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                tracing::warn!(module = %module, error = %e, "跨模态检查失败，按零置信度处理");
                ModuleResult::failed(module, e)
            }
            Err(e) => joined(module, Err(e)),
        };
        result.processing_time_us = started.elapsed().as_micros() as u64;
        result.completed_at = Some(Instant::now());
        result.input_hash = Some(input.input_hash.clone());
        result.preconditions = vec![format!(
            "sensors={}",
            input
                .metadata
                .source
                .sensor_types
                .iter()
                .map(|s| s.as_str())
                .collect::<Vec<_>>()
                .join(",")
        )];
        result
    }

    /// 信誉更新失败只记录日志，报告里不带信誉
    async fn update_reputation(
        &self,
        input: &AnalysisInput,
        verdict: Verdict,
        confidence: f64,
    ) -> (Option<String>, Option<ReputationScore>) {
        let profile = SignalProfile::observe(&input.buffer);
        let fingerprint = match self.registry.generate_fingerprint(&input.metadata, &profile) {
            Ok(fp) => fp,
            Err(e) => {
                tracing::warn!(error = %e, "生成传感器指纹失败");
                return (None, None);
            }
        };
        let meta = &input.metadata;
        match self
            .registry
            .update_registry(&fingerprint, &meta.id, &meta.uploader_id, verdict, confidence, meta)
            .await
        {
            Ok(reputation) => (Some(fingerprint), Some(reputation)),
            Err(e) => {
                tracing::warn!(fingerprint = %fingerprint, error = %e, "注册表存储失败，报告中省略信誉");
                (Some(fingerprint), None)
            }
        }
    }

    async fn run(
        &self,
        config: &EngineConfig,
        metadata: DatasetMetadata,
        buffer: Vec<u8>,
        started: Instant,
    ) -> anyhow::Result<VerificationReport> {
        metadata.validate()?;
        config.validate()?;

        let buffer = match config.sample_rate {
            Some(rate) if rate > 1 => {
                let sampled = signal::subsample_chunks(&buffer, rate);
                tracing::debug!(original = buffer.len(), sampled = sampled.len(), rate, "按块降采样");
                sampled
            }
            _ => buffer,
        };
        let input = Arc::new(AnalysisInput::new(metadata, buffer));
        let audit_builder = config
            .enable_audit_chain
            .then(|| AuditChainBuilder::new(input.input_hash.clone()));

        // 1. 核心模块
        let mut results = self.run_core(config, &input).await;

        // 2. 条件模块
        if config.enable_challenge_response {
            results.push(self.run_challenge(config, &input).await);
        }
        let distinct_sensors: BTreeSet<_> = input.metadata.source.sensor_types.iter().collect();
        if config.enable_cross_modal && distinct_sensors.len() >= 2 {
            results.push(self.run_cross_modal(&input).await);
        }

        // 3. 汇总
        let total = results.len().max(1) as f64;
        let avg_score = clamp_score(results.iter().map(|r| r.score).sum::<f64>() / total);
        let avg_confidence = clamp_confidence(results.iter().map(|r| r.confidence).sum::<f64>() / total);
        let anomalies: Vec<VerificationAnomaly> = results.iter().flat_map(|r| r.anomalies.iter().cloned()).collect();
        let verdict = decide_verdict(avg_score, avg_confidence, &anomalies, config.effective_threshold());
        let score_of = |m: ModuleName| results.iter().find(|r| r.module == m).map(|r| r.score);

        // 4. 信誉
        let (sensor_fingerprint, reputation) = if config.enable_reputation {
            self.update_reputation(&input, verdict, avg_confidence).await
        } else {
            (None, None)
        };

        // 5. 审计链 + 可复现哈希
        let audit_chain = match audit_builder {
            Some(mut builder) => {
                for result in &results {
                    builder.record(result)?;
                }
                builder.finalize()?
            }
            None => AuditChain::empty(),
        };
        let module_scores: Vec<(ModuleName, f64)> = results.iter().map(|r| (r.module, r.score)).collect();
        let reproducibility_hash = audit::reproducibility_hash(
            &input.metadata.id,
            &input.input_hash,
            &module_scores,
            &audit_chain.merkle_root,
        )?;

        Ok(VerificationReport {
            dataset_id: input.metadata.id.clone(),
            verdict,
            overall_confidence: avg_confidence,
            quality_score: quality_score(&anomalies, &config.anomaly_weights),
            metadata_score: score_of(ModuleName::MetadataValidator).unwrap_or(0.0),
            source_match_score: score_of(ModuleName::SensorSignature).unwrap_or(0.0),
            cross_modal_score: score_of(ModuleName::CrossModal),
            challenge_response_score: score_of(ModuleName::ChallengeResponse),
            explanation: explain(verdict, avg_score, avg_confidence, &results, &anomalies),
            badges: badges(verdict, avg_score, &anomalies),
            anomalies,
            module_results: results,
            timestamp: Utc::now(),
            total_duration_ms: started.elapsed().as_millis() as u64,
            audit_chain,
            reproducibility_hash,
            sensor_fingerprint,
            reputation,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DatasetCategory, DeclaredSource, SensorType};
    use crate::registry::SensorRegistry;
    use async_trait::async_trait;

    fn anomaly(severity: Severity) -> VerificationAnomaly {
        VerificationAnomaly::new(ModuleName::AnomalyDetector, AnomalyKind::EmbeddingOutlier, severity, 0.8, "x")
    }

    fn meta(id: &str, sensors: Vec<SensorType>, size: u64) -> DatasetMetadata {
        DatasetMetadata {
            id: id.into(),
            title: String::new(),
            category: DatasetCategory::Other,
            source: DeclaredSource {
                device_model: Some("unitree-go2".into()),
                sensor_types: sensors,
                ..Default::default()
            },
            file_size: size,
            file_format: "bag".into(),
            upload_timestamp: Utc::now(),
            uploader_id: "alice".into(),
            telemetry: None,
        }
    }

    fn noisy(len: usize) -> Vec<u8> {
        let mut x: u64 = 0x853C_49E6_748F_EA9B;
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
    fn verdict_rules_in_order() {
        assert_eq!(decide_verdict(9.5, 0.95, &[], 0.6), Verdict::Authentic);
        assert_eq!(decide_verdict(7.0, 0.95, &[], 0.6), Verdict::LikelyAuthentic);
        assert_eq!(decide_verdict(9.0, 0.7, &[], 0.6), Verdict::LikelyAuthentic);
        assert_eq!(decide_verdict(4.9, 0.95, &[], 0.6), Verdict::Suspicious);
        assert_eq!(decide_verdict(9.0, 0.55, &[], 0.6), Verdict::Suspicious);
        let highs = vec![anomaly(Severity::High); 3];
        assert_eq!(decide_verdict(9.0, 0.95, &highs, 0.6), Verdict::LikelySynthetic);
        assert_eq!(decide_verdict(9.0, 0.95, &highs[..2], 0.6), Verdict::Authentic);
        assert_eq!(decide_verdict(9.0, 0.95, &[anomaly(Severity::Critical)], 0.6), Verdict::Synthetic);
    }

    #[test]
    fn adding_a_critical_never_passes() {
        for score in [0.0, 5.0, 8.0, 10.0] {
            for conf in [0.0, 0.6, 0.85, 1.0] {
                for base in [vec![], vec![anomaly(Severity::Low)], vec![anomaly(Severity::High)]] {
                    let mut with_critical = base.clone();
                    with_critical.push(anomaly(Severity::Critical));
                    assert!(!decide_verdict(score, conf, &with_critical, 0.6).is_passing());
                }
            }
        }
    }

    #[test]
    fn badges_and_quality() {
        let b = badges(Verdict::Authentic, 9.2, &[]);
        assert_eq!(b, vec![BADGE_VERIFIED_SOURCE, BADGE_HIGH_FIDELITY, BADGE_NO_ANOMALIES]);
        let b = badges(Verdict::Suspicious, 4.0, &[anomaly(Severity::High)]);
        assert_eq!(b, vec![BADGE_QUALITY_ISSUES]);

        let w = AnomalyWeights::default();
        assert_eq!(quality_score(&[], &w), 10.0);
        assert_eq!(quality_score(&[anomaly(Severity::Critical), anomaly(Severity::Low)], &w), 5.5);
        assert_eq!(quality_score(&vec![anomaly(Severity::Critical); 5], &w), 0.0);
    }

    #[test]
    fn seed_comes_from_config_or_hash() {
        let mut c = EngineConfig::default();
        assert_eq!(challenge_seed(&c, "00000000000000ff0000"), 255);
        c.rng_seed = Some(7);
        assert_eq!(challenge_seed(&c, "00000000000000ff0000"), 7);
    }

    #[tokio::test]
    async fn invalid_metadata_yields_fallback() {
        let engine = VerificationEngine::in_memory(EngineConfig::default());
        let mut m = meta("", vec![SensorType::Camera], 10);
        m.uploader_id = "alice".into();
        let r = engine.verify(m, vec![1, 2, 3]).await;
        assert_eq!(r.verdict, Verdict::Suspicious);
        assert_eq!(r.anomalies.len(), 1);
        assert_eq!(r.anomalies[0].severity, Severity::Critical);
        assert_eq!(r.anomalies[0].kind, AnomalyKind::QualityIssue);
        assert!(r.audit_chain.is_empty());
        assert_eq!(r.overall_confidence, 0.0);
        assert!(r.module_results.is_empty());
    }

    #[tokio::test]
    async fn exceeding_the_budget_yields_fallback() {
        let config = EngineConfig {
            timeout_ms: 0,
            ..Default::default()
        };
        let engine = VerificationEngine::in_memory(config);
        let r = engine
            .verify(meta("slow", vec![SensorType::Camera, SensorType::Imu], 8 << 20), noisy(8 << 20))
            .await;
        assert_eq!(r.verdict, Verdict::Suspicious);
        assert!(r.anomalies[0].description.contains("超出时间预算"));
    }

    #[tokio::test]
    async fn empty_buffer_degrades_modules_not_the_run() {
        let engine = VerificationEngine::in_memory(EngineConfig::default());
        let r = engine.verify(meta("empty", vec![SensorType::Camera], 0), Vec::new()).await;
        assert!(!r.module_results.is_empty());
        let sig = r
            .module_results
            .iter()
            .find(|m| m.module == ModuleName::SensorSignature)
            .unwrap();
        assert_eq!(sig.confidence, 0.0);
        assert!(!r.audit_chain.is_empty());
    }

    struct BrokenStorage;

    #[async_trait]
    impl RegistryStorage for BrokenStorage {
        async fn get(&self, _: &str) -> anyhow::Result<Option<SensorRegistry>> {
            anyhow::bail!("backend offline")
        }
        async fn set(&self, _: &str, _: &SensorRegistry) -> anyhow::Result<()> {
            anyhow::bail!("backend offline")
        }
        async fn get_by_uploader(&self, _: &str) -> anyhow::Result<Vec<SensorRegistry>> {
            anyhow::bail!("backend offline")
        }
    }

    #[tokio::test]
    async fn storage_errors_only_drop_reputation() {
        let engine = VerificationEngine::new(EngineConfig::default(), Arc::new(BrokenStorage));
        let r = engine
            .verify(meta("ds", vec![SensorType::Camera], 2 << 20), noisy(2 << 20))
            .await;
        assert!(r.reputation.is_none());
        assert!(r.sensor_fingerprint.is_some());
        assert!(!r.module_results.is_empty());
        assert_ne!(r.anomalies.first().map(|a| a.module), Some(ModuleName::Orchestrator));
    }

    #[tokio::test]
    async fn audit_steps_cover_module_processing_time() {
        let config = EngineConfig {
            parallel_processing: false,
            rng_seed: Some(11),
            ..Default::default()
        };
        let engine = VerificationEngine::in_memory(config);
        let r = engine
            .verify(meta("timed", vec![SensorType::Camera, SensorType::Imu], 2 << 20), noisy(2 << 20))
            .await;
        assert_eq!(r.audit_chain.steps.len(), r.module_results.len());

        // 串行执行：每一步都从上一步完成后才开始
        for (step, result) in r.audit_chain.steps.iter().zip(&r.module_results) {
            assert_eq!(step.module, result.module);
            assert!(
                step.duration_us >= result.processing_time_us,
                "{}: {} < {}",
                step.module,
                step.duration_us,
                result.processing_time_us
            );
            assert!(step.timestamp >= r.audit_chain.started_at);
        }
        let total_us: u64 = r.audit_chain.steps.iter().map(|s| s.duration_us).sum();
        let processing_us: u64 = r.module_results.iter().map(|m| m.processing_time_us).sum();
        assert!(total_us >= processing_us);
        assert!(total_us <= r.total_duration_ms * 1000 + 1000);
    }

    #[tokio::test]
    async fn optional_modules_follow_config() {
        let config = EngineConfig {
            enable_challenge_response: false,
            enable_reputation: false,
            enable_audit_chain: false,
            ..Default::default()
        };
        let engine = VerificationEngine::in_memory(config);
        let r = engine
            .verify(meta("ds", vec![SensorType::Camera], 2 << 20), noisy(2 << 20))
            .await;
        let modules: Vec<ModuleName> = r.module_results.iter().map(|m| m.module).collect();
        assert_eq!(
            modules,
            vec![
                ModuleName::MetadataValidator,
                ModuleName::SensorSignature,
                ModuleName::AnomalyDetector,
                ModuleName::TemporalSpatial,
            ]
        );
        assert!(r.challenge_response_score.is_none());
        assert!(r.cross_modal_score.is_none());
        assert!(r.reputation.is_none());
        assert!(r.audit_chain.is_empty());
    }
}
