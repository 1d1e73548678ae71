//! 传感器注册表与信誉模型
//!
//! 每个指纹对应一份 [`SensorRegistry`]：累计统计、当前信誉、最近 100 次判决的环形历史。
//! 同一指纹的读-改-写由指纹级互斥锁串行化，不同指纹之间互不阻塞。

pub mod storage;

pub use storage::{MemoryRegistryStorage, RegistryStorage, SledRegistryStorage};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use crate::model::{DatasetMetadata, SensorType, Verdict};
use crate::modules::SignalProfile;
use crate::signal;

pub const HISTORY_CAP: usize = 100;
const CONFIDENCE_WINDOW: usize = 20;
const PROVISIONAL_UPLOADS: u64 = 5;
const BURST_WINDOW_MINUTES: i64 = 60;
const BURST_LIMIT: usize = 10;

pub const FLAG_HIGH_SYNTHETIC_RATE: &str = "high synthetic rate";
pub const FLAG_HIGH_ANOMALY_RATE: &str = "high anomaly rate";
pub const FLAG_LOW_CONFIDENCE_VOLUME: &str = "high volume with low confidence";
pub const FLAG_BURST: &str = "burst upload pattern";
pub const FLAG_BOT_LIKE: &str = "bot-like regular upload intervals";
pub const FLAG_QUALITY_DROP: &str = "recent quality drop";

// ==========================================
// 1. 信誉等级 (Grade)
// ==========================================

/// 严格有序：F < D < C < B < B+ < A < A+
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Grade {
    F,
    D,
    C,
    B,
    #[serde(rename = "B+")]
    BPlus,
    A,
    #[serde(rename = "A+")]
    APlus,
}

impl Grade {
    pub fn from_weighted(score: f64) -> Self {
        match score {
            s if s >= 0.95 => Grade::APlus,
            s if s >= 0.85 => Grade::A,
            s if s >= 0.75 => Grade::BPlus,
            s if s >= 0.65 => Grade::B,
            s if s >= 0.50 => Grade::C,
            s if s >= 0.35 => Grade::D,
            _ => Grade::F,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Grade::F => "F",
            Grade::D => "D",
            Grade::C => "C",
            Grade::B => "B",
            Grade::BPlus => "B+",
            Grade::A => "A",
            Grade::APlus => "A+",
        }
    }
}

impl fmt::Display for Grade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ==========================================
// 2. 注册表实体
// ==========================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReputationScore {
    pub fingerprint: String,
    pub uploader_id: String,
    pub upload_count: u64,
    pub avg_confidence: f64,
    pub synthetic_rate: f64,
    pub anomaly_rate: f64,
    pub grade: Grade,
    pub flags: BTreeSet<String>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub dataset_id: String,
    pub uploader_id: String,
    pub verdict: Verdict,
    pub confidence: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistryStats {
    pub upload_count: u64,
    pub synthetic_count: u64,
    pub suspicious_count: u64,
    pub confidence_sum: f64,
    pub first_seen: Option<DateTime<Utc>>,
    pub last_seen: Option<DateTime<Utc>>,
}

impl RegistryStats {
    fn record(&mut self, verdict: Verdict, confidence: f64, at: DateTime<Utc>) {
        self.upload_count += 1;
        if verdict.is_synthetic() {
            self.synthetic_count += 1;
        } else if matches!(verdict, Verdict::Suspicious | Verdict::Tampered) {
            self.suspicious_count += 1;
        }
        self.confidence_sum += confidence;
        self.first_seen = Some(self.first_seen.map_or(at, |f| f.min(at)));
        self.last_seen = Some(self.last_seen.map_or(at, |l| l.max(at)));
    }

    fn from_history<'a>(entries: impl Iterator<Item = &'a HistoryEntry>) -> Self {
        let mut stats = Self::default();
        for e in entries {
            stats.record(e.verdict, e.confidence, e.timestamp);
        }
        stats
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorRegistry {
    pub fingerprint: String,
    pub device_model: Option<String>,
    pub sensor_types: Vec<SensorType>,
    pub uploaders: BTreeSet<String>,
    pub stats: RegistryStats,
    pub reputation: Option<ReputationScore>,
    pub history: VecDeque<HistoryEntry>,
}

impl SensorRegistry {
    pub fn new(fingerprint: &str, device_model: Option<String>, sensor_types: Vec<SensorType>) -> Self {
        Self {
            fingerprint: fingerprint.to_string(),
            device_model,
            sensor_types,
            uploaders: BTreeSet::new(),
            stats: RegistryStats::default(),
            reputation: None,
            history: VecDeque::with_capacity(HISTORY_CAP),
        }
    }

    /// 追加一条历史，超过上限时丢弃最旧的一条
    pub fn push_history(&mut self, entry: HistoryEntry) {
        self.stats.record(entry.verdict, entry.confidence, entry.timestamp);
        self.uploaders.insert(entry.uploader_id.clone());
        if self.history.len() == HISTORY_CAP {
            self.history.pop_front();
        }
        self.history.push_back(entry);
    }
}

// ==========================================
// 3. 信誉计算（纯函数）
// ==========================================

/// 0.4·(1−合成率) + 0.3·(1−异常率) + 0.3·平均置信度
pub fn weighted_score(synthetic_rate: f64, anomaly_rate: f64, avg_confidence: f64) -> f64 {
    0.4 * (1.0 - synthetic_rate) + 0.3 * (1.0 - anomaly_rate) + 0.3 * avg_confidence
}

pub fn grade_for(upload_count: u64, synthetic_rate: f64, anomaly_rate: f64, avg_confidence: f64) -> Grade {
    if upload_count < PROVISIONAL_UPLOADS {
        Grade::B
    } else {
        Grade::from_weighted(weighted_score(synthetic_rate, anomaly_rate, avg_confidence))
    }
}

fn behavior_flags(history: &[&HistoryEntry]) -> BTreeSet<String> {
    let mut flags = BTreeSet::new();

    // 突发：最近一小时内超过 10 次
    if let Some(latest) = history.iter().map(|e| e.timestamp).max() {
        let window_start = latest - Duration::minutes(BURST_WINDOW_MINUTES);
        let recent = history.iter().filter(|e| e.timestamp >= window_start).count();
        if recent > BURST_LIMIT {
            flags.insert(FLAG_BURST.to_string());
        }
    }

    // 间隔过于规律：标准差 < 均值的 5%
    let mut times: Vec<DateTime<Utc>> = history.iter().map(|e| e.timestamp).collect();
    times.sort();
    let intervals: Vec<f64> = times
        .windows(2)
        .map(|w| (w[1] - w[0]).num_milliseconds() as f64 / 1000.0)
        .collect();
    if intervals.len() >= 5 {
        if let (Some(m), Some(sd)) = (signal::mean(&intervals), signal::std_dev(&intervals)) {
            if m > 0.0 && sd < 0.05 * m {
                flags.insert(FLAG_BOT_LIKE.to_string());
            }
        }
    }

    // 质量下滑：最近 5 次平均置信度比之前 10 次低 0.3 以上
    if history.len() >= 15 {
        let confidences: Vec<f64> = history.iter().map(|e| e.confidence).collect();
        let n = confidences.len();
        let recent = signal::mean(&confidences[n - 5..]);
        let prior = signal::mean(&confidences[n - 15..n - 5]);
        if let (Some(r), Some(p)) = (recent, prior) {
            if r < p - 0.3 {
                flags.insert(FLAG_QUALITY_DROP.to_string());
            }
        }
    }

    flags
}

/// 由累计统计 + 历史窗口推导信誉
pub fn compute_reputation(
    fingerprint: &str,
    uploader_id: &str,
    stats: &RegistryStats,
    history: &[&HistoryEntry],
) -> ReputationScore {
    let total = stats.upload_count.max(1) as f64;
    let synthetic_rate = stats.synthetic_count as f64 / total;
    let anomaly_rate = (stats.synthetic_count + stats.suspicious_count) as f64 / total;
    let window: Vec<f64> = history
        .iter()
        .rev()
        .take(CONFIDENCE_WINDOW)
        .map(|e| e.confidence)
        .collect();
    let avg_confidence = signal::mean(&window).unwrap_or(0.0);

    let mut flags = behavior_flags(history);
    if synthetic_rate > 0.3 {
        flags.insert(FLAG_HIGH_SYNTHETIC_RATE.to_string());
    }
    if anomaly_rate > 0.5 {
        flags.insert(FLAG_HIGH_ANOMALY_RATE.to_string());
    }
    if stats.upload_count > 50 && avg_confidence < 0.5 {
        flags.insert(FLAG_LOW_CONFIDENCE_VOLUME.to_string());
    }

    let now = Utc::now();
    ReputationScore {
        fingerprint: fingerprint.to_string(),
        uploader_id: uploader_id.to_string(),
        upload_count: stats.upload_count,
        avg_confidence,
        synthetic_rate,
        anomaly_rate,
        grade: grade_for(stats.upload_count, synthetic_rate, anomaly_rate, avg_confidence),
        flags,
        first_seen: stats.first_seen.unwrap_or(now),
        last_seen: stats.last_seen.unwrap_or(now),
    }
}

// ==========================================
// 4. 注册表管理器
// ==========================================

type LockMap = std::sync::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>;

/// 指纹级单写者：同一指纹的更新排队执行
pub struct SensorRegistryManager {
    storage: Arc<dyn RegistryStorage>,
    locks: LockMap,
}

/// 持有某个指纹的锁；释放时若已无其他等待者，就从锁表中移除
struct LockLease<'a> {
    locks: &'a LockMap,
    fingerprint: &'a str,
    lock: Arc<tokio::sync::Mutex<()>>,
}

impl Drop for LockLease<'_> {
    fn drop(&mut self) {
        let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        // 锁表一份 + 本租约一份
        if locks
            .get(self.fingerprint)
            .is_some_and(|l| Arc::ptr_eq(l, &self.lock) && Arc::strong_count(l) == 2)
        {
            locks.remove(self.fingerprint);
        }
    }
}

impl SensorRegistryManager {
    pub fn new(storage: Arc<dyn RegistryStorage>) -> Self {
        Self {
            storage,
            locks: std::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn generate_fingerprint(&self, metadata: &DatasetMetadata, signal: &SignalProfile) -> anyhow::Result<String> {
        crate::fingerprint::generate_fingerprint(metadata, signal)
    }

    fn lock_for<'a>(&'a self, fingerprint: &'a str) -> LockLease<'a> {
        let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let lock = locks
            .entry(fingerprint.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        LockLease {
            locks: &self.locks,
            fingerprint,
            lock,
        }
    }

    #[cfg(test)]
    fn held_locks(&self) -> usize {
        self.locks.lock().map(|l| l.len()).unwrap_or(0)
    }

    /// 读取或创建 → 追加历史 → 重算信誉 → 写回
    pub async fn update_registry(
        &self,
        fingerprint: &str,
        dataset_id: &str,
        uploader_id: &str,
        verdict: Verdict,
        confidence: f64,
        metadata: &DatasetMetadata,
    ) -> anyhow::Result<ReputationScore> {
        let lease = self.lock_for(fingerprint);
        let _guard = lease.lock.lock().await;

        let mut registry = match self.storage.get(fingerprint).await? {
            Some(existing) => existing,
            None => {
                tracing::info!(fingerprint, "首次见到该传感器指纹，创建注册表");
                SensorRegistry::new(
                    fingerprint,
                    metadata.source.device_model.clone(),
                    metadata.source.sensor_types.clone(),
                )
            }
        };

        registry.push_history(HistoryEntry {
            dataset_id: dataset_id.to_string(),
            uploader_id: uploader_id.to_string(),
            verdict,
            confidence: confidence.clamp(0.0, 1.0),
            timestamp: metadata.upload_timestamp,
        });

        let history: Vec<&HistoryEntry> = registry.history.iter().collect();
        let reputation = compute_reputation(fingerprint, uploader_id, &registry.stats, &history);
        registry.reputation = Some(reputation.clone());

        self.storage.set(fingerprint, &registry).await?;
        tracing::debug!(
            fingerprint,
            grade = %reputation.grade,
            uploads = reputation.upload_count,
            "注册表已更新"
        );
        Ok(reputation)
    }

    pub async fn get_registry(&self, fingerprint: &str) -> anyhow::Result<Option<SensorRegistry>> {
        self.storage.get(fingerprint).await
    }

    /// 上传者维度的聚合信誉：汇总该上传者在所有指纹历史中的记录
    pub async fn uploader_reputation(&self, uploader_id: &str) -> anyhow::Result<Option<ReputationScore>> {
        let registries = self.storage.get_by_uploader(uploader_id).await?;
        let mut entries: Vec<&HistoryEntry> = registries
            .iter()
            .flat_map(|r| r.history.iter())
            .filter(|e| e.uploader_id == uploader_id)
            .collect();
        if entries.is_empty() {
            return Ok(None);
        }
        entries.sort_by_key(|e| e.timestamp);
        let stats = RegistryStats::from_history(entries.iter().copied());
        Ok(Some(compute_reputation(
            &format!("uploader:{}", uploader_id),
            uploader_id,
            &stats,
            &entries,
        )))
    }
}
