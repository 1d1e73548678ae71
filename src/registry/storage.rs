use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use tokio::sync::RwLock;

use super::SensorRegistry;

/// 注册表存储边界
///
/// 核心只通过这三个方法读写，对后端（内存 / KV / 关系库）无感知。
#[async_trait]
pub trait RegistryStorage: Send + Sync {
    async fn get(&self, fingerprint: &str) -> anyhow::Result<Option<SensorRegistry>>;
    async fn set(&self, fingerprint: &str, registry: &SensorRegistry) -> anyhow::Result<()>;
    async fn get_by_uploader(&self, uploader_id: &str) -> anyhow::Result<Vec<SensorRegistry>>;
}

// ==========================================
// 1. 内存后端 (开发 / 测试)
// ==========================================

/// 纯内存实现，生命周期跟随所属的编排器实例
#[derive(Debug, Default)]
pub struct MemoryRegistryStorage {
    entries: RwLock<HashMap<String, SensorRegistry>>,
}

impl MemoryRegistryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[async_trait]
impl RegistryStorage for MemoryRegistryStorage {
    async fn get(&self, fingerprint: &str) -> anyhow::Result<Option<SensorRegistry>> {
        Ok(self.entries.read().await.get(fingerprint).cloned())
    }

    async fn set(&self, fingerprint: &str, registry: &SensorRegistry) -> anyhow::Result<()> {
        self.entries
            .write()
            .await
            .insert(fingerprint.to_string(), registry.clone());
        Ok(())
    }

    async fn get_by_uploader(&self, uploader_id: &str) -> anyhow::Result<Vec<SensorRegistry>> {
        let mut found: Vec<SensorRegistry> = self
            .entries
            .read()
            .await
            .values()
            .filter(|r| r.uploaders.contains(uploader_id))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.fingerprint.cmp(&b.fingerprint));
        Ok(found)
    }
}

// ==========================================
// 2. sled 后端 (持久化)
// ==========================================

/// sled 持久化实现
///
/// - `registries`: fingerprint -> JSON(SensorRegistry)
/// - `uploader_index`: "{uploader}\0{fingerprint}" -> ()
pub struct SledRegistryStorage {
    registries: sled::Tree,
    uploader_index: sled::Tree,
}

impl SledRegistryStorage {
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let db = sled::open(path)?;
        Ok(Self {
            registries: db.open_tree("registries")?,
            uploader_index: db.open_tree("uploader_index")?,
        })
    }

    fn index_key(uploader_id: &str, fingerprint: &str) -> Vec<u8> {
        let mut key = Vec::with_capacity(uploader_id.len() + fingerprint.len() + 1);
        key.extend_from_slice(uploader_id.as_bytes());
        key.push(0);
        key.extend_from_slice(fingerprint.as_bytes());
        key
    }
}

#[async_trait]
impl RegistryStorage for SledRegistryStorage {
    async fn get(&self, fingerprint: &str) -> anyhow::Result<Option<SensorRegistry>> {
        match self.registries.get(fingerprint.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn set(&self, fingerprint: &str, registry: &SensorRegistry) -> anyhow::Result<()> {
        let payload = serde_json::to_vec(registry)?;
        self.registries.insert(fingerprint.as_bytes(), payload)?;
        for uploader in &registry.uploaders {
            self.uploader_index
                .insert(Self::index_key(uploader, fingerprint), &[] as &[u8])?;
        }
        self.registries.flush_async().await?;
        self.uploader_index.flush_async().await?;
        Ok(())
    }

    async fn get_by_uploader(&self, uploader_id: &str) -> anyhow::Result<Vec<SensorRegistry>> {
        let mut prefix = uploader_id.as_bytes().to_vec();
        prefix.push(0);

        let fingerprints = self
            .uploader_index
            .scan_prefix(&prefix)
            .keys()
            .map(|key| -> anyhow::Result<String> {
                Ok(String::from_utf8_lossy(&key?[prefix.len()..]).to_string())
            })
            .collect::<anyhow::Result<Vec<String>>>()?;

        let mut found = Vec::with_capacity(fingerprints.len());
        for fingerprint in fingerprints {
            if let Some(registry) = self.get(&fingerprint).await? {
                found.push(registry);
            }
        }
        Ok(found)
    }
}
