//! 物理 AI 传感器数据集确证核心
//!
//! 输入原始字节缓冲区与上传者声明的元数据，输出可验证的真实性判决。

pub mod api;
pub mod audit;
pub mod config;
pub mod engine;
pub mod fingerprint;
pub mod model;
pub mod modules;
pub mod registry;
pub mod signal;
pub mod tier;
pub mod upload;

pub use audit::{AuditChain, AuditChainBuilder, ComputeTranscript};
pub use config::{EngineConfig, ServiceConfig};
pub use engine::{decide_verdict, VerificationEngine};
pub use model::{
    AnomalyKind, DatasetCategory, DatasetMetadata, DeclaredSource, GeoPoint, ModuleName, ModuleResult,
    SensorType, Severity, Telemetry, Verdict, VerificationAnomaly, VerificationReport,
};
pub use registry::{
    Grade, MemoryRegistryStorage, RegistryStorage, ReputationScore, SensorRegistry, SensorRegistryManager,
    SledRegistryStorage,
};
pub use tier::VerificationTier;
pub use upload::UploadDescriptor;
