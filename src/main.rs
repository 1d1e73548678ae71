use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use sensor_verify::{
    api,
    config::{RegistryBackend, ServiceConfig},
    DatasetMetadata, EngineConfig, MemoryRegistryStorage, RegistryStorage, SensorType, Severity,
    SledRegistryStorage, UploadDescriptor, VerificationEngine, VerificationReport,
};

#[derive(Parser)]
#[command(name = "sensor-verify", version, about = "物理 AI 传感器数据集确证")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// 确证本地文件
    Verify {
        file: PathBuf,
        /// 完整元数据 JSON 文件
        #[arg(long)]
        metadata: Option<PathBuf>,
        /// 声明的传感器，逗号分隔（如 camera,lidar,imu）
        #[arg(long, value_delimiter = ',')]
        sensors: Vec<SensorType>,
        /// 声明的设备型号
        #[arg(long)]
        device: Option<String>,
        /// 输出原始 JSON 报告
        #[arg(long)]
        json: bool,
        /// 引擎配置 JSON 文件
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// 启动 HTTP 服务
    Serve {
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn load_engine_config(path: Option<&PathBuf>) -> anyhow::Result<EngineConfig> {
    match path {
        Some(p) => EngineConfig::from_json_file(p),
        None => Ok(EngineConfig::default()),
    }
}

fn open_storage(config: &ServiceConfig) -> anyhow::Result<Arc<dyn RegistryStorage>> {
    Ok(match config.registry_backend {
        RegistryBackend::Sled => Arc::new(SledRegistryStorage::open(&config.registry_path)?),
        RegistryBackend::Memory => Arc::new(MemoryRegistryStorage::new()),
    })
}

fn severity_icon(severity: Severity) -> &'static str {
    match severity {
        Severity::Critical => "🟥",
        Severity::High => "🟧",
        Severity::Medium => "🟨",
        Severity::Low => "⬜",
    }
}

fn render(report: &VerificationReport) {
    let icon = if report.verdict.is_passing() { "✅" } else { "❌" };
    println!("{} 判决: {}  (置信度 {:.0}%)", icon, report.verdict, report.overall_confidence * 100.0);
    println!("📦 数据集: {}", report.dataset_id);
    println!(
        "📊 质量 {:.1} | 元数据 {:.1} | 来源匹配 {:.1}",
        report.quality_score, report.metadata_score, report.source_match_score
    );
    if let Some(s) = report.challenge_response_score {
        println!("   挑战-响应: {:.1}", s);
    }
    if let Some(s) = report.cross_modal_score {
        println!("   跨模态: {:.1}", s);
    }
    if !report.badges.is_empty() {
        println!("🏅 {}", report.badges.join(" · "));
    }
    if report.anomalies.is_empty() {
        println!("🔍 未发现异常");
    } else {
        println!("🔍 异常 ({}):", report.anomalies.len());
        for a in &report.anomalies {
            println!("   {} [{}] {}: {}", severity_icon(a.severity), a.module, a.severity, a.description);
        }
    }
    if let Some(fp) = &report.sensor_fingerprint {
        match &report.reputation {
            Some(r) => println!("🆔 指纹 {} | 信誉 {} ({} 次上传)", fp, r.grade, r.upload_count),
            None => println!("🆔 指纹 {}", fp),
        }
    }
    println!("🌳 Merkle Root: {}", report.audit_chain.merkle_root);
    println!("♻️  Reproducibility: {}", report.reproducibility_hash);
    println!("📝 {}", report.explanation);
    println!("⏱️  {} ms", report.total_duration_ms);
}

async fn run_verify(
    file: PathBuf,
    metadata: Option<PathBuf>,
    sensors: Vec<SensorType>,
    device: Option<String>,
    json: bool,
    config: Option<PathBuf>,
) -> anyhow::Result<bool> {
    let engine_config = load_engine_config(config.as_ref())?;
    let buffer = tokio::fs::read(&file).await?;
    let engine = VerificationEngine::in_memory(engine_config);

    let report = match metadata {
        Some(path) => {
            let raw = tokio::fs::read_to_string(&path).await?;
            let metadata: DatasetMetadata = serde_json::from_str(&raw)?;
            engine.verify_tiered(metadata, &buffer).await
        }
        None => {
            let descriptor = UploadDescriptor {
                filename: file
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_default(),
                uploader_id: "local".to_string(),
                ..Default::default()
            };
            let mut metadata = sensor_verify::upload::build_metadata(&descriptor, &buffer);
            if !sensors.is_empty() {
                metadata.source.sensor_types = sensors;
            }
            metadata.source.device_model = device;
            engine.verify_tiered(metadata, &buffer).await
        }
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        render(&report);
    }
    Ok(report.verdict.is_passing())
}

async fn run_serve(config: Option<PathBuf>) -> anyhow::Result<()> {
    // ----------------------------------------------------------------
    // 0. 服务配置（环境变量）+ 引擎配置（JSON）
    // ----------------------------------------------------------------
    let service = ServiceConfig::from_env()?;
    let engine_config = load_engine_config(config.as_ref())?;
    println!(
        "⚙️  配置加载完成: Host={}:{}, Registry={:?} @ {}",
        service.host, service.port, service.registry_backend, service.registry_path
    );

    // ----------------------------------------------------------------
    // 1. 注册表 & 编排器
    // ----------------------------------------------------------------
    println!("🛡️ 传感器数据集确证服务启动中...");
    let storage = open_storage(&service)?;
    let engine = Arc::new(VerificationEngine::new(engine_config, storage));
    println!("📚 传感器注册表初始化完成");

    // ----------------------------------------------------------------
    // 2. 启动 HTTP 服务
    // ----------------------------------------------------------------
    let app = api::app(Arc::new(api::AppState { engine }));
    let addr = format!("{}:{}", service.host, service.port);
    let listener = TcpListener::bind(&addr).await?;

    println!("🚀 API 服务已运行在: http://{}", addr);
    println!("   - POST /verify                : 原始字节 + {} 头", api::METADATA_HEADER);
    println!("   - POST /verify/inline         : ?filename=&mime=&uploader=");
    println!("   - GET  /registry/{{fingerprint}} : 指纹注册表");
    println!("   - GET  /reputation/{{uploader}}  : 上传者信誉");

    axum::serve(listener, app).await?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr) // stdout 留给报告
        .init();

    match Cli::parse().command {
        Command::Verify {
            file,
            metadata,
            sensors,
            device,
            json,
            config,
        } => {
            let passing = run_verify(file, metadata, sensors, device, json, config).await?;
            if !passing {
                std::process::exit(1);
            }
        }
        Command::Serve { config } => run_serve(config).await?,
    }
    Ok(())
}
