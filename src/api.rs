use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::Json,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use crate::{
    engine::VerificationEngine,
    model::{DatasetMetadata, VerificationReport},
    registry::{ReputationScore, SensorRegistry},
    upload::UploadDescriptor,
};

/// 元数据 JSON 所在的请求头
pub const METADATA_HEADER: &str = "x-dataset-metadata";

// ==========================================
// 1. 共享编排器
// ==========================================
// 注册表写入已按指纹串行化，handler 之间不需要额外的锁。
pub struct AppState {
    pub engine: Arc<VerificationEngine>,
}

// ==========================================
// 2. 请求参数
// ==========================================

/// `/verify/inline` 的查询串：`?filename=&mime=&uploader=&title=`
#[derive(Deserialize)]
pub struct InlineQuery {
    pub filename: String,
    pub mime: Option<String>,
    pub uploader: String,
    pub title: Option<String>,
}

type ApiError = (StatusCode, String);

// ==========================================
// 3. 路由：两个确证入口 + 两个只读查询
// ==========================================
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/verify", post(verify_dataset))
        .route("/verify/inline", post(verify_inline))
        .route("/registry/{fingerprint}", get(get_registry))
        .route("/reputation/{uploader}", get(get_reputation))
        .layer(CorsLayer::permissive()) // 浏览器端上传工具直接调用
        .with_state(state)
}

// ==========================================
// 4. 确证与查询
// ==========================================
// 元数据错误在进入编排器前就返回 4xx；进入后一律 200 + 报告（含降级报告）。

/// 接口：原始字节 + 头部元数据
async fn verify_dataset(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<VerificationReport>, ApiError> {
    let raw = headers
        .get(METADATA_HEADER)
        .ok_or((StatusCode::BAD_REQUEST, format!("缺少请求头 {}", METADATA_HEADER)))?
        .to_str()
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
    let metadata: DatasetMetadata =
        serde_json::from_str(raw).map_err(|e| (StatusCode::BAD_REQUEST, format!("元数据格式错误: {}", e)))?;
    metadata
        .validate()
        .map_err(|e| (StatusCode::UNPROCESSABLE_ENTITY, e.to_string()))?;

    tracing::info!(dataset = %metadata.id, bytes = body.len(), "收到确证请求");
    let report = state.engine.verify_tiered(metadata, &body).await;
    Ok(Json(report))
}

/// 接口：只有文件名 / MIME / 上传者
async fn verify_inline(
    State(state): State<Arc<AppState>>,
    Query(q): Query<InlineQuery>,
    body: Bytes,
) -> Result<Json<VerificationReport>, ApiError> {
    let descriptor = UploadDescriptor {
        filename: q.filename,
        mime_type: q.mime,
        uploader_id: q.uploader,
        title: q.title,
    };
    let metadata = crate::upload::build_metadata(&descriptor, &body);
    tracing::info!(dataset = %metadata.id, bytes = body.len(), "收到确证请求");
    let report = state.engine.verify_tiered(metadata, &body).await;
    Ok(Json(report))
}

/// 接口：查询指纹注册表
async fn get_registry(
    State(state): State<Arc<AppState>>,
    Path(fingerprint): Path<String>,
) -> Result<Json<SensorRegistry>, ApiError> {
    state
        .engine
        .registry()
        .get_registry(&fingerprint)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
        .map(Json)
        .ok_or((StatusCode::NOT_FOUND, format!("未知指纹: {}", fingerprint)))
}

/// 接口：上传者聚合信誉
async fn get_reputation(
    State(state): State<Arc<AppState>>,
    Path(uploader): Path<String>,
) -> Result<Json<ReputationScore>, ApiError> {
    state
        .engine
        .registry()
        .uploader_reputation(&uploader)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
        .map(Json)
        .ok_or((StatusCode::NOT_FOUND, format!("未知上传者: {}", uploader)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;

    fn state() -> Arc<AppState> {
        Arc::new(AppState {
            engine: Arc::new(VerificationEngine::in_memory(EngineConfig::default())),
        })
    }

    #[tokio::test]
    async fn missing_metadata_header_is_bad_request() {
        let err = verify_dataset(State(state()), HeaderMap::new(), Bytes::from_static(b"abc"))
            .await
            .err()
            .unwrap();
        assert_eq!(err.0, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn inline_then_reputation_lookup() {
        let s = state();
        let q = InlineQuery {
            filename: "scan.pcd".into(),
            mime: None,
            uploader: "carol".into(),
            title: None,
        };
        let Json(report) = verify_inline(State(s.clone()), Query(q), Bytes::from(vec![0u8; 100]))
            .await
            .unwrap();
        assert!(report.dataset_id.starts_with("inline-"));

        let fp = report.sensor_fingerprint.clone().unwrap();
        assert!(get_registry(State(s.clone()), Path(fp)).await.is_ok());
        let Json(rep) = get_reputation(State(s.clone()), Path("carol".into())).await.unwrap();
        assert_eq!(rep.upload_count, 1);
        let missing = get_reputation(State(s), Path("nobody".into())).await.err().unwrap();
        assert_eq!(missing.0, StatusCode::NOT_FOUND);
    }
}
