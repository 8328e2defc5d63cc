// Web服务器模块

pub mod handlers;
pub mod state;
pub mod websocket;

pub use state::AppState;

use axum::{
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

/// 健康检查响应结构
#[derive(Serialize)]
struct HealthResponse {
    status: String,
    service: String,
}

/// 健康检查处理器
async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        service: "odm-dashboard-rust".to_string(),
    })
}

/// 构建完整路由
pub fn build_router(app_state: AppState) -> Router {
    // 配置中间件层
    let middleware = ServiceBuilder::new()
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    // API 路由
    let api_routes = Router::new()
        .route(
            "/projects/:project_id/upload",
            get(handlers::get_upload).delete(handlers::reset_upload),
        )
        .route(
            "/projects/:project_id/upload/files",
            post(handlers::add_upload_files),
        )
        .route(
            "/projects/:project_id/upload/task",
            post(handlers::start_upload_task),
        )
        .route(
            "/projects/:project_id/upload/cancel",
            post(handlers::cancel_upload),
        )
        .route("/ws", get(websocket::handle_websocket))
        .with_state(app_state);

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/health", get(health_check))
        .layer(middleware)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::error::{ProjectId, RepositoryError};
    use crate::repository::{TaskParams, TaskRepository, UploadAck};
    use crate::uploader::{ProgressReporter, UploadFile};
    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use serde_json::{json, Value};
    use std::io::Write;
    use std::sync::Arc;
    use tower::ServiceExt;

    /// 创建任务总是返回 503
    struct UnavailableRepository;

    #[async_trait]
    impl TaskRepository for UnavailableRepository {
        async fn create_task(
            &self,
            _project_id: ProjectId,
            _params: &TaskParams,
        ) -> Result<Value, RepositoryError> {
            Err(RepositoryError::Status {
                status: 503,
                body: "maintenance".to_string(),
            })
        }

        async fn upload_file(
            &self,
            _endpoint: &str,
            file: &UploadFile,
            _progress: ProgressReporter,
        ) -> Result<UploadAck, RepositoryError> {
            Ok(UploadAck::accepted(file.name.clone(), file.size))
        }

        async fn commit_task(
            &self,
            _project_id: ProjectId,
            task_id: &str,
        ) -> Result<Value, RepositoryError> {
            Ok(json!({ "id": task_id }))
        }
    }

    fn app() -> Router {
        let state = AppState::with_repository(AppConfig::default(), Arc::new(UnavailableRepository));
        build_router(state)
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_check() {
        let response = app()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "ok");
    }

    #[tokio::test]
    async fn test_get_missing_session() {
        let response = app()
            .oneshot(
                Request::builder()
                    .uri("/api/v1/projects/7/upload")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["code"], handlers::error_codes::SESSION_NOT_FOUND);
        assert!(body.get("data").is_none());
    }

    #[tokio::test]
    async fn test_add_files_then_task_creation_failure() {
        let app = app();
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("DJI_0001.JPG");
        std::fs::File::create(&image)
            .unwrap()
            .write_all(&[0u8; 128])
            .unwrap();
        let notes = dir.path().join("notes.doc");
        std::fs::write(&notes, b"x").unwrap();

        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/api/v1/projects/1/upload/files",
                json!({ "paths": [image, notes] }),
            ))
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["code"], 0);
        assert_eq!(body["data"]["rejected"].as_array().unwrap().len(), 1);
        assert_eq!(body["data"]["snapshot"]["total_count"], 1);
        assert_eq!(body["data"]["snapshot"]["total_bytes"], 128);

        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/api/v1/projects/1/upload/task",
                json!({ "name": "Survey" }),
            ))
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["code"], handlers::error_codes::TASK_CREATION_FAILED);
        assert_eq!(body["message"], "Cannot create new task. Please try again later.");

        // 创建失败后文件被清空，会话回到编辑状态
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/v1/projects/1/upload")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["data"]["total_count"], 0);
        assert_eq!(body["data"]["phase"], "editing");
        assert_eq!(
            body["data"]["error"],
            "Cannot create new task. Please try again later."
        );
    }

    #[tokio::test]
    async fn test_add_empty_file_list() {
        let response = app()
            .oneshot(json_request(
                "POST",
                "/api/v1/projects/1/upload/files",
                json!({ "paths": [] }),
            ))
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["code"], handlers::error_codes::NO_FILES);
    }
}
