// 上传 API 处理器

use crate::error::{ProjectId, TaskId, UploadError};
use crate::repository::TaskParams;
use crate::server::AppState;
use crate::uploader::{FileRejection, SessionSnapshot};
use axum::{
    extract::{Path, State},
    Json,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{error, info, warn};

use super::ApiResponse;

/// 业务响应码
pub mod error_codes {
    /// 参数错误
    pub const INVALID_PARAMS: i32 = 2001;
    /// 会话不存在
    pub const SESSION_NOT_FOUND: i32 = 2002;
    /// 会话正在上传
    pub const SESSION_BUSY: i32 = 2003;
    /// 当前阶段不允许该操作
    pub const INVALID_PHASE: i32 = 2004;
    /// 没有选择文件
    pub const NO_FILES: i32 = 2005;
    /// 创建任务失败
    pub const TASK_CREATION_FAILED: i32 = 2006;
    /// 上传已被取消
    pub const CANCELED: i32 = 2007;
    /// 其它上传错误
    pub const UPLOAD_FAILED: i32 = 2099;
}

/// 上传错误对应的业务响应码
pub fn error_code(err: &UploadError) -> i32 {
    match err {
        UploadError::Validation(_) => error_codes::INVALID_PARAMS,
        UploadError::SessionNotFound(_) => error_codes::SESSION_NOT_FOUND,
        UploadError::SessionBusy(_) => error_codes::SESSION_BUSY,
        UploadError::InvalidPhase { .. } => error_codes::INVALID_PHASE,
        UploadError::NoFiles => error_codes::NO_FILES,
        UploadError::Canceled(_) => error_codes::CANCELED,
        UploadError::TaskCreation(_) | UploadError::InvalidResponse(_) => {
            error_codes::TASK_CREATION_FAILED
        }
        UploadError::Commit(_)
        | UploadError::NothingUploaded(_)
        | UploadError::RetriesExhausted { .. } => error_codes::UPLOAD_FAILED,
    }
}

fn upload_error<T>(err: UploadError) -> Json<ApiResponse<T>> {
    Json(ApiResponse::error(error_code(&err), err.to_string()))
}

// ============================================
// 请求/响应结构
// ============================================

/// 添加文件请求
#[derive(Debug, Deserialize)]
pub struct AddFilesRequest {
    /// 本地文件路径
    pub paths: Vec<PathBuf>,
}

/// 添加文件响应
#[derive(Debug, Serialize)]
pub struct AddFilesResponse {
    /// 被拒绝的文件及原因
    pub rejected: Vec<FileRejection>,
    /// 添加后的会话快照
    pub snapshot: Option<SessionSnapshot>,
}

/// 创建任务响应
#[derive(Debug, Serialize)]
pub struct StartTaskResponse {
    pub task_id: TaskId,
}

// ============================================
// 处理器
// ============================================

/// GET /api/v1/projects/:project_id/upload
/// 获取项目的上传会话快照
pub async fn get_upload(
    State(app_state): State<AppState>,
    Path(project_id): Path<ProjectId>,
) -> Json<ApiResponse<SessionSnapshot>> {
    match app_state.upload_manager.snapshot(project_id).await {
        Some(snapshot) => Json(ApiResponse::success(snapshot)),
        None => upload_error(UploadError::SessionNotFound(project_id)),
    }
}

/// POST /api/v1/projects/:project_id/upload/files
/// 向上传会话添加本地文件
pub async fn add_upload_files(
    State(app_state): State<AppState>,
    Path(project_id): Path<ProjectId>,
    Json(req): Json<AddFilesRequest>,
) -> Json<ApiResponse<AddFilesResponse>> {
    info!("API: 项目 {} 添加 {} 个文件", project_id, req.paths.len());

    if req.paths.is_empty() {
        return upload_error(UploadError::NoFiles);
    }

    match app_state.upload_manager.add_paths(project_id, req.paths).await {
        Ok(rejected) => {
            if !rejected.is_empty() {
                warn!("项目 {} 有 {} 个文件被拒绝", project_id, rejected.len());
            }
            let snapshot = app_state.upload_manager.snapshot(project_id).await;
            Json(ApiResponse::success(AddFilesResponse { rejected, snapshot }))
        }
        Err(e) => {
            error!("添加文件失败: {}", e);
            upload_error(e)
        }
    }
}

/// POST /api/v1/projects/:project_id/upload/task
/// 创建任务并开始上传
pub async fn start_upload_task(
    State(app_state): State<AppState>,
    Path(project_id): Path<ProjectId>,
    Json(params): Json<TaskParams>,
) -> Json<ApiResponse<StartTaskResponse>> {
    info!("API: 项目 {} 创建任务 \"{}\"", project_id, params.name);

    match app_state.upload_manager.start_task(project_id, params).await {
        Ok(task_id) => Json(ApiResponse::success(StartTaskResponse { task_id })),
        Err(e) => {
            error!("创建任务失败: {}", e);
            upload_error(e)
        }
    }
}

/// POST /api/v1/projects/:project_id/upload/cancel
/// 取消上传并丢弃所有文件
pub async fn cancel_upload(
    State(app_state): State<AppState>,
    Path(project_id): Path<ProjectId>,
) -> Json<ApiResponse<String>> {
    match app_state.upload_manager.cancel(project_id).await {
        Ok(()) => Json(ApiResponse::success("上传已取消".to_string())),
        Err(e) => {
            warn!("取消上传失败: {}", e);
            upload_error(e)
        }
    }
}

/// DELETE /api/v1/projects/:project_id/upload
/// 移除空闲的上传会话
pub async fn reset_upload(
    State(app_state): State<AppState>,
    Path(project_id): Path<ProjectId>,
) -> Json<ApiResponse<String>> {
    match app_state.upload_manager.reset(project_id).await {
        Ok(()) => Json(ApiResponse::success("会话已移除".to_string())),
        Err(e) => upload_error(e),
    }
}
