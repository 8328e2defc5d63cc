// 任务创建闸门
//
// 在发送任何文件字节之前先创建远端任务，确保每个上传的字节都属于一个有效任务
// 与提交协调器相同，分为加锁的准备和完成两步，请求本身在锁外发送

use crate::error::{RepositoryError, TaskId, UploadError};
use crate::repository::{extract_task_id, TaskParams};
use crate::uploader::{SessionPhase, UploadSession};
use serde_json::Value;
use tracing::{error, info, warn};

/// 校验任务参数
pub fn validate_params(params: &TaskParams) -> Result<(), UploadError> {
    if params.name.trim().is_empty() {
        return Err(UploadError::Validation("Task name is required".to_string()));
    }
    if params.resize_to == Some(0) {
        return Err(UploadError::Validation(
            "Resize size must be a positive number of pixels".to_string(),
        ));
    }
    if params.options.iter().any(|o| o.name.trim().is_empty()) {
        return Err(UploadError::Validation(
            "Processing option names cannot be empty".to_string(),
        ));
    }
    Ok(())
}

/// 检查会话并冻结文件列表，成功后才能发送创建请求
///
/// 参数校验失败：会话保持 Editing，文件保留
pub fn prepare(session: &mut UploadSession, params: &TaskParams) -> Result<(), UploadError> {
    if session.phase() != SessionPhase::Editing {
        return Err(UploadError::InvalidPhase {
            current: session.phase(),
            operation: "create_task",
        });
    }
    if session.is_creating_task() {
        return Err(UploadError::SessionBusy(session.project_id()));
    }
    if session.is_empty() {
        return Err(UploadError::NoFiles);
    }
    if let Err(e) = validate_params(params) {
        session.set_error(e.to_string());
        return Err(e);
    }
    session.begin_task_creation()
}

/// 处理创建请求的结果并让会话进入 Uploading
///
/// - 请求失败或响应缺少 `id`：会话保持 Editing，清空所有文件
/// - 请求期间会话已被取消：丢弃响应
pub fn complete(
    session: &mut UploadSession,
    result: Result<Value, RepositoryError>,
) -> Result<TaskId, UploadError> {
    let project_id = session.project_id();
    if !session.is_creating_task() {
        warn!("任务创建期间会话已重置，丢弃响应: project={}", project_id);
        return Err(UploadError::Canceled(project_id));
    }

    let response = match result {
        Ok(response) => response,
        Err(e) => {
            error!("创建任务失败: project={}, 错误: {}", project_id, e);
            let err = UploadError::TaskCreation(e);
            session.abort_task_creation(err.to_string());
            return Err(err);
        }
    };

    let Some(task_id) = extract_task_id(&response) else {
        error!("创建任务响应缺少 id: {}", response);
        let err = UploadError::InvalidResponse(response.to_string());
        session.abort_task_creation(err.to_string());
        return Err(err);
    };

    session.begin_upload(task_id.clone())?;
    info!("任务已创建: project={}, task={}", project_id, task_id);
    Ok(task_id)
}
