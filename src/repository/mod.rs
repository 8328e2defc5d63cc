// 项目/任务仓库
//
// 上传流水线依赖的远端接口：创建任务、上传文件、提交任务。
// 仓库本身无状态，每个传输单元调用一次 upload_file。

pub mod client;
pub mod types;

pub use client::HttpTaskRepository;
pub use types::*;

use crate::error::{ProjectId, RepositoryError};
use crate::uploader::{ProgressReporter, UploadFile};
use async_trait::async_trait;
use serde_json::Value;

/// 任务仓库接口
#[async_trait]
pub trait TaskRepository: Send + Sync + 'static {
    /// 创建（部分）任务，返回服务器的任务 JSON
    async fn create_task(
        &self,
        project_id: ProjectId,
        params: &TaskParams,
    ) -> Result<Value, RepositoryError>;

    /// 上传单个文件到已绑定的任务端点
    ///
    /// 传输过程中通过 `progress` 报告本次尝试累计已发送的字节数
    async fn upload_file(
        &self,
        endpoint: &str,
        file: &UploadFile,
        progress: ProgressReporter,
    ) -> Result<UploadAck, RepositoryError>;

    /// 提交任务，返回服务器的任务 JSON
    async fn commit_task(&self, project_id: ProjectId, task_id: &str)
        -> Result<Value, RepositoryError>;
}

/// 任务上传端点
pub fn upload_endpoint(project_id: ProjectId, task_id: &str) -> String {
    format!("/api/projects/{}/tasks/{}/upload/", project_id, task_id)
}

/// 任务提交端点
pub fn commit_endpoint(project_id: ProjectId, task_id: &str) -> String {
    format!("/api/projects/{}/tasks/{}/commit/", project_id, task_id)
}

/// 任务创建端点
pub fn create_task_endpoint(project_id: ProjectId) -> String {
    format!("/api/projects/{}/tasks/", project_id)
}

/// 从服务器响应中提取任务 ID
///
/// 字符串和数字形式的 `id` 都接受，空字符串视为缺失
pub fn extract_task_id(response: &Value) -> Option<String> {
    match response.get("id")? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
