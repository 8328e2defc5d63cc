// 提交协调
//
// 所有单元结束后决定会话的最终结果：
// - 至少一个文件成功且全部结束 -> 发送一次提交请求
// - 没有任何文件成功 -> 直接失败，不调用提交接口

use crate::error::{RepositoryError, TaskId, UploadError};
use crate::repository::extract_task_id;
use crate::uploader::{CommitReadiness, UploadSession};
use serde_json::Value;
use tracing::error;

/// 提交结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    /// 任务已就绪
    Committed(TaskId),
    /// 会话失败，附带界面可见的消息
    Failed(String),
}

/// 提交阶段的下一步
#[derive(Debug)]
pub enum CommitStep {
    /// 仍有单元未结束
    NotReady,
    /// 需要向服务器发送提交请求
    Request(TaskId),
    /// 无需提交，会话已有最终结果
    Finished(CommitOutcome),
}

/// 根据会话状态准备提交
///
/// 返回 `Request` 时会话已进入 Committing，后续调用不会再次返回 `Request`
pub fn prepare(session: &mut UploadSession) -> CommitStep {
    match session.commit_readiness() {
        CommitReadiness::Pending => CommitStep::NotReady,
        CommitReadiness::NothingUploaded(count) => {
            let message = UploadError::NothingUploaded(count).to_string();
            session.fail(message.clone());
            CommitStep::Finished(CommitOutcome::Failed(message))
        }
        CommitReadiness::Ready => match session.begin_commit() {
            Ok(task_id) => CommitStep::Request(task_id),
            Err(_) => CommitStep::NotReady,
        },
    }
}

/// 处理提交响应，更新会话阶段
pub fn complete(
    session: &mut UploadSession,
    result: Result<Value, RepositoryError>,
) -> CommitOutcome {
    match result {
        Ok(response) => match extract_task_id(&response) {
            Some(task_id) => {
                session.finish_commit();
                CommitOutcome::Committed(task_id)
            }
            None => {
                error!("提交响应缺少 id: {}", response);
                let message = UploadError::InvalidResponse(response.to_string()).to_string();
                session.fail(message.clone());
                CommitOutcome::Failed(message)
            }
        },
        Err(e) => {
            error!("提交任务失败: {}", e);
            let message = UploadError::Commit(e).to_string();
            session.fail(message.clone());
            CommitOutcome::Failed(message)
        }
    }
}
