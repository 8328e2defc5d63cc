// 错误类型定义
//
// 分三层：
// - RepositoryError: 与任务仓库（HTTP API）交互时的原始错误
// - TransferError: 单个文件传输失败，由重试控制器在本地吸收
// - UploadError: 会话级错误，必定反馈给界面

use crate::uploader::SessionPhase;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 项目 ID
pub type ProjectId = i64;

/// 任务 ID（服务端返回的 UUID 字符串）
pub type TaskId = String;

/// 任务仓库错误
#[derive(Debug, Error)]
pub enum RepositoryError {
    /// 请求发送失败（连接、超时等）
    #[error("请求失败: {0}")]
    Http(#[from] reqwest::Error),
    /// 服务器返回非 2xx 状态码
    #[error("服务器返回 {status}: {body}")]
    Status { status: u16, body: String },
    /// 响应无法解析
    #[error("响应解析失败: {0}")]
    Decode(String),
    /// 本地文件读取失败
    #[error("读取本地文件失败: {0}")]
    Io(#[from] std::io::Error),
}

/// 传输错误分类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferErrorKind {
    /// 网络错误
    Network,
    /// 超时
    Timeout,
    /// 服务器错误（5xx）
    ServerError,
    /// 限流（429）
    RateLimited,
    /// 服务器拒绝（其它 4xx）
    Rejected,
    /// 文件超过大小上限
    TooLarge,
    /// 服务器确认的字节数与文件大小不符
    BadAcknowledgement,
    /// 本地读取失败
    Io,
}

impl TransferErrorKind {
    /// 从 HTTP 状态码转换
    pub fn from_status(status: u16) -> Self {
        match status {
            408 => TransferErrorKind::Timeout,
            413 => TransferErrorKind::TooLarge,
            429 => TransferErrorKind::RateLimited,
            500..=599 => TransferErrorKind::ServerError,
            _ => TransferErrorKind::Rejected,
        }
    }
}

impl From<&RepositoryError> for TransferErrorKind {
    fn from(error: &RepositoryError) -> Self {
        match error {
            RepositoryError::Http(e) if e.is_timeout() => TransferErrorKind::Timeout,
            RepositoryError::Http(e) => match e.status() {
                Some(status) => TransferErrorKind::from_status(status.as_u16()),
                None => TransferErrorKind::Network,
            },
            RepositoryError::Status { status, .. } => TransferErrorKind::from_status(*status),
            RepositoryError::Decode(_) => TransferErrorKind::BadAcknowledgement,
            RepositoryError::Io(_) => TransferErrorKind::Io,
        }
    }
}

/// 单个文件的传输错误
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct TransferError {
    pub kind: TransferErrorKind,
    pub message: String,
}

impl TransferError {
    pub fn new(kind: TransferErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn too_large(filename: &str, max_file_size: u64) -> Self {
        Self::new(
            TransferErrorKind::TooLarge,
            format!(
                "Cannot upload {}, file is too large! Default MaxFileSize is {} MB!",
                filename,
                max_file_size / 1024 / 1024
            ),
        )
    }

    pub fn bad_acknowledgement(filename: &str, expected: u64, accepted: Option<u64>) -> Self {
        Self::new(
            TransferErrorKind::BadAcknowledgement,
            format!(
                "服务器确认字节数不符: file={}, expected={}, accepted={:?}",
                filename, expected, accepted
            ),
        )
    }
}

impl From<RepositoryError> for TransferError {
    fn from(error: RepositoryError) -> Self {
        let kind = TransferErrorKind::from(&error);
        Self::new(kind, error.to_string())
    }
}

/// 会话级错误
#[derive(Debug, Error)]
pub enum UploadError {
    /// 当前阶段不允许该操作
    #[error("当前会话阶段为 {current:?}，不允许执行 {operation}")]
    InvalidPhase {
        current: SessionPhase,
        operation: &'static str,
    },
    /// 参数校验失败
    #[error("{0}")]
    Validation(String),
    /// 会话中没有任何文件
    #[error("No files selected for upload")]
    NoFiles,
    /// 创建任务请求失败
    #[error("Cannot create new task. Please try again later.")]
    TaskCreation(#[source] RepositoryError),
    /// 服务器返回了无效的任务信息
    #[error("Cannot create new task. Invalid response from server: {0}")]
    InvalidResponse(String),
    /// 提交任务请求失败
    #[error("Cannot create new task. Please try again later.")]
    Commit(#[source] RepositoryError),
    /// 所有文件都无法上传
    #[error("{0} files cannot be uploaded. As a reminder, only images (.jpg, .tif, .png) and GCP files (.txt) can be uploaded. Try again.")]
    NothingUploaded(usize),
    /// 某个文件超过最大重试次数
    #[error("Cannot upload {filename}, exceeded max retries ({max_retries})")]
    RetriesExhausted { filename: String, max_retries: u32 },
    /// 上传任务已在运行
    #[error("项目 {0} 的上传任务正在进行中")]
    SessionBusy(ProjectId),
    /// 会话不存在
    #[error("项目 {0} 没有上传会话")]
    SessionNotFound(ProjectId),
    /// 任务创建期间被用户取消
    #[error("项目 {0} 的上传已取消")]
    Canceled(ProjectId),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_from_status() {
        assert_eq!(TransferErrorKind::from_status(500), TransferErrorKind::ServerError);
        assert_eq!(TransferErrorKind::from_status(503), TransferErrorKind::ServerError);
        assert_eq!(TransferErrorKind::from_status(429), TransferErrorKind::RateLimited);
        assert_eq!(TransferErrorKind::from_status(413), TransferErrorKind::TooLarge);
        assert_eq!(TransferErrorKind::from_status(408), TransferErrorKind::Timeout);
        assert_eq!(TransferErrorKind::from_status(403), TransferErrorKind::Rejected);
    }

    #[test]
    fn test_transfer_error_from_repository_error() {
        let err: TransferError = RepositoryError::Status {
            status: 502,
            body: "bad gateway".to_string(),
        }
        .into();
        assert_eq!(err.kind, TransferErrorKind::ServerError);
        assert!(err.message.contains("502"));

        let err: TransferError = RepositoryError::Decode("not json".to_string()).into();
        assert_eq!(err.kind, TransferErrorKind::BadAcknowledgement);
    }

    #[test]
    fn test_user_facing_messages() {
        assert_eq!(
            UploadError::NothingUploaded(3).to_string(),
            "3 files cannot be uploaded. As a reminder, only images (.jpg, .tif, .png) and GCP files (.txt) can be uploaded. Try again."
        );
        assert_eq!(
            UploadError::RetriesExhausted {
                filename: "a.jpg".to_string(),
                max_retries: 20,
            }
            .to_string(),
            "Cannot upload a.jpg, exceeded max retries (20)"
        );
        assert_eq!(
            TransferError::too_large("big.tif", 131072 * 1024 * 1024).message,
            "Cannot upload big.tif, file is too large! Default MaxFileSize is 131072 MB!"
        );
    }
}
