// 传输单元
//
// 包装单个文件及其传输记录（已发送字节、重试次数、状态）

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// 待上传文件
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadFile {
    /// 本地文件路径
    pub path: PathBuf,
    /// 上传时使用的文件名（服务器按此名称确认字节数）
    pub name: String,
    /// 文件大小
    pub size: u64,
}

impl UploadFile {
    pub fn new(path: impl Into<PathBuf>, name: impl Into<String>, size: u64) -> Self {
        Self {
            path: path.into(),
            name: name.into(),
            size,
        }
    }

    /// 从本地路径读取文件名和大小
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let metadata = tokio::fs::metadata(path)
            .await
            .with_context(|| format!("无法读取文件信息: {:?}", path))?;
        if !metadata.is_file() {
            anyhow::bail!("不是普通文件: {:?}", path);
        }

        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .with_context(|| format!("无效的文件名: {:?}", path))?
            .to_string();

        Ok(Self::new(path, name, metadata.len()))
    }

    /// 小写扩展名（不含点）
    pub fn extension(&self) -> Option<String> {
        Path::new(&self.name)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
    }
}

/// 传输单元状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum UnitStatus {
    /// 排队中（包括等待重试）
    Queued,
    /// 上传中
    Uploading,
    /// 上传成功
    Succeeded,
    /// 永久失败
    Failed,
}

/// 传输单元
#[derive(Debug, Clone)]
pub struct TransferUnit {
    /// 单元 ID（会话内的索引）
    pub id: usize,
    /// 文件
    pub file: UploadFile,
    /// 绑定的上传端点（任务创建成功后设置）
    pub endpoint: Option<String>,
    /// 本次尝试中最后一次被接受的原始累计字节数
    pub bytes_sent_raw: u64,
    /// 已计入会话总量的字节数（跨重试保留，重试时回滚）
    pub bytes_sent_tracked: u64,
    /// 重试次数
    pub retry_count: u32,
    /// 状态
    pub status: UnitStatus,
    /// 是否在等待退避延迟结束
    pub waiting_retry: bool,
    /// 最后一次错误
    pub error: Option<String>,
}

impl TransferUnit {
    pub fn new(id: usize, file: UploadFile) -> Self {
        Self {
            id,
            file,
            endpoint: None,
            bytes_sent_raw: 0,
            bytes_sent_tracked: 0,
            retry_count: 0,
            status: UnitStatus::Queued,
            waiting_retry: false,
            error: None,
        }
    }

    pub fn size(&self) -> u64 {
        self.file.size
    }

    pub fn name(&self) -> &str {
        &self.file.name
    }

    /// 本次尝试的编号（等于已重试次数），用于丢弃过期的传输事件
    pub fn attempt(&self) -> u32 {
        self.retry_count
    }

    /// 可以被调度
    pub fn is_dispatchable(&self) -> bool {
        self.status == UnitStatus::Queued && !self.waiting_retry && self.endpoint.is_some()
    }

    /// 尚未结束（排队或上传中）
    pub fn is_pending(&self) -> bool {
        matches!(self.status, UnitStatus::Queued | UnitStatus::Uploading)
    }

    /// 事件是否属于当前正在进行的尝试
    pub fn is_current_attempt(&self, attempt: u32) -> bool {
        self.status == UnitStatus::Uploading && self.retry_count == attempt
    }

    pub fn mark_uploading(&mut self) {
        self.status = UnitStatus::Uploading;
    }

    pub fn mark_succeeded(&mut self) {
        self.status = UnitStatus::Succeeded;
        self.error = None;
    }

    pub fn mark_failed(&mut self, error: String) {
        self.status = UnitStatus::Failed;
        self.waiting_retry = false;
        self.error = Some(error);
    }

    /// 重新排队，进入退避等待
    pub fn requeue(&mut self, error: String) {
        self.retry_count += 1;
        self.status = UnitStatus::Queued;
        self.waiting_retry = true;
        self.error = Some(error);
    }
}

/// 文件级快照（供界面渲染）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileSnapshot {
    pub name: String,
    pub size: u64,
    pub status: UnitStatus,
    pub bytes_sent: u64,
    pub retries: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&TransferUnit> for FileSnapshot {
    fn from(unit: &TransferUnit) -> Self {
        Self {
            name: unit.file.name.clone(),
            size: unit.file.size,
            status: unit.status,
            bytes_sent: unit.bytes_sent_tracked,
            retries: unit.retry_count,
            error: unit.error.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_unit_creation() {
        let unit = TransferUnit::new(0, UploadFile::new("/tmp/a.jpg", "a.jpg", 1024));
        assert_eq!(unit.status, UnitStatus::Queued);
        assert_eq!(unit.bytes_sent_raw, 0);
        assert_eq!(unit.bytes_sent_tracked, 0);
        assert_eq!(unit.retry_count, 0);
        // 未绑定端点前不能调度
        assert!(!unit.is_dispatchable());
        assert!(unit.is_pending());
    }

    #[test]
    fn test_requeue_waits_for_backoff() {
        let mut unit = TransferUnit::new(0, UploadFile::new("/tmp/a.jpg", "a.jpg", 1024));
        unit.endpoint = Some("/upload/".to_string());
        unit.mark_uploading();
        assert!(unit.is_current_attempt(0));

        unit.requeue("network".to_string());
        assert_eq!(unit.retry_count, 1);
        assert_eq!(unit.status, UnitStatus::Queued);
        assert!(!unit.is_dispatchable());
        assert!(!unit.is_current_attempt(0));

        unit.waiting_retry = false;
        assert!(unit.is_dispatchable());
    }

    #[test]
    fn test_extension_is_lowercase() {
        let file = UploadFile::new("/tmp/IMG_0001.JPG", "IMG_0001.JPG", 1);
        assert_eq!(file.extension().as_deref(), Some("jpg"));
        let file = UploadFile::new("/tmp/README", "README", 1);
        assert_eq!(file.extension(), None);
    }

    #[tokio::test]
    async fn test_from_path_reads_size() {
        let mut tmp = tempfile::Builder::new().suffix(".tif").tempfile().unwrap();
        tmp.write_all(&[0u8; 2048]).unwrap();

        let file = UploadFile::from_path(tmp.path()).await.unwrap();
        assert_eq!(file.size, 2048);
        assert!(file.name.ends_with(".tif"));
    }

    #[tokio::test]
    async fn test_from_path_rejects_directory() {
        let dir = tempfile::tempdir().unwrap();
        assert!(UploadFile::from_path(dir.path()).await.is_err());
    }
}
