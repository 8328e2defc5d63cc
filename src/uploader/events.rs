//! 上传事件
//!
//! - `UploadEvent`: 推送给界面的生命周期事件
//! - `TransferEvent`: 传输任务发给协调循环的内部消息

use crate::error::{ProjectId, TaskId};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};

/// 上传生命周期事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum UploadEvent {
    /// 文件加入会话
    FilesAdded {
        project_id: ProjectId,
        count: usize,
        total_count: usize,
        total_bytes: u64,
    },
    /// 远端任务已创建，开始上传
    TaskCreated {
        project_id: ProjectId,
        task_id: TaskId,
    },
    /// 进度更新
    Progress {
        project_id: ProjectId,
        progress: f64,
        total_bytes_sent: u64,
        total_bytes: u64,
        uploaded_count: usize,
        total_count: usize,
    },
    /// 文件等待重试
    FileRetrying {
        project_id: ProjectId,
        filename: String,
        retry_count: u32,
        delay_ms: u64,
        reason: String,
    },
    /// 文件被拒绝（类型不支持、超过大小上限、重试耗尽）
    FileRejected {
        project_id: ProjectId,
        filename: String,
        reason: String,
    },
    /// 任务提交成功
    TaskReady {
        project_id: ProjectId,
        task_id: TaskId,
    },
    /// 会话失败
    Failed {
        project_id: ProjectId,
        message: String,
    },
    /// 会话被取消
    Canceled { project_id: ProjectId },
}

impl UploadEvent {
    /// 事件类型名称
    pub fn event_type(&self) -> &'static str {
        match self {
            UploadEvent::FilesAdded { .. } => "files_added",
            UploadEvent::TaskCreated { .. } => "task_created",
            UploadEvent::Progress { .. } => "progress",
            UploadEvent::FileRetrying { .. } => "file_retrying",
            UploadEvent::FileRejected { .. } => "file_rejected",
            UploadEvent::TaskReady { .. } => "task_ready",
            UploadEvent::Failed { .. } => "failed",
            UploadEvent::Canceled { .. } => "canceled",
        }
    }

    pub fn project_id(&self) -> ProjectId {
        match self {
            UploadEvent::FilesAdded { project_id, .. }
            | UploadEvent::TaskCreated { project_id, .. }
            | UploadEvent::Progress { project_id, .. }
            | UploadEvent::FileRetrying { project_id, .. }
            | UploadEvent::FileRejected { project_id, .. }
            | UploadEvent::TaskReady { project_id, .. }
            | UploadEvent::Failed { project_id, .. }
            | UploadEvent::Canceled { project_id } => *project_id,
        }
    }
}

/// 事件发布器
///
/// 没有订阅者时事件直接丢弃
#[derive(Debug, Clone)]
pub struct EventPublisher {
    tx: broadcast::Sender<UploadEvent>,
}

impl EventPublisher {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: UploadEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UploadEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventPublisher {
    fn default() -> Self {
        Self::new(1024)
    }
}

/// 传输任务发给协调循环的消息
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEvent {
    /// 本次尝试累计已发送的字节数
    Progress {
        unit: usize,
        attempt: u32,
        bytes_sent: u64,
    },
}

/// 进度上报句柄
///
/// 交给无状态的传输层，每个单元每次尝试一个
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    tx: mpsc::UnboundedSender<TransferEvent>,
    unit: usize,
    attempt: u32,
}

impl ProgressReporter {
    pub fn new(tx: mpsc::UnboundedSender<TransferEvent>, unit: usize, attempt: u32) -> Self {
        Self { tx, unit, attempt }
    }

    /// 上报累计已发送字节数
    pub fn report(&self, bytes_sent: u64) {
        // 协调循环已退出（取消/结束）时忽略
        let _ = self.tx.send(TransferEvent::Progress {
            unit: self.unit,
            attempt: self.attempt,
            bytes_sent,
        });
    }
}
