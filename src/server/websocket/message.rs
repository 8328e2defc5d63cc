//! WebSocket 消息类型定义

use crate::error::ProjectId;
use crate::uploader::{SessionSnapshot, UploadEvent};
use serde::{Deserialize, Serialize};

/// 客户端发送给服务端的消息
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsClientMessage {
    /// 心跳 Ping
    Ping {
        /// 客户端时间戳（毫秒）
        timestamp: i64,
    },
    /// 请求某个项目的会话快照
    RequestSnapshot { project_id: ProjectId },
    /// 只接收指定项目的事件（空列表表示全部）
    Subscribe { project_ids: Vec<ProjectId> },
    /// 取消订阅指定项目
    Unsubscribe { project_ids: Vec<ProjectId> },
}

/// 服务端发送给客户端的消息
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsServerMessage {
    /// 心跳 Pong
    Pong {
        /// 服务端时间戳（毫秒）
        timestamp: i64,
        /// 回显客户端时间戳（用于计算延迟）
        client_timestamp: Option<i64>,
    },
    /// 上传事件
    Event {
        timestamp: i64,
        event: UploadEvent,
    },
    /// 会话快照，项目没有会话时为空
    Snapshot {
        project_id: ProjectId,
        snapshot: Option<SessionSnapshot>,
    },
    /// 连接成功
    Connected {
        /// 连接 ID
        connection_id: String,
        /// 服务端时间戳
        timestamp: i64,
    },
    /// 错误消息
    Error {
        /// 错误码
        code: String,
        /// 错误信息
        message: String,
    },
    /// 当前订阅的项目
    Subscriptions { project_ids: Vec<ProjectId> },
}

impl WsServerMessage {
    /// 创建 Pong 消息
    pub fn pong(client_timestamp: Option<i64>) -> Self {
        Self::Pong {
            timestamp: chrono::Utc::now().timestamp_millis(),
            client_timestamp,
        }
    }

    /// 创建 Connected 消息
    pub fn connected(connection_id: String) -> Self {
        Self::Connected {
            connection_id,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// 创建错误消息
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.into(),
            message: message.into(),
        }
    }

    /// 创建事件消息
    pub fn event(event: UploadEvent) -> Self {
        Self::Event {
            timestamp: chrono::Utc::now().timestamp_millis(),
            event,
        }
    }

    pub fn snapshot(project_id: ProjectId, snapshot: Option<SessionSnapshot>) -> Self {
        Self::Snapshot {
            project_id,
            snapshot,
        }
    }

    pub fn subscriptions(mut project_ids: Vec<ProjectId>) -> Self {
        project_ids.sort_unstable();
        Self::Subscriptions { project_ids }
    }
}
