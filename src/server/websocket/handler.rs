//! WebSocket 路由处理器

use crate::error::ProjectId;
use crate::server::websocket::message::{WsClientMessage, WsServerMessage};
use crate::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use dashmap::DashSet;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// WebSocket 路由处理器
///
/// 升级 HTTP 连接为 WebSocket，推送上传事件
pub async fn handle_websocket(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// 处理 WebSocket 连接
async fn handle_socket(socket: WebSocket, state: AppState) {
    let connection_id = Uuid::new_v4().to_string();
    info!("新的 WebSocket 连接: {}", connection_id);

    let mut events = state.upload_manager.subscribe();
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<WsServerMessage>();
    // 订阅的项目，为空表示全部
    let subscriptions: Arc<DashSet<ProjectId>> = Arc::new(DashSet::new());

    let (mut sender, mut receiver) = socket.split();

    let connected_msg = WsServerMessage::connected(connection_id.clone());
    if let Ok(json) = serde_json::to_string(&connected_msg) {
        if sender.send(Message::Text(json)).await.is_err() {
            error!("发送连接成功消息失败");
            return;
        }
    }

    // 启动发送任务
    let send_subscriptions = subscriptions.clone();
    let send_conn_id = connection_id.clone();
    let mut send_task = tokio::spawn(async move {
        loop {
            let message = tokio::select! {
                event = events.recv() => match event {
                    Ok(event) => {
                        if !send_subscriptions.is_empty()
                            && !send_subscriptions.contains(&event.project_id())
                        {
                            continue;
                        }
                        WsServerMessage::event(event)
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("WebSocket {} 落后，丢弃 {} 条事件", send_conn_id, skipped);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                reply = reply_rx.recv() => match reply {
                    Some(reply) => reply,
                    None => break,
                },
            };

            match serde_json::to_string(&message) {
                Ok(json) => {
                    if sender.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    error!("序列化消息失败: {}", e);
                }
            }
        }
    });

    let recv_state = state.clone();
    let recv_conn_id = connection_id.clone();

    // 启动接收任务
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(message)) = receiver.next().await {
            let text = match message {
                Message::Text(text) => text,
                Message::Binary(data) => match String::from_utf8(data) {
                    Ok(text) => text,
                    Err(_) => continue,
                },
                Message::Ping(_) | Message::Pong(_) => {
                    debug!("收到心跳: {}", recv_conn_id);
                    continue;
                }
                Message::Close(_) => {
                    info!("收到关闭消息: {}", recv_conn_id);
                    break;
                }
            };

            let reply =
                handle_client_message(&recv_state, &subscriptions, &recv_conn_id, &text).await;
            if reply_tx.send(reply).is_err() {
                break;
            }
        }
    });

    // 等待任一任务结束，然后中止另一个
    tokio::select! {
        _ = &mut send_task => {
            debug!("发送任务结束: {}", connection_id);
            recv_task.abort();
        }
        _ = &mut recv_task => {
            debug!("接收任务结束: {}", connection_id);
            send_task.abort();
        }
    }

    info!("WebSocket 连接已关闭: {}", connection_id);
}

/// 处理客户端消息，返回要回复的消息
async fn handle_client_message(
    state: &AppState,
    subscriptions: &DashSet<ProjectId>,
    connection_id: &str,
    text: &str,
) -> WsServerMessage {
    match serde_json::from_str::<WsClientMessage>(text) {
        Ok(WsClientMessage::Ping { timestamp }) => WsServerMessage::pong(Some(timestamp)),
        Ok(WsClientMessage::RequestSnapshot { project_id }) => {
            debug!("收到快照请求: {} - project={}", connection_id, project_id);
            let snapshot = state.upload_manager.snapshot(project_id).await;
            WsServerMessage::snapshot(project_id, snapshot)
        }
        Ok(WsClientMessage::Subscribe { project_ids }) => {
            debug!("收到订阅请求: {} - {:?}", connection_id, project_ids);
            for id in project_ids {
                subscriptions.insert(id);
            }
            WsServerMessage::subscriptions(subscriptions.iter().map(|id| *id).collect())
        }
        Ok(WsClientMessage::Unsubscribe { project_ids }) => {
            debug!("收到取消订阅请求: {} - {:?}", connection_id, project_ids);
            for id in &project_ids {
                subscriptions.remove(id);
            }
            WsServerMessage::subscriptions(subscriptions.iter().map(|id| *id).collect())
        }
        Err(e) => {
            warn!("解析客户端消息失败: {} - {}", connection_id, e);
            WsServerMessage::error("PARSE_ERROR", format!("消息解析失败: {}", e))
        }
    }
}
