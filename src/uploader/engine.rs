// 上传引擎
//
// 单一协调循环驱动整个会话：
// - 使用 JoinSet 管理在途传输，数量不超过 parallel_uploads
// - 传输任务只通过 mpsc 发送进度消息，不接触会话
// - 退避计时器也是 JoinSet 中的任务，到期后返回单元 ID
// - 一个单元结束后立刻补位调度下一个
// - 所有单元结束后交给提交协调器
//
// 会话只在协调循环内被修改，在途任务和计时器都不持有会话引用

use crate::config::UploadConfig;
use crate::error::{ProjectId, RepositoryError, TaskId, TransferError, UploadError};
use crate::repository::{TaskParams, TaskRepository, UploadAck};
use crate::uploader::{
    commit, gate, CommitOutcome, CommitStep, Dispatch, EventPublisher, ProgressReporter,
    SessionPhase, TransferEvent, UnitOutcome, UploadEvent, UploadSession,
};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 默认最大并发上传文件数
pub const DEFAULT_PARALLEL_UPLOADS: usize = 6;

/// 传输任务的返回值：(单元 ID, 尝试编号, 结果)
type TransferResult = (usize, u32, Result<UploadAck, RepositoryError>);

/// 会话运行结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// 任务已提交
    Committed(TaskId),
    /// 会话失败
    Failed(String),
    /// 用户取消
    Canceled,
}

/// 上传引擎
#[derive(Clone)]
pub struct UploadEngine {
    /// 任务仓库
    repository: Arc<dyn TaskRepository>,
    /// 最大并发上传文件数
    parallel_uploads: usize,
    /// 事件发布器
    events: EventPublisher,
}

impl UploadEngine {
    pub fn new(
        repository: Arc<dyn TaskRepository>,
        config: &UploadConfig,
        events: EventPublisher,
    ) -> Self {
        Self {
            repository,
            parallel_uploads: config.parallel_uploads.max(1),
            events,
        }
    }

    pub fn events(&self) -> &EventPublisher {
        &self.events
    }

    /// 创建远端任务并让会话进入 Uploading
    ///
    /// 创建请求期间不持有会话锁；取消令牌触发时会话回到空的 Editing
    pub async fn open(
        &self,
        session: &Mutex<UploadSession>,
        params: &TaskParams,
        cancel_token: &CancellationToken,
    ) -> Result<TaskId, UploadError> {
        let project_id = {
            let mut guard = session.lock().await;
            gate::prepare(&mut guard, params)?;
            guard.project_id()
        };

        let result = tokio::select! {
            biased;

            _ = cancel_token.cancelled() => None,
            result = self.repository.create_task(project_id, params) => Some(result),
        };

        let mut guard = session.lock().await;
        let result = match result {
            Some(result) if !cancel_token.is_cancelled() => result,
            _ => {
                info!("任务创建期间取消上传: project={}", project_id);
                guard.cancel();
                self.events.publish(UploadEvent::Canceled { project_id });
                return Err(UploadError::Canceled(project_id));
            }
        };

        match gate::complete(&mut guard, result) {
            Ok(task_id) => {
                self.events.publish(UploadEvent::TaskCreated {
                    project_id,
                    task_id: task_id.clone(),
                });
                Ok(task_id)
            }
            Err(e) => {
                if matches!(
                    e,
                    UploadError::TaskCreation(_) | UploadError::InvalidResponse(_)
                ) {
                    self.events.publish(UploadEvent::Failed {
                        project_id,
                        message: e.to_string(),
                    });
                }
                Err(e)
            }
        }
    }

    /// 创建任务并驱动会话直到结束
    pub async fn run(
        &self,
        session: Arc<Mutex<UploadSession>>,
        params: &TaskParams,
        cancel_token: CancellationToken,
    ) -> Result<SessionOutcome, UploadError> {
        self.open(&session, params, &cancel_token).await?;
        Ok(self.drive(session, cancel_token).await)
    }

    /// 驱动已进入 Uploading 的会话直到提交、失败或取消
    pub async fn drive(
        &self,
        session: Arc<Mutex<UploadSession>>,
        cancel_token: CancellationToken,
    ) -> SessionOutcome {
        let (tx, mut rx) = mpsc::unbounded_channel::<TransferEvent>();
        let mut transfers: JoinSet<TransferResult> = JoinSet::new();
        let mut timers: JoinSet<usize> = JoinSet::new();

        let project_id = {
            let mut guard = session.lock().await;
            for outcome in guard.screen_oversize() {
                self.publish_outcome(&guard, outcome);
            }
            guard.project_id()
        };

        info!(
            "开始驱动上传会话: project={}, 并发数={}",
            project_id, self.parallel_uploads
        );

        let task_id = loop {
            {
                let mut guard = session.lock().await;

                match guard.phase() {
                    SessionPhase::Uploading => {}
                    SessionPhase::Failed => {
                        transfers.abort_all();
                        timers.abort_all();
                        let message = guard.error().unwrap_or_default().to_string();
                        return self.finish(project_id, SessionOutcome::Failed(message));
                    }
                    phase => {
                        warn!("会话阶段为 {:?}，停止驱动", phase);
                        transfers.abort_all();
                        timers.abort_all();
                        return SessionOutcome::Canceled;
                    }
                }

                self.fill_slots(&mut guard, &mut transfers, &tx);

                match commit::prepare(&mut guard) {
                    CommitStep::NotReady => {}
                    CommitStep::Request(task_id) => break task_id,
                    CommitStep::Finished(CommitOutcome::Failed(message)) => {
                        return self.finish(project_id, SessionOutcome::Failed(message));
                    }
                    CommitStep::Finished(CommitOutcome::Committed(task_id)) => {
                        return self.finish(project_id, SessionOutcome::Committed(task_id));
                    }
                }
            }

            tokio::select! {
                biased;

                _ = cancel_token.cancelled() => {
                    transfers.abort_all();
                    timers.abort_all();
                    session.lock().await.cancel();
                    return self.finish(project_id, SessionOutcome::Canceled);
                }

                Some(event) = rx.recv() => {
                    let mut guard = session.lock().await;
                    self.handle_transfer_event(&mut guard, event);
                }

                Some(joined) = transfers.join_next(), if !transfers.is_empty() => {
                    let mut guard = session.lock().await;
                    self.handle_transfer_result(&mut guard, joined, &mut timers);
                    if guard.phase() == SessionPhase::Failed {
                        transfers.abort_all();
                        timers.abort_all();
                    }
                }

                Some(joined) = timers.join_next(), if !timers.is_empty() => {
                    if let Ok(unit) = joined {
                        let mut guard = session.lock().await;
                        if guard.release_retry(unit) {
                            debug!("退避结束，重新排队: unit={}", unit);
                        }
                    }
                }
            }
        };

        // 提交请求期间不持有会话锁，快照查询不受影响
        let result = self.repository.commit_task(project_id, &task_id).await;
        let outcome = {
            let mut guard = session.lock().await;
            commit::complete(&mut guard, result)
        };

        match outcome {
            CommitOutcome::Committed(task_id) => {
                self.finish(project_id, SessionOutcome::Committed(task_id))
            }
            CommitOutcome::Failed(message) => {
                self.finish(project_id, SessionOutcome::Failed(message))
            }
        }
    }

    /// 补满并发槽位
    fn fill_slots(
        &self,
        session: &mut UploadSession,
        transfers: &mut JoinSet<TransferResult>,
        tx: &mpsc::UnboundedSender<TransferEvent>,
    ) {
        while transfers.len() < self.parallel_uploads {
            let Some(dispatch) = session.start_next() else {
                break;
            };
            self.spawn_transfer(dispatch, transfers, tx);
        }
    }

    fn spawn_transfer(
        &self,
        dispatch: Dispatch,
        transfers: &mut JoinSet<TransferResult>,
        tx: &mpsc::UnboundedSender<TransferEvent>,
    ) {
        let repository = self.repository.clone();
        let reporter = ProgressReporter::new(tx.clone(), dispatch.unit, dispatch.attempt);

        transfers.spawn(async move {
            let Dispatch {
                unit,
                attempt,
                file,
                endpoint,
            } = dispatch;
            let result = repository.upload_file(&endpoint, &file, reporter).await;
            (unit, attempt, result)
        });
    }

    fn handle_transfer_event(&self, session: &mut UploadSession, event: TransferEvent) {
        match event {
            TransferEvent::Progress {
                unit,
                attempt,
                bytes_sent,
            } => {
                if session.record_progress(unit, attempt, bytes_sent, Instant::now()) {
                    self.events.publish(progress_event(session));
                }
            }
        }
    }

    fn handle_transfer_result(
        &self,
        session: &mut UploadSession,
        joined: Result<TransferResult, JoinError>,
        timers: &mut JoinSet<usize>,
    ) {
        let (unit, attempt, result) = match joined {
            Ok(r) => r,
            Err(e) if e.is_cancelled() => return,
            Err(e) => {
                error!("上传任务异常退出: {}", e);
                session.fail(format!("Upload worker crashed: {}", e));
                return;
            }
        };

        let outcome = match result {
            Ok(ack) => session.complete_unit(unit, attempt, &ack),
            Err(e) => session.fail_unit(unit, attempt, TransferError::from(e)),
        };

        if let UnitOutcome::Retrying { delay, .. } = &outcome {
            let delay = *delay;
            timers.spawn(async move {
                tokio::time::sleep(delay).await;
                unit
            });
        }
        self.publish_outcome(session, outcome);
    }

    fn publish_outcome(&self, session: &UploadSession, outcome: UnitOutcome) {
        let project_id = session.project_id();
        match outcome {
            UnitOutcome::Succeeded => {
                self.events.publish(progress_event(session));
            }
            UnitOutcome::Retrying {
                name,
                retry_count,
                delay,
                reason,
            } => {
                self.events.publish(UploadEvent::FileRetrying {
                    project_id,
                    filename: name,
                    retry_count,
                    delay_ms: delay.as_millis() as u64,
                    reason,
                });
                self.events.publish(progress_event(session));
            }
            UnitOutcome::Rejected { name, reason }
            | UnitOutcome::Exhausted {
                name,
                reason,
                session_failed: false,
            } => {
                self.events.publish(UploadEvent::FileRejected {
                    project_id,
                    filename: name,
                    reason,
                });
                self.events.publish(progress_event(session));
            }
            // 会话失败事件由协调循环在下一轮统一发出
            UnitOutcome::Exhausted { .. } | UnitOutcome::Stale => {}
        }
    }

    fn finish(&self, project_id: ProjectId, outcome: SessionOutcome) -> SessionOutcome {
        match &outcome {
            SessionOutcome::Committed(task_id) => {
                info!("任务就绪: project={}, task={}", project_id, task_id);
                self.events.publish(UploadEvent::TaskReady {
                    project_id,
                    task_id: task_id.clone(),
                });
            }
            SessionOutcome::Failed(message) => {
                error!("上传会话失败: project={}, {}", project_id, message);
                self.events.publish(UploadEvent::Failed {
                    project_id,
                    message: message.clone(),
                });
            }
            SessionOutcome::Canceled => {
                info!("上传会话已取消: project={}", project_id);
                self.events.publish(UploadEvent::Canceled { project_id });
            }
        }
        outcome
    }
}

/// 根据会话当前计数生成进度事件
fn progress_event(session: &UploadSession) -> UploadEvent {
    UploadEvent::Progress {
        project_id: session.project_id(),
        progress: session.progress(),
        total_bytes_sent: session.total_bytes_sent(),
        total_bytes: session.total_bytes(),
        uploaded_count: session.uploaded_count(),
        total_count: session.total_count(),
    }
}
