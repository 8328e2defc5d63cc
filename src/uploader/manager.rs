// 上传管理器
//
// 每个项目最多一个上传会话：
// - 添加文件 / 查询快照 / 重置
// - 创建任务后在后台驱动会话
// - 取消正在运行的会话

use crate::config::UploadConfig;
use crate::error::{ProjectId, TaskId, UploadError};
use crate::repository::{TaskParams, TaskRepository};
use crate::uploader::{
    EventPublisher, FileRejection, SessionOutcome, SessionPhase, SessionSnapshot, UploadEngine,
    UploadEvent, UploadFile, UploadSession,
};
use dashmap::DashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

/// 正在后台运行的上传
#[derive(Debug, Clone)]
struct ActiveRun {
    id: String,
    cancel_token: CancellationToken,
}

/// 项目上传会话条目
#[derive(Debug, Clone)]
struct SessionEntry {
    session: Arc<Mutex<UploadSession>>,
    run: Option<ActiveRun>,
}

impl SessionEntry {
    fn is_running(&self) -> bool {
        self.run
            .as_ref()
            .map(|r| !r.cancel_token.is_cancelled())
            .unwrap_or(false)
    }
}

/// 上传管理器
pub struct UploadManager {
    /// 上传引擎
    engine: UploadEngine,
    /// 上传配置
    config: UploadConfig,
    /// 所有会话（project_id -> entry）
    sessions: Arc<DashMap<ProjectId, SessionEntry>>,
}

impl UploadManager {
    pub fn new(repository: Arc<dyn TaskRepository>, config: &UploadConfig) -> Self {
        let events = EventPublisher::default();
        Self {
            engine: UploadEngine::new(repository, config, events),
            config: config.clone(),
            sessions: Arc::new(DashMap::new()),
        }
    }

    /// 订阅上传事件
    pub fn subscribe(&self) -> broadcast::Receiver<UploadEvent> {
        self.engine.events().subscribe()
    }

    fn publish(&self, event: UploadEvent) {
        self.engine.events().publish(event);
    }

    /// 获取或创建项目的会话
    fn session(&self, project_id: ProjectId) -> Arc<Mutex<UploadSession>> {
        self.sessions
            .entry(project_id)
            .or_insert_with(|| SessionEntry {
                session: Arc::new(Mutex::new(UploadSession::new(project_id, &self.config))),
                run: None,
            })
            .session
            .clone()
    }

    fn existing_session(&self, project_id: ProjectId) -> Result<Arc<Mutex<UploadSession>>, UploadError> {
        self.sessions
            .get(&project_id)
            .map(|e| e.session.clone())
            .ok_or(UploadError::SessionNotFound(project_id))
    }

    /// 向会话添加文件
    pub async fn add_files(
        &self,
        project_id: ProjectId,
        files: Vec<UploadFile>,
    ) -> Result<Vec<FileRejection>, UploadError> {
        let session = self.session(project_id);
        let mut session = session.lock().await;

        // 上一次运行已结束（提交或失败），开始新的会话
        if session.phase().is_terminal() {
            *session = UploadSession::new(project_id, &self.config);
        }

        let count = files.len();
        let rejections = session.add_files(files)?;
        for rejection in &rejections {
            self.publish(UploadEvent::FileRejected {
                project_id,
                filename: rejection.filename.clone(),
                reason: rejection.reason.clone(),
            });
        }
        self.publish(UploadEvent::FilesAdded {
            project_id,
            count: count - rejections.len(),
            total_count: session.total_count(),
            total_bytes: session.total_bytes(),
        });

        Ok(rejections)
    }

    /// 按本地路径添加文件，无法读取的路径作为拒绝项返回
    pub async fn add_paths(
        &self,
        project_id: ProjectId,
        paths: Vec<PathBuf>,
    ) -> Result<Vec<FileRejection>, UploadError> {
        let mut files = Vec::with_capacity(paths.len());
        let mut unreadable = Vec::new();

        for path in paths {
            match UploadFile::from_path(&path).await {
                Ok(file) => files.push(file),
                Err(e) => {
                    warn!("无法添加文件 {:?}: {:#}", path, e);
                    unreadable.push(FileRejection {
                        filename: path.display().to_string(),
                        reason: format!("{:#}", e),
                    });
                }
            }
        }

        let mut rejections = self.add_files(project_id, files).await?;
        rejections.extend(unreadable);
        Ok(rejections)
    }

    /// 创建任务并在后台开始上传
    pub async fn start_task(
        &self,
        project_id: ProjectId,
        params: TaskParams,
    ) -> Result<TaskId, UploadError> {
        let run = ActiveRun {
            id: Uuid::new_v4().to_string(),
            cancel_token: CancellationToken::new(),
        };

        // 检查与登记在同一个条目锁内完成，创建请求发出前取消即可生效
        let session = {
            let mut entry = self
                .sessions
                .get_mut(&project_id)
                .ok_or(UploadError::SessionNotFound(project_id))?;
            if entry.is_running() {
                return Err(UploadError::SessionBusy(project_id));
            }
            entry.run = Some(run.clone());
            entry.session.clone()
        };

        let task_id = match self.engine.open(&session, &params, &run.cancel_token).await {
            Ok(task_id) => task_id,
            Err(e) => {
                release_run(&self.sessions, project_id, &run.id);
                return Err(e);
            }
        };

        let engine = self.engine.clone();
        let sessions = self.sessions.clone();
        tokio::spawn(async move {
            let outcome = engine.drive(session, run.cancel_token.clone()).await;
            match &outcome {
                SessionOutcome::Committed(task_id) => {
                    info!("项目 {} 上传完成: task={}", project_id, task_id)
                }
                SessionOutcome::Failed(message) => {
                    warn!("项目 {} 上传失败: {}", project_id, message)
                }
                SessionOutcome::Canceled => info!("项目 {} 上传已取消", project_id),
            }
            release_run(&sessions, project_id, &run.id);
        });

        Ok(task_id)
    }

    /// 会话是否正在创建任务或后台上传
    pub fn is_running(&self, project_id: ProjectId) -> bool {
        self.sessions
            .get(&project_id)
            .map(|e| e.is_running())
            .unwrap_or(false)
    }

    fn run_token(&self, project_id: ProjectId) -> Option<CancellationToken> {
        self.sessions
            .get(&project_id)
            .and_then(|e| e.run.as_ref().map(|r| r.cancel_token.clone()))
    }

    /// 取消上传：丢弃所有文件，会话回到空的 Editing
    ///
    /// 提交请求发出后不能取消
    pub async fn cancel(&self, project_id: ProjectId) -> Result<(), UploadError> {
        let session = self.existing_session(project_id)?;
        let mut guard = session.lock().await;

        if guard.phase() == SessionPhase::Committing {
            return Err(UploadError::InvalidPhase {
                current: SessionPhase::Committing,
                operation: "cancel",
            });
        }

        // 创建任务或上传中：由运行中的引擎回退会话
        if guard.is_creating_task() || guard.phase() == SessionPhase::Uploading {
            if let Some(token) = self.run_token(project_id) {
                info!("取消项目 {} 的上传", project_id);
                token.cancel();
                return Ok(());
            }
        }

        guard.cancel();
        self.publish(UploadEvent::Canceled { project_id });
        Ok(())
    }

    /// 获取会话快照
    pub async fn snapshot(&self, project_id: ProjectId) -> Option<SessionSnapshot> {
        let session = self.sessions.get(&project_id).map(|e| e.session.clone())?;
        let guard = session.lock().await;
        Some(guard.snapshot())
    }

    /// 移除空闲会话
    pub async fn reset(&self, project_id: ProjectId) -> Result<(), UploadError> {
        let session = self.existing_session(project_id)?;
        if self.is_running(project_id) {
            return Err(UploadError::SessionBusy(project_id));
        }

        let phase = session.lock().await.phase();
        if matches!(phase, SessionPhase::Uploading | SessionPhase::Committing) {
            return Err(UploadError::SessionBusy(project_id));
        }

        self.sessions.remove(&project_id);
        info!("已移除项目 {} 的上传会话", project_id);
        Ok(())
    }

    /// 取消所有正在运行的上传（程序退出时调用）
    pub fn shutdown(&self) {
        for entry in self.sessions.iter() {
            if let Some(run) = &entry.run {
                run.cancel_token.cancel();
            }
        }
    }
}

/// 运行结束后注销，已被新的运行替换时保留
fn release_run(sessions: &DashMap<ProjectId, SessionEntry>, project_id: ProjectId, run_id: &str) {
    if let Some(mut entry) = sessions.get_mut(&project_id) {
        if entry.run.as_ref().map(|r| r.id == run_id).unwrap_or(false) {
            entry.run = None;
        }
    }
}
