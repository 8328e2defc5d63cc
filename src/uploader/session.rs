// 上传会话
//
// 会话按索引持有全部传输单元，是上传状态的唯一所有者。
// 只有协调循环会修改会话；会话总量只经由进度核算器变动。

use crate::config::UploadConfig;
use crate::error::{ProjectId, TaskId, TransferError, UploadError};
use crate::repository::{upload_endpoint, UploadAck};
use crate::uploader::{
    FileSnapshot, ProgressAccountant, RetryDecision, RetryPolicy, TransferUnit, UnitStatus,
    UploadFile,
};
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// 会话阶段
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    /// 编辑中（可以添加文件）
    Editing,
    /// 上传中
    Uploading,
    /// 提交中
    Committing,
    /// 已提交
    Committed,
    /// 失败
    Failed,
}

impl SessionPhase {
    /// 是否为终态
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionPhase::Committed | SessionPhase::Failed)
    }
}

/// 添加文件时被拒绝的文件
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRejection {
    pub filename: String,
    pub reason: String,
}

/// 一次可调度的传输
#[derive(Debug, Clone)]
pub struct Dispatch {
    pub unit: usize,
    pub attempt: u32,
    pub file: UploadFile,
    pub endpoint: String,
}

/// 单元结果处理后的去向
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitOutcome {
    /// 上传成功
    Succeeded,
    /// 重新排队，等待 `delay` 后再次调度
    Retrying {
        name: String,
        retry_count: u32,
        delay: Duration,
        reason: String,
    },
    /// 永久移出会话
    Rejected { name: String, reason: String },
    /// 重试耗尽；`session_failed` 为 true 时整个会话已失败
    Exhausted {
        name: String,
        reason: String,
        session_failed: bool,
    },
    /// 过期事件（旧的尝试或会话已不在上传阶段），忽略
    Stale,
}

/// 提交前检查结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitReadiness {
    /// 仍有单元排队或上传中
    Pending,
    /// 可以提交
    Ready,
    /// 没有任何文件上传成功，参数为无法上传的文件数
    NothingUploaded(usize),
}

/// 会话快照（供界面渲染）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub project_id: ProjectId,
    pub uploading: bool,
    pub editing: bool,
    pub error: Option<String>,
    /// 0-100
    pub progress: f64,
    pub files: Vec<FileSnapshot>,
    pub total_count: usize,
    pub uploaded_count: usize,
    pub total_bytes: u64,
    pub total_bytes_sent: u64,
    pub phase: SessionPhase,
    pub task_id: Option<TaskId>,
    pub created_at: DateTime<Local>,
}

/// 上传会话
#[derive(Debug, Clone)]
pub struct UploadSession {
    id: String,
    project_id: ProjectId,
    /// 任务 ID，任务创建成功后设置，之后不可修改
    task_id: Option<TaskId>,
    phase: SessionPhase,
    /// 任务创建请求已发出，尚未返回
    creating_task: bool,
    units: Vec<TransferUnit>,
    accountant: ProgressAccountant,
    total_count: usize,
    uploaded_count: usize,
    error: Option<String>,
    /// 允许上传的扩展名（小写，不含点），为空表示不限制
    accepted_extensions: Vec<String>,
    policy: RetryPolicy,
    /// 重试耗尽时是否让整个会话失败
    abort_on_exhausted: bool,
    progress_interval: Duration,
    created_at: DateTime<Local>,
}

impl UploadSession {
    /// 创建空会话（Editing）
    pub fn new(project_id: ProjectId, config: &UploadConfig) -> Self {
        let progress_interval = Duration::from_millis(config.progress_interval_ms);
        Self {
            id: Uuid::new_v4().to_string(),
            project_id,
            task_id: None,
            phase: SessionPhase::Editing,
            creating_task: false,
            units: Vec::new(),
            accountant: ProgressAccountant::new(progress_interval),
            total_count: 0,
            uploaded_count: 0,
            error: None,
            accepted_extensions: config
                .accepted_extensions
                .iter()
                .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
                .collect(),
            policy: RetryPolicy::from_config(config),
            abort_on_exhausted: config.abort_on_exhausted_retries,
            progress_interval,
            created_at: Local::now(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn project_id(&self) -> ProjectId {
        self.project_id
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn task_id(&self) -> Option<&str> {
        self.task_id.as_deref()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn units(&self) -> &[TransferUnit] {
        &self.units
    }

    pub fn unit(&self, id: usize) -> Option<&TransferUnit> {
        self.units.get(id)
    }

    pub fn total_count(&self) -> usize {
        self.total_count
    }

    pub fn uploaded_count(&self) -> usize {
        self.uploaded_count
    }

    pub fn total_bytes(&self) -> u64 {
        self.accountant.total_bytes()
    }

    pub fn total_bytes_sent(&self) -> u64 {
        self.accountant.total_bytes_sent()
    }

    pub fn progress(&self) -> f64 {
        self.accountant.percent()
    }

    pub fn is_empty(&self) -> bool {
        self.total_count == 0
    }

    pub fn is_creating_task(&self) -> bool {
        self.creating_task
    }

    /// 文件类型是否允许上传
    pub fn is_accepted(&self, file: &UploadFile) -> bool {
        if self.accepted_extensions.is_empty() {
            return true;
        }
        file.extension()
            .map(|ext| self.accepted_extensions.iter().any(|a| *a == ext))
            .unwrap_or(false)
    }

    fn ensure_phase(&self, expected: SessionPhase, operation: &'static str) -> Result<(), UploadError> {
        if self.phase != expected {
            return Err(UploadError::InvalidPhase {
                current: self.phase,
                operation,
            });
        }
        Ok(())
    }

    /// 添加文件（仅 Editing 阶段）
    ///
    /// 类型不支持的文件不会加入会话，作为拒绝项返回
    pub fn add_files(&mut self, files: Vec<UploadFile>) -> Result<Vec<FileRejection>, UploadError> {
        self.ensure_phase(SessionPhase::Editing, "add_files")?;
        if self.creating_task {
            return Err(UploadError::SessionBusy(self.project_id));
        }

        let mut rejections = Vec::new();
        for file in files {
            if !self.is_accepted(&file) {
                debug!("文件类型不支持，跳过: {}", file.name);
                rejections.push(FileRejection {
                    reason: format!("Cannot upload {}, unsupported file type", file.name),
                    filename: file.name,
                });
                continue;
            }

            let unit = TransferUnit::new(self.units.len(), file);
            self.accountant.add_unit(&unit);
            self.total_count += 1;
            self.units.push(unit);
        }

        debug!(
            "会话 {} 添加文件: total_count={}, total_bytes={}, rejected={}",
            self.id,
            self.total_count,
            self.accountant.total_bytes(),
            rejections.len()
        );
        Ok(rejections)
    }

    /// 记录一条界面可见的错误，不改变阶段
    pub fn set_error(&mut self, message: impl Into<String>) {
        self.error = Some(message.into());
    }

    /// 发出任务创建请求前调用，请求返回前文件列表冻结
    pub fn begin_task_creation(&mut self) -> Result<(), UploadError> {
        self.ensure_phase(SessionPhase::Editing, "create_task")?;
        if self.creating_task {
            return Err(UploadError::SessionBusy(self.project_id));
        }
        if self.is_empty() {
            return Err(UploadError::NoFiles);
        }
        self.creating_task = true;
        self.error = None;
        Ok(())
    }

    /// 任务创建成功：绑定上传端点并进入 Uploading
    pub fn begin_upload(&mut self, task_id: TaskId) -> Result<(), UploadError> {
        self.ensure_phase(SessionPhase::Editing, "begin_upload")?;
        if self.task_id.is_some() {
            return Err(UploadError::InvalidPhase {
                current: self.phase,
                operation: "begin_upload",
            });
        }
        if self.is_empty() {
            return Err(UploadError::NoFiles);
        }

        let endpoint = upload_endpoint(self.project_id, &task_id);
        for unit in self.units.iter_mut() {
            unit.endpoint = Some(endpoint.clone());
        }

        info!(
            "会话 {} 开始上传: project={}, task={}, files={}",
            self.id, self.project_id, task_id, self.total_count
        );
        self.task_id = Some(task_id);
        self.phase = SessionPhase::Uploading;
        self.creating_task = false;
        self.error = None;
        Ok(())
    }

    /// 任务创建失败：清空所有文件，保持 Editing，记录错误
    pub fn abort_task_creation(&mut self, message: impl Into<String>) {
        let message = message.into();
        warn!("会话 {} 任务创建失败: {}", self.id, message);
        self.clear_units();
        self.phase = SessionPhase::Editing;
        self.creating_task = false;
        self.error = Some(message);
    }

    /// 在调度前移除超过大小上限的文件，避免发送任何字节
    pub fn screen_oversize(&mut self) -> Vec<UnitOutcome> {
        if self.phase != SessionPhase::Uploading {
            return Vec::new();
        }

        let oversize: Vec<usize> = self
            .units
            .iter()
            .filter(|u| u.status == UnitStatus::Queued && self.policy.is_oversize(u.size()))
            .map(|u| u.id)
            .collect();

        oversize
            .into_iter()
            .map(|id| {
                let error = TransferError::too_large(self.units[id].name(), self.policy.max_file_size);
                self.resolve_failure(id, error)
            })
            .collect()
    }

    /// 取出下一个可调度的单元并标记为上传中
    pub fn start_next(&mut self) -> Option<Dispatch> {
        if self.phase != SessionPhase::Uploading {
            return None;
        }

        let unit = self.units.iter_mut().find(|u| u.is_dispatchable())?;
        let endpoint = unit.endpoint.clone()?;
        unit.mark_uploading();

        debug!(
            "调度文件: {} (attempt={}, size={})",
            unit.name(),
            unit.attempt(),
            unit.size()
        );
        Some(Dispatch {
            unit: unit.id,
            attempt: unit.attempt(),
            file: unit.file.clone(),
            endpoint,
        })
    }

    /// 处理进度采样，采样被接受时返回 true
    pub fn record_progress(&mut self, id: usize, attempt: u32, raw_bytes_sent: u64, now: Instant) -> bool {
        if self.phase != SessionPhase::Uploading {
            return false;
        }
        let Some(unit) = self.units.get_mut(id) else {
            return false;
        };
        if !unit.is_current_attempt(attempt) {
            return false;
        }
        self.accountant.record_sample(unit, raw_bytes_sent, now)
    }

    /// 传输完成，检查服务器确认
    pub fn complete_unit(&mut self, id: usize, attempt: u32, ack: &UploadAck) -> UnitOutcome {
        if !self.is_live_attempt(id, attempt) {
            return UnitOutcome::Stale;
        }

        let (name, size) = {
            let unit = &self.units[id];
            (unit.name().to_string(), unit.size())
        };
        if !ack.confirms(&name, size) {
            let error = TransferError::bad_acknowledgement(&name, size, ack.accepted_bytes(&name));
            return self.resolve_failure(id, error);
        }

        let unit = &mut self.units[id];
        self.accountant.credit_completion(unit);
        unit.mark_succeeded();
        self.uploaded_count += 1;
        debug_assert!(self.uploaded_count <= self.total_count);

        debug!(
            "文件上传成功: {} ({}/{})",
            name, self.uploaded_count, self.total_count
        );
        UnitOutcome::Succeeded
    }

    /// 传输失败，交给重试控制
    pub fn fail_unit(&mut self, id: usize, attempt: u32, error: TransferError) -> UnitOutcome {
        if !self.is_live_attempt(id, attempt) {
            return UnitOutcome::Stale;
        }
        self.resolve_failure(id, error)
    }

    fn is_live_attempt(&self, id: usize, attempt: u32) -> bool {
        self.phase == SessionPhase::Uploading
            && self
                .units
                .get(id)
                .map(|u| u.is_current_attempt(attempt))
                .unwrap_or(false)
    }

    fn resolve_failure(&mut self, id: usize, error: TransferError) -> UnitOutcome {
        let decision = self.policy.decide(&self.units[id]);
        let unit = &mut self.units[id];
        let name = unit.name().to_string();

        match decision {
            RetryDecision::Reject => {
                let reason = if self.policy.is_oversize(unit.size()) {
                    TransferError::too_large(&name, self.policy.max_file_size).message
                } else {
                    error.message
                };
                warn!("文件被移出会话: {}", reason);
                self.accountant.remove_unit(unit);
                unit.mark_failed(reason.clone());
                self.total_count -= 1;
                UnitOutcome::Rejected { name, reason }
            }
            RetryDecision::Retry { retry_count, delay } => {
                warn!(
                    "文件上传失败，{}ms 后第 {} 次重试: {} ({:?}: {})",
                    delay.as_millis(),
                    retry_count,
                    name,
                    error.kind,
                    error.message
                );
                self.accountant.rollback(unit);
                unit.requeue(error.message.clone());
                debug_assert_eq!(unit.retry_count, retry_count);
                UnitOutcome::Retrying {
                    name,
                    retry_count,
                    delay,
                    reason: error.message,
                }
            }
            RetryDecision::Exhausted => {
                let reason = UploadError::RetriesExhausted {
                    filename: name.clone(),
                    max_retries: self.policy.max_retries,
                }
                .to_string();
                warn!("{} (最后错误: {})", reason, error.message);

                if self.abort_on_exhausted {
                    unit.mark_failed(reason.clone());
                    self.fail(reason.clone());
                    UnitOutcome::Exhausted {
                        name,
                        reason,
                        session_failed: true,
                    }
                } else {
                    self.accountant.remove_unit(unit);
                    unit.mark_failed(reason.clone());
                    self.total_count -= 1;
                    UnitOutcome::Exhausted {
                        name,
                        reason,
                        session_failed: false,
                    }
                }
            }
        }
    }

    /// 退避结束，单元重新可调度
    pub fn release_retry(&mut self, id: usize) -> bool {
        match self.units.get_mut(id) {
            Some(unit) if unit.status == UnitStatus::Queued && unit.waiting_retry => {
                unit.waiting_retry = false;
                true
            }
            _ => false,
        }
    }

    /// 所有单元都已结束（成功或永久失败）
    pub fn is_settled(&self) -> bool {
        !self.units.iter().any(|u| u.is_pending())
    }

    /// 提交前检查
    pub fn commit_readiness(&self) -> CommitReadiness {
        if !self.is_settled() {
            return CommitReadiness::Pending;
        }
        if self.uploaded_count > 0 && self.uploaded_count == self.total_count {
            return CommitReadiness::Ready;
        }

        let failed = self
            .units
            .iter()
            .filter(|u| u.status == UnitStatus::Failed)
            .count();
        CommitReadiness::NothingUploaded(failed.max(self.total_count.saturating_sub(self.uploaded_count)))
    }

    /// 进入提交阶段，返回任务 ID
    ///
    /// 只有 Uploading -> Committing 这一次转换能成功，保证提交只发生一次
    pub fn begin_commit(&mut self) -> Result<TaskId, UploadError> {
        self.ensure_phase(SessionPhase::Uploading, "commit")?;
        let task_id = self.task_id.clone().ok_or(UploadError::InvalidPhase {
            current: self.phase,
            operation: "commit",
        })?;
        self.phase = SessionPhase::Committing;
        Ok(task_id)
    }

    /// 提交成功
    pub fn finish_commit(&mut self) {
        info!(
            "会话 {} 提交成功: task={:?}, files={}",
            self.id, self.task_id, self.uploaded_count
        );
        self.phase = SessionPhase::Committed;
        self.error = None;
    }

    /// 会话失败
    pub fn fail(&mut self, message: impl Into<String>) {
        let message = message.into();
        warn!("会话 {} 失败: {}", self.id, message);
        self.phase = SessionPhase::Failed;
        self.error = Some(message);
    }

    /// 取消：丢弃所有文件，重置为空的 Editing 会话
    pub fn cancel(&mut self) {
        info!("会话 {} 已取消 (phase={:?})", self.id, self.phase);
        self.clear_units();
        self.id = Uuid::new_v4().to_string();
        self.task_id = None;
        self.phase = SessionPhase::Editing;
        self.creating_task = false;
        self.error = None;
        self.created_at = Local::now();
    }

    fn clear_units(&mut self) {
        self.units.clear();
        self.accountant = ProgressAccountant::new(self.progress_interval);
        self.total_count = 0;
        self.uploaded_count = 0;
    }

    /// 生成快照
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.id.clone(),
            project_id: self.project_id,
            uploading: self.creating_task
                || matches!(self.phase, SessionPhase::Uploading | SessionPhase::Committing),
            editing: self.phase == SessionPhase::Editing
                && !self.creating_task
                && !self.units.is_empty(),
            error: self.error.clone(),
            progress: self.progress(),
            files: self.units.iter().map(FileSnapshot::from).collect(),
            total_count: self.total_count,
            uploaded_count: self.uploaded_count,
            total_bytes: self.total_bytes(),
            total_bytes_sent: self.total_bytes_sent(),
            phase: self.phase,
            task_id: self.task_id.clone(),
            created_at: self.created_at,
        }
    }
}
