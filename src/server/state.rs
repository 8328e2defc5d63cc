// 应用状态

use crate::config::AppConfig;
use crate::repository::{HttpTaskRepository, TaskRepository};
use crate::uploader::UploadManager;
use std::sync::Arc;

/// 应用全局状态
#[derive(Clone)]
pub struct AppState {
    /// 上传管理器
    pub upload_manager: Arc<UploadManager>,
}

impl AppState {
    /// 创建新的应用状态，使用 HTTP 任务仓库
    pub fn new(config: AppConfig) -> anyhow::Result<Self> {
        let repository = HttpTaskRepository::new(&config.repository)?;
        Ok(Self::with_repository(config, Arc::new(repository)))
    }

    /// 使用指定的任务仓库创建应用状态
    pub fn with_repository(config: AppConfig, repository: Arc<dyn TaskRepository>) -> Self {
        Self {
            upload_manager: Arc::new(UploadManager::new(repository, &config.upload)),
        }
    }

    /// 优雅关闭：取消所有进行中的上传
    pub fn shutdown(&self) {
        self.upload_manager.shutdown();
    }
}
