// ODM Dashboard 上传服务核心库
//
// 将本地图片批量上传到处理任务：创建任务、并发上传、失败重试、提交任务

// 配置管理模块
pub mod config;

// 错误类型
pub mod error;

// 日志系统
pub mod logging;

// 任务仓库（远端接口）
pub mod repository;

// Web服务器模块
pub mod server;

// 上传引擎模块
pub mod uploader;

// 导出常用类型
pub use config::AppConfig;
pub use error::{ProjectId, RepositoryError, TaskId, UploadError};
pub use repository::{HttpTaskRepository, TaskParams, TaskRepository, UploadAck};
pub use server::AppState;
pub use uploader::{
    SessionOutcome, SessionPhase, SessionSnapshot, UploadEngine, UploadEvent, UploadFile,
    UploadManager, UploadSession,
};
