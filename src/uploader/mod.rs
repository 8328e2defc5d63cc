// 上传流水线
//
// 任务创建 -> 并发上传文件 -> 提交任务
// - 传输单元：单个文件及其传输记录
// - 进度核算：节流合并采样，重试时回滚，避免重复计数
// - 重试控制：线性退避，超出大小上限的文件直接移出
// - 协调循环：JoinSet 管理在途传输，单一所有者修改会话

pub mod commit;
pub mod engine;
pub mod events;
pub mod gate;
pub mod manager;
pub mod progress;
pub mod retry;
pub mod session;
pub mod throttle;
pub mod unit;

pub use commit::{CommitOutcome, CommitStep};
pub use engine::{SessionOutcome, UploadEngine, DEFAULT_PARALLEL_UPLOADS};
pub use events::{EventPublisher, ProgressReporter, TransferEvent, UploadEvent};
pub use gate::validate_params;
pub use manager::UploadManager;
pub use progress::ProgressAccountant;
pub use retry::{
    calculate_backoff_delay, RetryDecision, RetryPolicy, DEFAULT_MAX_FILE_SIZE_MB, MAX_RETRIES,
    RETRY_BASE_DELAY_MS,
};
pub use session::{
    CommitReadiness, Dispatch, FileRejection, SessionPhase, SessionSnapshot, UnitOutcome,
    UploadSession,
};
pub use throttle::{ProgressThrottler, DEFAULT_PROGRESS_INTERVAL_MS};
pub use unit::{FileSnapshot, TransferUnit, UnitStatus, UploadFile};
