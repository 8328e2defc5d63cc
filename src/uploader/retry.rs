// 重试控制
//
// 决定失败的传输单元是被移出会话、重新排队，还是已耗尽重试次数。
// 线性退避：第 n 次重试前等待 base × n，分散瞬时网络/服务器压力

use crate::config::UploadConfig;
use crate::uploader::TransferUnit;
use std::time::Duration;

/// 默认最大重试次数
pub const MAX_RETRIES: u32 = 20;

/// 退避基准延迟（毫秒）
pub const RETRY_BASE_DELAY_MS: u64 = 5000;

/// 默认单文件大小上限 (MB)
pub const DEFAULT_MAX_FILE_SIZE_MB: u64 = 131_072;

/// 计算线性退避延迟
///
/// # 延迟序列（base = 5000ms）
/// - retry_count=1: 5000ms
/// - retry_count=2: 10000ms
/// - retry_count=n: 5000ms × n
pub fn calculate_backoff_delay(retry_count: u32, base_delay_ms: u64) -> u64 {
    base_delay_ms.saturating_mul(retry_count as u64)
}

/// 重试决策
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// 文件超过大小上限，永久移出会话，不重试
    Reject,
    /// 重新排队，`retry_count` 为重试后的次数
    Retry { retry_count: u32, delay: Duration },
    /// 重试次数耗尽
    Exhausted,
}

/// 重试策略
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// 最大重试次数
    pub max_retries: u32,
    /// 退避基准延迟（毫秒）
    pub base_delay_ms: u64,
    /// 单文件大小上限（字节）
    pub max_file_size: u64,
}

impl RetryPolicy {
    pub fn from_config(config: &UploadConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay_ms: config.retry_base_delay_ms,
            max_file_size: config.max_file_size_mb.saturating_mul(1024 * 1024),
        }
    }

    /// 文件是否超过大小上限
    pub fn is_oversize(&self, size: u64) -> bool {
        size > self.max_file_size
    }

    /// 第 `retry_count` 次重试前的等待时间
    pub fn backoff_delay(&self, retry_count: u32) -> Duration {
        Duration::from_millis(calculate_backoff_delay(retry_count, self.base_delay_ms))
    }

    /// 针对一次失败做出决策（不修改单元）
    pub fn decide(&self, unit: &TransferUnit) -> RetryDecision {
        if self.is_oversize(unit.size()) {
            return RetryDecision::Reject;
        }

        if unit.retry_count < self.max_retries {
            let retry_count = unit.retry_count + 1;
            RetryDecision::Retry {
                retry_count,
                delay: self.backoff_delay(retry_count),
            }
        } else {
            RetryDecision::Exhausted
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: MAX_RETRIES,
            base_delay_ms: RETRY_BASE_DELAY_MS,
            max_file_size: DEFAULT_MAX_FILE_SIZE_MB * 1024 * 1024,
        }
    }
}
