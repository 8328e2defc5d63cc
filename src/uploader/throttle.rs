//! 进度采样节流器
//!
//! 控制会话级进度采样的接受频率，避免界面抖动
//! 终态采样（本次尝试发送完毕）总是被接受

use std::time::Duration;
use tokio::time::Instant;

/// 默认节流间隔（毫秒）
pub const DEFAULT_PROGRESS_INTERVAL_MS: u64 = 500;

/// 进度采样节流器
///
/// 由会话独占，调用方显式传入当前时间，便于在暂停时钟下测试
#[derive(Debug, Clone)]
pub struct ProgressThrottler {
    /// 上次接受采样的时间
    last_accepted: Option<Instant>,
    /// 节流间隔
    interval: Duration,
}

impl ProgressThrottler {
    /// 创建新的节流器
    pub fn new(interval: Duration) -> Self {
        Self {
            last_accepted: None,
            interval,
        }
    }

    /// 检查是否应该接受本次采样
    ///
    /// 距离上次接受已达到节流间隔时返回 true 并更新时间戳
    pub fn should_accept(&mut self, now: Instant) -> bool {
        let due = match self.last_accepted {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.interval,
        };
        if due {
            self.last_accepted = Some(now);
        }
        due
    }

    /// 强制接受（终态采样）
    pub fn force_accept(&mut self, now: Instant) {
        self.last_accepted = Some(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_throttler_basic() {
        let mut throttler = ProgressThrottler::new(Duration::from_millis(500));
        let t0 = Instant::now();

        // 第一次应该接受
        assert!(throttler.should_accept(t0));

        // 间隔内不接受
        assert!(!throttler.should_accept(t0 + Duration::from_millis(100)));
        assert!(!throttler.should_accept(t0 + Duration::from_millis(499)));

        // 达到间隔后接受
        assert!(throttler.should_accept(t0 + Duration::from_millis(500)));
    }

    #[test]
    fn test_force_accept_restarts_window() {
        let mut throttler = ProgressThrottler::new(Duration::from_millis(500));
        let t0 = Instant::now();

        assert!(throttler.should_accept(t0));
        throttler.force_accept(t0 + Duration::from_millis(400));

        // 窗口从强制接受的时间重新计算
        assert!(!throttler.should_accept(t0 + Duration::from_millis(600)));
        assert!(throttler.should_accept(t0 + Duration::from_millis(900)));
    }
}
