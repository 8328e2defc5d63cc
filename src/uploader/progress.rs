// 进度核算
//
// 把传输层上报的"本次尝试累计已发送字节数"折算成会话总进度：
// - 原始采样按文件大小截断
// - 非终态采样按会话级节流间隔合并
// - 只累加增量，重试时回滚该文件已计入的字节，避免重复计数
//
// 会话总量只能通过这里的方法修改

use crate::uploader::{ProgressThrottler, TransferUnit};
use std::time::Duration;
use tokio::time::Instant;

/// 进度核算器
#[derive(Debug, Clone)]
pub struct ProgressAccountant {
    /// 会话内所有文件的总字节数
    total_bytes: u64,
    /// 已计入的字节数
    total_bytes_sent: u64,
    /// 采样节流器
    throttler: ProgressThrottler,
}

impl ProgressAccountant {
    pub fn new(interval: Duration) -> Self {
        Self {
            total_bytes: 0,
            total_bytes_sent: 0,
            throttler: ProgressThrottler::new(interval),
        }
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn total_bytes_sent(&self) -> u64 {
        self.total_bytes_sent
    }

    /// 进度百分比 (0-100)
    pub fn percent(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        ((self.total_bytes_sent as f64 / self.total_bytes as f64) * 100.0).min(100.0)
    }

    /// 新文件加入会话
    pub fn add_unit(&mut self, unit: &TransferUnit) {
        self.total_bytes += unit.size();
    }

    /// 文件被永久移出会话，连同已计入的字节一起扣除
    pub fn remove_unit(&mut self, unit: &mut TransferUnit) {
        self.total_bytes_sent = self
            .total_bytes_sent
            .saturating_sub(unit.bytes_sent_tracked);
        self.total_bytes = self.total_bytes.saturating_sub(unit.size());
        unit.bytes_sent_tracked = 0;
        unit.bytes_sent_raw = 0;
    }

    /// 处理一次进度采样
    ///
    /// # 返回
    /// 采样被接受（总量可能已更新）时返回 true
    pub fn record_sample(&mut self, unit: &mut TransferUnit, raw_bytes_sent: u64, now: Instant) -> bool {
        let raw = raw_bytes_sent.min(unit.size());

        let accepted = if raw == unit.size() {
            self.throttler.force_accept(now);
            true
        } else {
            self.throttler.should_accept(now)
        };
        if !accepted {
            return false;
        }

        // 同一次尝试内原始值不应回退；回退的采样不贡献增量
        let delta = raw.saturating_sub(unit.bytes_sent_raw);
        unit.bytes_sent_tracked += delta;
        unit.bytes_sent_raw = unit.bytes_sent_raw.max(raw);
        self.total_bytes_sent += delta;

        debug_assert!(unit.bytes_sent_tracked <= unit.size());
        debug_assert!(self.total_bytes_sent <= self.total_bytes);
        true
    }

    /// 上传确认后补齐该文件剩余的字节，使其净贡献恰好等于文件大小
    pub fn credit_completion(&mut self, unit: &mut TransferUnit) {
        let remaining = unit.size().saturating_sub(unit.bytes_sent_tracked);
        self.total_bytes_sent += remaining;
        unit.bytes_sent_tracked = unit.size();
        unit.bytes_sent_raw = unit.size();
    }

    /// 重试前回滚该文件已计入的字节
    pub fn rollback(&mut self, unit: &mut TransferUnit) {
        self.total_bytes_sent = self
            .total_bytes_sent
            .saturating_sub(unit.bytes_sent_tracked);
        unit.bytes_sent_tracked = 0;
        unit.bytes_sent_raw = 0;
    }
}
