//! 滑动窗口限流器
//!
//! 记录最近调用的时间戳，每次检查时先剔除窗口外的记录再计数；没有固定分桶，窗口相对每次检查的时刻连续滑动。
//! 检查不修改原值：成功时返回记录了新调用的副本，调用方需要把新状态传下去。

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;

/// 超限时返回的明细
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[error("rate limit exceeded: {current_count}/{max_calls} calls within {window_ms}ms")]
pub struct RateLimitExceeded {
    /// 检查时刻窗口内已有的调用数（不含本次请求）
    pub current_count: usize,
    pub max_calls: usize,
    pub window_ms: u64,
}

/// 滑动窗口状态：上限、窗口长度、窗口内调用时间戳（按时间升序）
#[derive(Debug, Clone)]
pub struct RateLimiter {
    max_calls: usize,
    window: Duration,
    calls: VecDeque<Instant>,
}

impl RateLimiter {
    pub fn new(max_calls: usize, window_ms: u64) -> Self {
        Self {
            max_calls,
            window: Duration::from_millis(window_ms),
            calls: VecDeque::new(),
        }
    }

    pub fn max_calls(&self) -> usize {
        self.max_calls
    }

    pub fn window_ms(&self) -> u64 {
        self.window.as_millis() as u64
    }

    /// 以当前时刻检查并登记 n 次调用
    pub fn check(&self, n: usize) -> Result<Self, RateLimitExceeded> {
        self.check_at(n, Instant::now())
    }

    /// 以指定时刻检查：窗口内计数 + n 不超过上限才放行，放行后在 now 处记录 n 个时间戳
    pub fn check_at(&self, n: usize, now: Instant) -> Result<Self, RateLimitExceeded> {
        let mut next = self.clone();
        next.prune(now);

        let current_count = next.calls.len();
        if current_count.checked_add(n).map_or(true, |total| total > self.max_calls) {
            return Err(RateLimitExceeded {
                current_count,
                max_calls: self.max_calls,
                window_ms: self.window_ms(),
            });
        }

        next.calls.extend(std::iter::repeat(now).take(n));
        Ok(next)
    }

    /// 指定时刻窗口内的调用数（只读）
    pub fn count_at(&self, now: Instant) -> usize {
        self.calls
            .iter()
            .filter(|t| !Self::expired(**t, now, self.window))
            .count()
    }

    fn prune(&mut self, now: Instant) {
        while let Some(oldest) = self.calls.front() {
            if Self::expired(*oldest, now, self.window) {
                self.calls.pop_front();
            } else {
                break;
            }
        }
    }

    /// 距 now 已满一个窗口即视为过期
    fn expired(at: Instant, now: Instant, window: Duration) -> bool {
        now.saturating_duration_since(at) >= window
    }
}
