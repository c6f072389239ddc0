//! 退避闸门
//!
//! 积分系统只有一个全局限流额度：任一 worker 收到 429 后写入恢复时间点，
//! 所有 worker 和后续轮询在该时间点之前都不得再发请求。
//! 状态只有一个时间戳，用互斥锁保护读写，写入为无条件覆盖（后写者生效）。

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::{Instant, sleep_until};

use crate::shutdown;

/// 共享的退避状态，通过 Arc 在 worker 和对账循环之间共享
#[derive(Debug, Default)]
pub struct BackoffGate {
    resume_at: Mutex<Option<Instant>>,
}

impl BackoffGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// `now` 早于恢复时间点时返回 true
    pub fn should_wait(&self, now: Instant) -> bool {
        self.blocked_until(now).is_some()
    }

    /// 覆盖恢复时间点
    pub fn set_resume_at(&self, resume_at: Instant) {
        *self.resume_at.lock() = Some(resume_at);
    }

    pub fn resume_at(&self) -> Option<Instant> {
        *self.resume_at.lock()
    }

    /// 仍处于退避期时返回恢复时间点
    pub fn blocked_until(&self, now: Instant) -> Option<Instant> {
        self.resume_at().filter(|resume_at| now < *resume_at)
    }

    /// 等待退避结束
    ///
    /// 睡眠期间其他 worker 可能再次写入更晚的时间点，因此醒来后重新检查。
    /// 收到关闭信号返回 false，否则返回 true。
    pub async fn wait(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        loop {
            if shutdown::is_cancelled(shutdown) {
                return false;
            }

            let Some(resume_at) = self.blocked_until(Instant::now()) else {
                return true;
            };

            tokio::select! {
                biased;
                _ = shutdown::cancelled(shutdown) => return false,
                _ = sleep_until(resume_at) => {}
            }
        }
    }
}
