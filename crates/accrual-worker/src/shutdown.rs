//! 关闭信号辅助函数
//!
//! 进程级关闭信号为 `watch::Receiver<bool>`，值变为 `true` 或发送端被释放都视为关闭。

use tokio::sync::watch;

/// 等待关闭信号
pub async fn cancelled(shutdown: &mut watch::Receiver<bool>) {
    // 发送端释放时 wait_for 返回 Err，同样视为关闭
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// 非阻塞检查是否已关闭
pub fn is_cancelled(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow() || shutdown.has_changed().is_err()
}
