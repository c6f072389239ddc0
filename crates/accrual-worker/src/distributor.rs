//! 订单分发
//!
//! 生产者任务把一批订单逐个送入容量为 1 的通道，多个 worker 共享同一个接收端，
//! 每个订单恰好被一个 worker 取走。收到关闭信号后停止分发，未送出的订单被丢弃。

use std::sync::Arc;

use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::models::Order;
use crate::shutdown;

/// worker 共享的订单来源
#[derive(Debug)]
pub struct OrderFeed {
    rx: Mutex<mpsc::Receiver<Order>>,
}

impl OrderFeed {
    /// 取下一个订单
    ///
    /// 订单耗尽或收到关闭信号时返回 None
    pub async fn next(&self, shutdown: &mut watch::Receiver<bool>) -> Option<Order> {
        if shutdown::is_cancelled(shutdown) {
            return None;
        }

        let mut rx = tokio::select! {
            biased;
            _ = shutdown::cancelled(shutdown) => return None,
            rx = self.rx.lock() => rx,
        };

        tokio::select! {
            biased;
            _ = shutdown::cancelled(shutdown) => None,
            order = rx.recv() => order,
        }
    }
}

/// 启动分发任务
///
/// 返回共享的订单来源和生产者句柄，句柄结果为实际送出的订单数。
pub fn distribute(
    orders: Vec<Order>,
    mut shutdown: watch::Receiver<bool>,
) -> (Arc<OrderFeed>, JoinHandle<usize>) {
    let (tx, rx) = mpsc::channel(1);
    let total = orders.len();

    let producer = tokio::spawn(async move {
        let mut sent = 0usize;

        for order in orders {
            if shutdown::is_cancelled(&shutdown) {
                break;
            }

            tokio::select! {
                biased;
                _ = shutdown::cancelled(&mut shutdown) => break,
                result = tx.send(order) => {
                    // 接收端已释放：所有 worker 都已退出
                    if result.is_err() {
                        break;
                    }
                    sent += 1;
                }
            }
        }

        if sent < total {
            debug!(sent, total, "订单分发提前结束");
        }
        sent
    });

    (Arc::new(OrderFeed { rx: Mutex::new(rx) }), producer)
}
