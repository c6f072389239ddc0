//! Worker 池
//!
//! 固定数量的 worker 并发消费同一个订单来源：每个订单先等待退避闸门放行，
//! 再向积分系统查询判定，最后把映射后的状态和积分写回存储。
//! 单个订单失败只记录日志，不影响同批次其他订单。

use std::ops::AddAssign;
use std::sync::Arc;

use futures::future::join_all;
use loyalty_shared::observability::metrics;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::backoff::BackoffGate;
use crate::client::AccrualService;
use crate::distributor::OrderFeed;
use crate::error::{AccrualError, ErrorKind};
use crate::models::{Judgement, Order, OrderStatus};
use crate::repository::OrderRepository;
use crate::shutdown;

/// 一轮对账的处理统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// 实际发出的积分系统请求数
    pub dispatched: usize,
    /// 写回存储成功的订单数
    pub updated: usize,
    pub not_registered: usize,
    pub rate_limited: usize,
    /// 请求或写回失败的订单数
    pub failed: usize,
}

impl CycleReport {
    fn record(&mut self, outcome: ItemOutcome) {
        match outcome {
            ItemOutcome::Updated => self.updated += 1,
            ItemOutcome::NotRegistered => self.not_registered += 1,
            ItemOutcome::RateLimited => self.rate_limited += 1,
            ItemOutcome::Failed => self.failed += 1,
        }
    }
}

impl AddAssign for CycleReport {
    fn add_assign(&mut self, other: Self) {
        self.dispatched += other.dispatched;
        self.updated += other.updated;
        self.not_registered += other.not_registered;
        self.rate_limited += other.rate_limited;
        self.failed += other.failed;
    }
}

/// 单个订单的处理结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemOutcome {
    Updated,
    NotRegistered,
    RateLimited,
    Failed,
}

/// 固定大小的 worker 池
pub struct WorkerPool {
    size: usize,
    client: Arc<dyn AccrualService>,
    repository: Arc<dyn OrderRepository>,
    gate: Arc<BackoffGate>,
}

impl WorkerPool {
    /// 创建 worker 池，size 至少为 1
    pub fn new(
        size: usize,
        client: Arc<dyn AccrualService>,
        repository: Arc<dyn OrderRepository>,
        gate: Arc<BackoffGate>,
    ) -> Self {
        Self {
            size: size.max(1),
            client,
            repository,
            gate,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// 启动全部 worker 消费订单来源，等待它们全部退出后返回汇总统计
    ///
    /// 订单耗尽或收到关闭信号时 worker 退出。
    pub async fn drain(
        &self,
        feed: Arc<OrderFeed>,
        shutdown: &watch::Receiver<bool>,
    ) -> CycleReport {
        let handles: Vec<_> = (0..self.size)
            .map(|id| {
                let worker = Worker {
                    id,
                    client: self.client.clone(),
                    repository: self.repository.clone(),
                    gate: self.gate.clone(),
                };
                tokio::spawn(worker.run(feed.clone(), shutdown.clone()))
            })
            .collect();

        let mut report = CycleReport::default();
        for (id, result) in join_all(handles).await.into_iter().enumerate() {
            match result {
                Ok(worker_report) => report += worker_report,
                Err(e) => error!(worker = id, error = %e, "worker 异常退出"),
            }
        }
        report
    }
}

struct Worker {
    id: usize,
    client: Arc<dyn AccrualService>,
    repository: Arc<dyn OrderRepository>,
    gate: Arc<BackoffGate>,
}

impl Worker {
    async fn run(self, feed: Arc<OrderFeed>, mut shutdown: watch::Receiver<bool>) -> CycleReport {
        let mut report = CycleReport::default();

        while let Some(order) = feed.next(&mut shutdown).await {
            if !self.gate.wait(&mut shutdown).await {
                debug!(worker = self.id, order_number = %order.number, "退避等待期间收到关闭信号");
                break;
            }

            let result = tokio::select! {
                biased;
                _ = shutdown::cancelled(&mut shutdown) => {
                    debug!(worker = self.id, order_number = %order.number, "放弃进行中的积分查询");
                    break;
                }
                result = self.client.fetch_judgement(&order.number) => result,
            };
            report.dispatched += 1;

            let outcome = match result {
                Ok(judgement) => self.apply(&order, &judgement).await,
                Err(e) => self.on_error(&order, e),
            };
            report.record(outcome);
        }

        debug!(worker = self.id, ?report, "worker 退出");
        report
    }

    /// 写回判定结果
    async fn apply(&self, order: &Order, judgement: &Judgement) -> ItemOutcome {
        let status = judgement.status.to_order_status();
        let accrual = judgement.awarded();

        match self
            .repository
            .update_order(&order.number, status, accrual)
            .await
        {
            Ok(()) => {
                metrics::record_order_updated(status.as_str());
                if status == OrderStatus::Processed {
                    info!(
                        order_number = %order.number,
                        user_id = order.user_id,
                        accrual = ?accrual,
                        "订单积分已入账"
                    );
                } else {
                    debug!(order_number = %order.number, %status, "订单状态已更新");
                }
                ItemOutcome::Updated
            }
            Err(e) => {
                error!(
                    order_number = %order.number,
                    %status,
                    error = %e,
                    retryable = e.is_retryable(),
                    "订单状态写回失败"
                );
                ItemOutcome::Failed
            }
        }
    }

    fn on_error(&self, order: &Order, err: AccrualError) -> ItemOutcome {
        match err.kind() {
            ErrorKind::RateLimited(resume_at) => {
                self.gate.set_resume_at(resume_at);
                let retry_after_secs = match &err {
                    AccrualError::RateLimited { retry_after, .. } => retry_after.as_secs(),
                    _ => 0,
                };
                metrics::record_rate_limited(retry_after_secs);
                warn!(
                    worker = self.id,
                    order_number = %order.number,
                    retry_after_secs,
                    "积分系统限流，暂停所有请求"
                );
                ItemOutcome::RateLimited
            }
            ErrorKind::FatalToItem if matches!(err, AccrualError::NotRegistered { .. }) => {
                debug!(order_number = %order.number, "订单尚未在积分系统登记");
                ItemOutcome::NotRegistered
            }
            ErrorKind::Transient => {
                warn!(order_number = %order.number, error = %err, "积分查询失败，等待下一轮");
                ItemOutcome::Failed
            }
            ErrorKind::FatalToItem => {
                error!(order_number = %order.number, error = %err, "积分查询响应异常");
                ItemOutcome::Failed
            }
        }
    }
}
