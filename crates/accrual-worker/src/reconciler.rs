//! 积分对账循环
//!
//! 按固定周期拉取 NEW / PROCESSING 订单，交给 worker 池向积分系统查询并写回。
//! 上一轮未完成时不会开始新一轮，错过的周期直接跳过；
//! 退避期内的周期整体跳过，不读取存储也不发请求。

use std::sync::Arc;
use std::time::Duration;

use loyalty_shared::config::ReconciliationConfig;
use loyalty_shared::error::LoyaltyError;
use loyalty_shared::observability::metrics;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, error, info};

use crate::backoff::BackoffGate;
use crate::client::AccrualService;
use crate::distributor::distribute;
use crate::models::OrderStatus;
use crate::pool::{CycleReport, WorkerPool};
use crate::repository::OrderRepository;
use crate::shutdown;

/// 单轮对账的结果
#[derive(Debug)]
pub enum CycleOutcome {
    /// 正常完成（包括没有待处理订单）
    Completed(CycleReport),
    /// 处于退避期，本轮跳过
    SkippedBackoff { resume_at: Instant },
    /// 读取待处理订单失败
    StorageError(LoyaltyError),
    /// 读取订单期间收到关闭信号
    Cancelled,
}

impl CycleOutcome {
    fn label(&self) -> &'static str {
        match self {
            Self::Completed(_) => "completed",
            Self::SkippedBackoff { .. } => "skipped_backoff",
            Self::StorageError(_) => "storage_error",
            Self::Cancelled => "cancelled",
        }
    }
}

/// 积分对账器
pub struct AccrualReconciler {
    repository: Arc<dyn OrderRepository>,
    pool: WorkerPool,
    gate: Arc<BackoffGate>,
    poll_interval: Duration,
}

impl AccrualReconciler {
    pub fn new(
        client: Arc<dyn AccrualService>,
        repository: Arc<dyn OrderRepository>,
        config: &ReconciliationConfig,
    ) -> Self {
        let gate = Arc::new(BackoffGate::new());
        let pool = WorkerPool::new(config.workers, client, repository.clone(), gate.clone());
        Self {
            repository,
            pool,
            gate,
            poll_interval: config.poll_interval(),
        }
    }

    /// 共享的退避闸门
    pub fn gate(&self) -> Arc<BackoffGate> {
        self.gate.clone()
    }

    /// 启动对账循环，直到收到 shutdown 信号
    ///
    /// 第一轮在启动一个周期后执行。返回时所有 worker 均已退出。
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            poll_interval_secs = self.poll_interval.as_secs(),
            workers = self.pool.size(),
            "积分对账循环已启动"
        );

        let mut ticker = interval_at(Instant::now() + self.poll_interval, self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = shutdown::cancelled(&mut shutdown) => break,
                _ = ticker.tick() => {}
            }

            match self.run_cycle(&shutdown).await {
                CycleOutcome::Completed(report) if report.dispatched > 0 => {
                    info!(
                        dispatched = report.dispatched,
                        updated = report.updated,
                        not_registered = report.not_registered,
                        rate_limited = report.rate_limited,
                        failed = report.failed,
                        "本轮对账完成"
                    );
                }
                CycleOutcome::Completed(_) => debug!("本轮没有待处理订单"),
                CycleOutcome::SkippedBackoff { resume_at } => {
                    let remaining = resume_at.saturating_duration_since(Instant::now());
                    debug!(
                        remaining_ms = remaining.as_millis() as u64,
                        "积分系统限流中，跳过本轮"
                    );
                }
                CycleOutcome::StorageError(e) => {
                    error!(error = %e, code = e.code(), "读取待处理订单失败，等待下一轮");
                }
                CycleOutcome::Cancelled => break,
            }
        }

        info!("积分对账循环已停止");
    }

    /// 执行一轮对账
    pub async fn run_cycle(&self, shutdown: &watch::Receiver<bool>) -> CycleOutcome {
        let outcome = self.reconcile(shutdown).await;
        metrics::record_cycle(outcome.label());
        outcome
    }

    async fn reconcile(&self, shutdown: &watch::Receiver<bool>) -> CycleOutcome {
        if let Some(resume_at) = self.gate.blocked_until(Instant::now()) {
            return CycleOutcome::SkippedBackoff { resume_at };
        }

        let mut cancel = shutdown.clone();
        let loaded = tokio::select! {
            biased;
            _ = shutdown::cancelled(&mut cancel) => return CycleOutcome::Cancelled,
            loaded = self.repository.get_orders_by_status(&OrderStatus::CANDIDATES) => loaded,
        };

        let orders = match loaded {
            Ok(orders) => orders,
            Err(e) => return CycleOutcome::StorageError(e),
        };

        if orders.is_empty() {
            return CycleOutcome::Completed(CycleReport::default());
        }

        debug!(count = orders.len(), "开始分发待处理订单");

        let (feed, producer) = distribute(orders, shutdown.clone());
        let report = self.pool.drain(feed, shutdown).await;
        if let Err(e) = producer.await {
            error!(error = %e, "订单分发任务异常退出");
        }

        CycleOutcome::Completed(report)
    }
}
