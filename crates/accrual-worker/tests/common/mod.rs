//! 集成测试共用的内存仓储和脚本化积分服务

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use accrual_worker::client::AccrualService;
use accrual_worker::error::AccrualError;
use accrual_worker::models::{AccrualStatus, Judgement, Order, OrderStatus};
use accrual_worker::repository::OrderRepository;
use async_trait::async_trait;
use chrono::{TimeDelta, Utc};
use loyalty_shared::error::{LoyaltyError, Result};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use tokio::time::Instant;

// ==================== 内存仓储 ====================

#[derive(Default)]
struct Store {
    orders: BTreeMap<String, Order>,
    balances: HashMap<i64, Decimal>,
}

/// 与 PostgreSQL 实现语义一致的内存仓储：PROCESSED 订单不再更新，入账与状态变更原子完成
#[derive(Default)]
pub struct InMemoryOrderRepository {
    store: Mutex<Store>,
    fail_reads: AtomicBool,
    update_calls: Mutex<Vec<(String, OrderStatus, Option<Decimal>)>>,
}

impl InMemoryOrderRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// 插入一条订单，uploaded_at 按插入顺序递增
    pub fn insert(&self, number: &str, user_id: i64, status: OrderStatus) {
        let mut store = self.store.lock();
        let offset = store.orders.len() as i64;
        store.orders.insert(
            number.to_string(),
            Order {
                number: number.to_string(),
                status,
                accrual: None,
                user_id,
                uploaded_at: Utc::now() + TimeDelta::milliseconds(offset),
            },
        );
        store.balances.entry(user_id).or_default();
    }

    pub fn order(&self, number: &str) -> Option<Order> {
        self.store.lock().orders.get(number).cloned()
    }

    pub fn balance(&self, user_id: i64) -> Decimal {
        self.store
            .lock()
            .balances
            .get(&user_id)
            .copied()
            .unwrap_or_default()
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn update_calls(&self) -> Vec<(String, OrderStatus, Option<Decimal>)> {
        self.update_calls.lock().clone()
    }
}

#[async_trait]
impl OrderRepository for InMemoryOrderRepository {
    async fn get_orders_by_status(&self, statuses: &[OrderStatus]) -> Result<Vec<Order>> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(LoyaltyError::Internal("storage unavailable".to_string()));
        }

        let store = self.store.lock();
        let mut orders: Vec<Order> = store
            .orders
            .values()
            .filter(|o| statuses.contains(&o.status))
            .cloned()
            .collect();
        orders.sort_by_key(|o| o.uploaded_at);
        Ok(orders)
    }

    async fn update_order(
        &self,
        number: &str,
        status: OrderStatus,
        accrual: Option<Decimal>,
    ) -> Result<()> {
        self.update_calls
            .lock()
            .push((number.to_string(), status, accrual));

        if accrual.is_some_and(|a| a < Decimal::ZERO) {
            return Err(LoyaltyError::Validation(format!("订单 {number} 的积分不能为负数")));
        }

        let mut store = self.store.lock();
        let Store { orders, balances } = &mut *store;

        let order = orders.get_mut(number).ok_or_else(|| LoyaltyError::NotFound {
            entity: "Order".to_string(),
            id: number.to_string(),
        })?;

        if order.status == OrderStatus::Processed {
            return Ok(());
        }

        order.status = status;
        order.accrual = accrual;

        if status == OrderStatus::Processed {
            *balances.entry(order.user_id).or_default() += accrual.unwrap_or_default();
        }
        Ok(())
    }
}

// ==================== 脚本化积分服务 ====================

/// 积分服务的一次应答
#[derive(Debug, Clone)]
pub enum Reply {
    Judged(AccrualStatus, Option<Decimal>),
    NotRegistered,
    RateLimited(Duration),
    ServerError,
    /// 原样解码的 200 响应体
    Body(&'static str),
}

impl Reply {
    pub fn processed(accrual: i64) -> Self {
        Self::Judged(AccrualStatus::Processed, Some(Decimal::from(accrual)))
    }
}

/// 按订单号预设应答序列，最后一个应答重复使用；未设置的订单返回 204
#[derive(Default)]
pub struct ScriptedAccrualService {
    scripts: Mutex<HashMap<String, VecDeque<Reply>>>,
    calls: Mutex<Vec<(String, Instant)>>,
    /// 最近一次 429 给出的恢复时间点，以及此后发生的违规请求
    limited_until: Mutex<Option<Instant>>,
    violations: Mutex<Vec<(String, Instant)>>,
}

impl ScriptedAccrualService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, number: &str, replies: impl IntoIterator<Item = Reply>) {
        self.scripts
            .lock()
            .insert(number.to_string(), replies.into_iter().collect());
    }

    pub fn calls(&self) -> Vec<(String, Instant)> {
        self.calls.lock().clone()
    }

    pub fn calls_for(&self, number: &str) -> usize {
        self.calls.lock().iter().filter(|(n, _)| n == number).count()
    }

    /// 在退避期内发出的请求
    pub fn violations(&self) -> Vec<(String, Instant)> {
        self.violations.lock().clone()
    }

    fn next_reply(&self, number: &str) -> Reply {
        let mut scripts = self.scripts.lock();
        match scripts.get_mut(number) {
            Some(replies) if replies.len() > 1 => {
                replies.pop_front().unwrap_or(Reply::NotRegistered)
            }
            Some(replies) => replies.front().cloned().unwrap_or(Reply::NotRegistered),
            None => Reply::NotRegistered,
        }
    }
}

#[async_trait]
impl AccrualService for ScriptedAccrualService {
    async fn fetch_judgement(
        &self,
        order_number: &str,
    ) -> std::result::Result<Judgement, AccrualError> {
        let now = Instant::now();
        self.calls.lock().push((order_number.to_string(), now));

        {
            let limited = self.limited_until.lock();
            if matches!(*limited, Some(until) if now < until) {
                self.violations.lock().push((order_number.to_string(), now));
            }
        }

        match self.next_reply(order_number) {
            Reply::Judged(status, accrual) => Ok(Judgement {
                order: order_number.to_string(),
                status,
                accrual,
            }),
            Reply::NotRegistered => Err(AccrualError::NotRegistered {
                order_number: order_number.to_string(),
            }),
            Reply::RateLimited(retry_after) => {
                let resume_at = now + retry_after;
                *self.limited_until.lock() = Some(resume_at);
                Err(AccrualError::RateLimited {
                    retry_after,
                    resume_at,
                })
            }
            Reply::ServerError => Err(AccrualError::Server),
            Reply::Body(body) => Ok(serde_json::from_str(body)?),
        }
    }
}
