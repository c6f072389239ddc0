//! 订单与余额仓储
//!
//! `OrderRepository` 是对账引擎依赖的最小存储契约；`PgOrderRepository` 为其
//! PostgreSQL 实现，并额外提供订单上传、余额查询、提现等数据访问。

use async_trait::async_trait;
use loyalty_shared::error::{LoyaltyError, Result};
use rust_decimal::Decimal;
use sqlx::PgPool;
use tracing::{debug, instrument};

use crate::models::{Balance, Order, OrderStatus, User, Withdrawal};
use crate::order_number::OrderNumber;

/// 对账引擎使用的仓储接口
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait OrderRepository: Send + Sync {
    /// 按状态集合查询订单
    async fn get_orders_by_status(&self, statuses: &[OrderStatus]) -> Result<Vec<Order>>;

    /// 原子地更新订单状态；状态为 PROCESSED 时在同一事务内为订单所属用户入账
    async fn update_order(
        &self,
        number: &str,
        status: OrderStatus,
        accrual: Option<Decimal>,
    ) -> Result<()>;
}

/// 订单上传结果行
#[derive(sqlx::FromRow)]
struct UploadedOrder {
    #[sqlx(flatten)]
    order: Order,
    is_new: bool,
}

/// PostgreSQL 订单仓储
#[derive(Clone)]
pub struct PgOrderRepository {
    pool: PgPool,
}

impl PgOrderRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    // ==================== 用户 ====================

    /// 创建用户并初始化零余额
    pub async fn create_user(&self, login: &str, password_hash: &str) -> Result<User> {
        let mut tx = self.pool.begin().await?;

        let user = sqlx::query_as::<_, User>(
            r#"
            INSERT INTO users (login, password_hash)
            VALUES ($1, $2)
            ON CONFLICT (login) DO NOTHING
            RETURNING id, login, password_hash
            "#,
        )
        .bind(login)
        .bind(password_hash)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| LoyaltyError::AlreadyExists {
            entity: "User".to_string(),
            field: "login".to_string(),
            value: login.to_string(),
        })?;

        sqlx::query("INSERT INTO balances (user_id) VALUES ($1)")
            .bind(user.id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(user)
    }

    // ==================== 订单 ====================

    /// 上传订单
    ///
    /// 订单号已存在时不插入，返回已有记录和 `false`，调用方据此区分
    /// "本人重复上传" 与 "他人已上传"。
    pub async fn add_order(&self, user_id: i64, number: &OrderNumber) -> Result<(Order, bool)> {
        let row = sqlx::query_as::<_, UploadedOrder>(
            r#"
            WITH inserted AS (
                INSERT INTO orders (number, user_id)
                VALUES ($1, $2)
                ON CONFLICT (number) DO NOTHING
                RETURNING number, status, accrual, user_id, uploaded_at
            )
            SELECT number, status, accrual, user_id, uploaded_at, TRUE AS is_new FROM inserted
            UNION ALL
            SELECT number, status, accrual, user_id, uploaded_at, FALSE AS is_new
            FROM orders WHERE number = $1
            LIMIT 1
            "#,
        )
        .bind(number.as_str())
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        Ok((row.order, row.is_new))
    }

    /// 列出用户订单，按上传时间升序
    pub async fn list_user_orders(&self, user_id: i64) -> Result<Vec<Order>> {
        let orders = sqlx::query_as::<_, Order>(
            r#"
            SELECT number, status, accrual, user_id, uploaded_at
            FROM orders
            WHERE user_id = $1
            ORDER BY uploaded_at ASC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(orders)
    }

    /// 按订单号获取订单
    pub async fn get_order(&self, number: &str) -> Result<Option<Order>> {
        let order = sqlx::query_as::<_, Order>(
            r#"
            SELECT number, status, accrual, user_id, uploaded_at
            FROM orders
            WHERE number = $1
            "#,
        )
        .bind(number)
        .fetch_optional(&self.pool)
        .await?;

        Ok(order)
    }

    // ==================== 余额与提现 ====================

    pub async fn get_balance(&self, user_id: i64) -> Result<Balance> {
        sqlx::query_as::<_, Balance>(
            "SELECT current, withdrawn FROM balances WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| LoyaltyError::NotFound {
            entity: "Balance".to_string(),
            id: user_id.to_string(),
        })
    }

    /// 提现
    ///
    /// 锁定余额行后校验，余额不足时整个事务回滚
    pub async fn withdraw(
        &self,
        user_id: i64,
        order_number: &OrderNumber,
        sum: Decimal,
    ) -> Result<()> {
        if sum <= Decimal::ZERO {
            return Err(LoyaltyError::Validation("提现金额必须大于 0".to_string()));
        }

        let mut tx = self.pool.begin().await?;

        let current: Decimal = sqlx::query_scalar(
            "SELECT current FROM balances WHERE user_id = $1 FOR UPDATE",
        )
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| LoyaltyError::NotFound {
            entity: "Balance".to_string(),
            id: user_id.to_string(),
        })?;

        if current < sum {
            return Err(LoyaltyError::InsufficientFunds {
                required: sum,
                actual: current,
            });
        }

        sqlx::query(
            r#"
            INSERT INTO withdrawals (order_number, sum, user_id)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(order_number.as_str())
        .bind(sum)
        .bind(user_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            UPDATE balances
            SET current = current - $1, withdrawn = withdrawn + $1
            WHERE user_id = $2
            "#,
        )
        .bind(sum)
        .bind(user_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// 列出用户提现记录，按处理时间升序
    pub async fn list_withdrawals(&self, user_id: i64) -> Result<Vec<Withdrawal>> {
        let withdrawals = sqlx::query_as::<_, Withdrawal>(
            r#"
            SELECT order_number, sum, processed_at
            FROM withdrawals
            WHERE user_id = $1
            ORDER BY processed_at ASC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(withdrawals)
    }
}

#[async_trait]
impl OrderRepository for PgOrderRepository {
    async fn get_orders_by_status(&self, statuses: &[OrderStatus]) -> Result<Vec<Order>> {
        let statuses: Vec<&str> = statuses.iter().map(OrderStatus::as_str).collect();

        let orders = sqlx::query_as::<_, Order>(
            r#"
            SELECT number, status, accrual, user_id, uploaded_at
            FROM orders
            WHERE status = ANY($1)
            ORDER BY uploaded_at ASC
            "#,
        )
        .bind(&statuses)
        .fetch_all(&self.pool)
        .await?;

        Ok(orders)
    }

    /// 已入账（PROCESSED）的订单不会被再次更新，重复写回不会重复入账
    #[instrument(skip(self))]
    async fn update_order(
        &self,
        number: &str,
        status: OrderStatus,
        accrual: Option<Decimal>,
    ) -> Result<()> {
        if accrual.is_some_and(|a| a < Decimal::ZERO) {
            return Err(LoyaltyError::Validation(format!(
                "订单 {number} 的积分不能为负数"
            )));
        }

        let mut tx = self.pool.begin().await?;

        let user_id: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE orders
            SET status = $2, accrual = $3
            WHERE number = $1 AND status <> 'PROCESSED'
            RETURNING user_id
            "#,
        )
        .bind(number)
        .bind(status.as_str())
        .bind(accrual)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(user_id) = user_id else {
            let exists: bool =
                sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM orders WHERE number = $1)")
                    .bind(number)
                    .fetch_one(&mut *tx)
                    .await?;

            if !exists {
                return Err(LoyaltyError::NotFound {
                    entity: "Order".to_string(),
                    id: number.to_string(),
                });
            }

            debug!(order_number = number, "订单已入账，忽略重复写回");
            return Ok(());
        };

        if status == OrderStatus::Processed {
            let credited = sqlx::query(
                "UPDATE balances SET current = current + $1 WHERE user_id = $2",
            )
            .bind(accrual.unwrap_or(Decimal::ZERO))
            .bind(user_id)
            .execute(&mut *tx)
            .await?;

            if credited.rows_affected() == 0 {
                return Err(LoyaltyError::NotFound {
                    entity: "Balance".to_string(),
                    id: user_id.to_string(),
                });
            }
        }

        tx.commit().await?;
        Ok(())
    }
}
