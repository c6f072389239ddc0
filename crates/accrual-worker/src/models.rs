//! 订单、余额与积分判定的数据模型
//!
//! 枚举同时支持数据库（sqlx）和 JSON（serde）序列化。

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize};

/// 订单状态
///
/// 状态只由对账引擎推进，PROCESSED 与 INVALID 为终态
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(type_name = "varchar", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    /// 已上传，尚未向积分系统查询
    #[default]
    New,
    /// 积分系统已登记或正在计算
    Processing,
    /// 积分系统拒绝计算，不会产生积分
    Invalid,
    /// 积分已计算并入账
    Processed,
}

impl OrderStatus {
    /// 需要继续轮询的状态
    pub const CANDIDATES: [OrderStatus; 2] = [OrderStatus::New, OrderStatus::Processing];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::Processing => "PROCESSING",
            Self::Invalid => "INVALID",
            Self::Processed => "PROCESSED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Invalid | Self::Processed)
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 积分系统给出的订单状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccrualStatus {
    Registered,
    Processing,
    Invalid,
    Processed,
}

impl AccrualStatus {
    /// 积分系统状态到内部订单状态的固定映射
    pub fn to_order_status(self) -> OrderStatus {
        match self {
            Self::Registered | Self::Processing => OrderStatus::Processing,
            Self::Invalid => OrderStatus::Invalid,
            Self::Processed => OrderStatus::Processed,
        }
    }
}

/// 积分系统对单个订单的判定（`GET /api/orders/{number}` 的 200 响应体）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Judgement {
    pub order: String,
    pub status: AccrualStatus,
    #[serde(
        default,
        deserialize_with = "non_negative_accrual",
        skip_serializing_if = "Option::is_none"
    )]
    pub accrual: Option<Decimal>,
}

/// 负数积分视为响应格式错误
fn non_negative_accrual<'de, D>(deserializer: D) -> Result<Option<Decimal>, D::Error>
where
    D: Deserializer<'de>,
{
    let accrual = Option::<Decimal>::deserialize(deserializer)?;
    match accrual {
        Some(value) if value < Decimal::ZERO => Err(
            serde::de::Error::custom(format!("accrual must not be negative: {value}")),
        ),
        other => Ok(other),
    }
}

impl Judgement {
    /// 写回存储的金额：只有 PROCESSED 才携带积分，缺省按 0 计
    pub fn awarded(&self) -> Option<Decimal> {
        match self.status {
            AccrualStatus::Processed => Some(self.accrual.unwrap_or(Decimal::ZERO)),
            _ => None,
        }
    }
}

/// 用户上传的订单
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Order {
    pub number: String,
    pub status: OrderStatus,
    pub accrual: Option<Decimal>,
    #[serde(skip)]
    pub user_id: i64,
    pub uploaded_at: DateTime<Utc>,
}

/// 用户余额
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Balance {
    pub current: Decimal,
    pub withdrawn: Decimal,
}

/// 积分提现记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Withdrawal {
    #[serde(rename = "order")]
    pub order_number: String,
    pub sum: Decimal,
    pub processed_at: DateTime<Utc>,
}

/// 用户账号（密码哈希由上层生成）
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct User {
    pub id: i64,
    pub login: String,
    pub password_hash: String,
}
