//! 存储与业务错误
//!
//! 积分系统的 HTTP 错误不在这里，见 accrual-worker 的 `AccrualError`。

use rust_decimal::Decimal;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LoyaltyError {
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    #[error("记录未找到: {entity} id={id}")]
    NotFound { entity: String, id: String },

    #[error("记录已存在: {entity} {field}={value}")]
    AlreadyExists {
        entity: String,
        field: String,
        value: String,
    },

    #[error("余额不足: 需要 {required}, 实际 {actual}")]
    InsufficientFunds { required: Decimal, actual: Decimal },

    #[error("无效的订单号: {number}")]
    InvalidOrderNumber { number: String },

    #[error("参数验证失败: {0}")]
    Validation(String),

    #[error("内部错误: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, LoyaltyError>;

impl LoyaltyError {
    /// 日志中使用的稳定错误码
    pub fn code(&self) -> &'static str {
        match self {
            Self::Database(_) => "DATABASE_ERROR",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::AlreadyExists { .. } => "ALREADY_EXISTS",
            Self::InsufficientFunds { .. } => "INSUFFICIENT_FUNDS",
            Self::InvalidOrderNumber { .. } => "INVALID_ORDER_NUMBER",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// 连接层面的瞬时故障，下一轮对账重试可能成功
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Database(
                sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::Protocol(_)
            )
        )
    }
}
