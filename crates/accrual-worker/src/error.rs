//! 积分计算系统客户端错误类型
//!
//! 按响应状态码对失败进行结构化分类，worker 据此决定是写入退避闸门、
//! 仅记录日志，还是等待下一轮轮询。

use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;

#[derive(Debug, Error)]
pub enum AccrualError {
    /// 204：订单尚未在积分系统登记，本轮无事可做
    #[error("订单尚未在积分系统登记: {order_number}")]
    NotRegistered { order_number: String },

    /// 429：积分系统限流，resume_at 之前不得再发请求
    #[error("积分系统限流, {}s 后重试", retry_after.as_secs())]
    RateLimited {
        retry_after: Duration,
        resume_at: Instant,
    },

    /// 500
    #[error("积分系统内部错误")]
    Server,

    #[error("积分系统返回意外状态码: {0}")]
    UnexpectedStatus(u16),

    /// 网络层失败（连接、超时等）
    #[error("积分系统请求失败: {0}")]
    Transport(#[from] reqwest::Error),

    /// 200 响应体无法解析
    #[error("积分系统响应解析失败: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("无效的积分系统地址: {0}")]
    InvalidEndpoint(String),
}

/// 错误的处理分类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// 需要写入退避闸门
    RateLimited(Instant),
    /// 网络或服务端的暂时性故障，下一轮自然重试
    Transient,
    /// 本轮对该订单无法继续（未登记、响应异常等），跳过
    FatalToItem,
}

impl AccrualError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::RateLimited { resume_at, .. } => ErrorKind::RateLimited(*resume_at),
            Self::Transport(_) | Self::Server => ErrorKind::Transient,
            Self::NotRegistered { .. }
            | Self::UnexpectedStatus(_)
            | Self::Decode(_)
            | Self::InvalidEndpoint(_) => ErrorKind::FatalToItem,
        }
    }

    /// 指标标签
    pub fn outcome(&self) -> &'static str {
        match self {
            Self::NotRegistered { .. } => "not_registered",
            Self::RateLimited { .. } => "rate_limited",
            Self::Server => "server_error",
            Self::UnexpectedStatus(_) => "unexpected_status",
            Self::Transport(_) => "transport",
            Self::Decode(_) => "decode",
            Self::InvalidEndpoint(_) => "invalid_endpoint",
        }
    }
}
