//! 积分计算系统 HTTP 客户端
//!
//! 每次调用发起一次 `GET {base}/api/orders/{number}`，按状态码解释响应。
//! 客户端不触碰存储和退避状态，限流信息通过 `AccrualError::RateLimited` 交给 worker。

use std::time::Duration;

use async_trait::async_trait;
use loyalty_shared::config::AccrualConfig;
use loyalty_shared::observability::metrics;
use reqwest::header::{CONTENT_TYPE, HeaderMap, RETRY_AFTER};
use reqwest::{StatusCode, Url};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::AccrualError;
use crate::models::Judgement;

const ORDERS_PATH: &str = "api/orders";

/// 429 响应缺少或无法解析 Retry-After 时的等待时长
pub const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(60);

/// 积分系统访问接口
///
/// 抽象出 trait 便于在 worker 测试中注入 mock 实现
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AccrualService: Send + Sync {
    /// 查询订单的积分判定
    async fn fetch_judgement(&self, order_number: &str) -> Result<Judgement, AccrualError>;
}

/// 基于 reqwest 的积分系统客户端
///
/// reqwest::Client 内部带连接池，clone 是廉价操作。
#[derive(Clone)]
pub struct AccrualClient {
    http: reqwest::Client,
    base_url: String,
}

impl AccrualClient {
    pub fn new(config: &AccrualConfig) -> Result<Self, AccrualError> {
        let base_url = normalize_base_url(&config.base_url)?;

        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()?;

        info!(
            base_url = %base_url,
            timeout_ms = config.request_timeout_ms,
            "积分系统客户端已初始化"
        );

        Ok(Self { http, base_url })
    }

    /// 订单查询地址
    pub fn endpoint(&self, order_number: &str) -> String {
        format!("{}/{}/{}", self.base_url, ORDERS_PATH, order_number)
    }
}

#[async_trait]
impl AccrualService for AccrualClient {
    async fn fetch_judgement(&self, order_number: &str) -> Result<Judgement, AccrualError> {
        let start = std::time::Instant::now();

        let result: Result<Judgement, AccrualError> = async {
            let response = self
                .http
                .get(self.endpoint(order_number))
                .header(CONTENT_TYPE, "application/json")
                .send()
                .await?;

            interpret_response(order_number, response).await
        }
        .await;

        let outcome = match &result {
            Ok(_) => "ok",
            Err(e) => e.outcome(),
        };
        metrics::record_accrual_request(outcome, start.elapsed().as_secs_f64());
        debug!(order_number, outcome, "积分系统请求完成");

        result
    }
}

/// 按状态码解释响应
async fn interpret_response(
    order_number: &str,
    response: reqwest::Response,
) -> Result<Judgement, AccrualError> {
    match response.status() {
        StatusCode::OK => {
            let body = response.bytes().await?;
            Ok(serde_json::from_slice(&body)?)
        }
        StatusCode::NO_CONTENT => Err(AccrualError::NotRegistered {
            order_number: order_number.to_string(),
        }),
        StatusCode::TOO_MANY_REQUESTS => {
            let retry_after = retry_after(response.headers());
            Err(AccrualError::RateLimited {
                retry_after,
                resume_at: Instant::now() + retry_after,
            })
        }
        StatusCode::INTERNAL_SERVER_ERROR => Err(AccrualError::Server),
        other => Err(AccrualError::UnexpectedStatus(other.as_u16())),
    }
}

/// 读取 Retry-After（秒），缺失或非数字时回退到 60 秒
pub fn retry_after(headers: &HeaderMap) -> Duration {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_RETRY_AFTER)
}

/// 规范化积分系统地址：补全协议、去掉末尾斜杠
fn normalize_base_url(raw: &str) -> Result<String, AccrualError> {
    let trimmed = raw.trim();
    let (scheme, rest) = match trimmed.split_once("://") {
        Some((scheme, rest)) if scheme == "http" || scheme == "https" => (scheme, rest),
        Some(_) => return Err(AccrualError::InvalidEndpoint(trimmed.to_string())),
        None => ("http", trimmed),
    };

    let rest = rest.trim_end_matches('/');
    if rest.is_empty() || rest.starts_with('/') {
        return Err(AccrualError::InvalidEndpoint(trimmed.to_string()));
    }

    let base_url = format!("{scheme}://{rest}");
    let url = Url::parse(&base_url)
        .map_err(|e| AccrualError::InvalidEndpoint(format!("{trimmed}: {e}")))?;
    if url.host_str().is_none_or(str::is_empty) {
        return Err(AccrualError::InvalidEndpoint(trimmed.to_string()));
    }

    Ok(base_url)
}
