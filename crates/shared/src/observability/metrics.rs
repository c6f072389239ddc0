//! 对账指标
//!
//! 记录函数在未安装 recorder 时为空操作，单元测试里可以直接调用。
//! 启用后由独立端口的 `/metrics` 暴露给 Prometheus 抓取。

use std::net::SocketAddr;

use anyhow::Result;
use axum::{Router, routing::get};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info};

use super::ObservabilityConfig;

pub const ACCRUAL_REQUESTS: &str = "accrual_requests_total";
pub const ACCRUAL_REQUEST_DURATION: &str = "accrual_request_duration_seconds";
pub const ACCRUAL_RATE_LIMITED: &str = "accrual_rate_limited_total";
pub const ACCRUAL_BACKOFF_SECONDS: &str = "accrual_backoff_seconds";
pub const ORDERS_UPDATED: &str = "accrual_orders_updated_total";
pub const RECONCILIATION_CYCLES: &str = "reconciliation_cycles_total";

/// 积分系统请求耗时分桶（秒），覆盖默认 1s 超时前后
const REQUEST_DURATION_BUCKETS: &[f64] =
    &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0];

/// 指标服务守卫，drop 时通知 HTTP 服务停止监听
pub struct MetricsHandle {
    stop: Option<oneshot::Sender<()>>,
    server: JoinHandle<()>,
}

impl MetricsHandle {
    pub fn is_running(&self) -> bool {
        !self.server.is_finished()
    }
}

impl Drop for MetricsHandle {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

/// 安装 Prometheus recorder 并启动指标端口
pub async fn init(config: &ObservabilityConfig) -> Result<MetricsHandle> {
    let handle = PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full(ACCRUAL_REQUEST_DURATION.to_string()),
            REQUEST_DURATION_BUCKETS,
        )?
        .install_recorder()?;

    describe();
    metrics::counter!("service_starts_total", "service" => config.service_name.clone())
        .increment(1);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.metrics_port));
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "Metrics server listening");

    let (stop, stopped) = oneshot::channel();
    let server = tokio::spawn(serve(listener, handle, stopped));
    Ok(MetricsHandle {
        stop: Some(stop),
        server,
    })
}

fn describe() {
    metrics::describe_counter!(ACCRUAL_REQUESTS, "积分系统请求次数，按结果分类");
    metrics::describe_histogram!(
        ACCRUAL_REQUEST_DURATION,
        metrics::Unit::Seconds,
        "积分系统请求耗时"
    );
    metrics::describe_counter!(ACCRUAL_RATE_LIMITED, "收到的 429 响应次数");
    metrics::describe_gauge!(
        ACCRUAL_BACKOFF_SECONDS,
        metrics::Unit::Seconds,
        "最近一次 429 要求的等待时长"
    );
    metrics::describe_counter!(ORDERS_UPDATED, "写回的订单状态数，按状态分类");
    metrics::describe_counter!(RECONCILIATION_CYCLES, "对账周期次数，按结果分类");
}

async fn serve(listener: TcpListener, handle: PrometheusHandle, stopped: oneshot::Receiver<()>) {
    let app = Router::new()
        .route("/metrics", get(move || std::future::ready(handle.render())))
        .route("/health", get(|| async { "OK" }));

    let shutdown = async {
        let _ = stopped.await;
    };
    if let Err(e) = axum::serve(listener, app).with_graceful_shutdown(shutdown).await {
        error!(error = %e, "指标服务异常退出");
    }
}

// ---- 记录函数 ----

/// 记录一次积分系统请求
///
/// outcome 取值：ok / not_registered / rate_limited / server_error / unexpected_status / transport / decode
pub fn record_accrual_request(outcome: &str, duration_secs: f64) {
    metrics::counter!(ACCRUAL_REQUESTS, "outcome" => outcome.to_string()).increment(1);
    metrics::histogram!(ACCRUAL_REQUEST_DURATION).record(duration_secs);
}

pub fn record_rate_limited(retry_after_secs: u64) {
    metrics::counter!(ACCRUAL_RATE_LIMITED).increment(1);
    metrics::gauge!(ACCRUAL_BACKOFF_SECONDS).set(retry_after_secs as f64);
}

pub fn record_order_updated(status: &str) {
    metrics::counter!(ORDERS_UPDATED, "status" => status.to_string()).increment(1);
}

/// result 取值：completed / skipped_backoff / storage_error / cancelled
pub fn record_cycle(result: &str) {
    metrics::counter!(RECONCILIATION_CYCLES, "result" => result.to_string()).increment(1);
}
