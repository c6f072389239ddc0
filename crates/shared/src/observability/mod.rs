//! 日志与指标的统一入口
//!
//! 进程启动时调用一次 [`init`]，持有返回的 [`ObservabilityGuard`] 直到退出。

pub mod metrics;
pub mod tracing;

use ::tracing::info;
use anyhow::Result;

pub use crate::config::ObservabilityConfig;

/// 持有指标服务，drop 时停止 `/metrics` 端口
pub struct ObservabilityGuard {
    metrics: Option<metrics::MetricsHandle>,
}

impl ObservabilityGuard {
    /// 不带指标服务的守卫，`metrics_enabled = false` 时返回
    pub fn logging_only() -> Self {
        Self { metrics: None }
    }

    pub fn metrics_running(&self) -> bool {
        self.metrics.as_ref().is_some_and(|m| m.is_running())
    }
}

impl Drop for ObservabilityGuard {
    fn drop(&mut self) {
        if self.metrics.take().is_some() {
            info!("Metrics server stopped");
        }
    }
}

/// 先装日志再装指标，指标端口绑定失败时日志已可用
///
/// ```ignore
/// let config = ObservabilityConfig::default().with_service_name("accrual-worker");
/// let _guard = loyalty_shared::observability::init(&config).await?;
/// ```
pub async fn init(config: &ObservabilityConfig) -> Result<ObservabilityGuard> {
    tracing::init(config)?;

    if !config.metrics_enabled {
        info!(service = %config.service_name, "Observability initialized (metrics disabled)");
        return Ok(ObservabilityGuard::logging_only());
    }

    let handle = metrics::init(config).await?;
    info!(
        service = %config.service_name,
        metrics_port = config.metrics_port,
        "Observability initialized"
    );
    Ok(ObservabilityGuard {
        metrics: Some(handle),
    })
}
