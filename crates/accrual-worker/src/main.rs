//! 积分对账服务入口
//!
//! 加载配置后启动对账循环，收到 Ctrl+C / SIGTERM 时通知所有 worker 退出。

use std::sync::Arc;
use std::time::Duration;

use accrual_worker::{AccrualClient, AccrualReconciler, PgOrderRepository};
use clap::Parser;
use loyalty_shared::config::AppConfig;
use loyalty_shared::database::Database;
use loyalty_shared::observability;
use tokio::sync::watch;
use tracing::{info, warn};

const SERVICE_NAME: &str = "accrual-worker";

/// 等待对账循环退出的最长时间
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// 命令行参数，优先级高于配置文件和环境变量
#[derive(Parser, Debug)]
#[command(name = "accrual-worker")]
#[command(version, about = "订单积分对账服务")]
struct Args {
    /// 积分计算系统地址
    #[arg(short = 'r', long)]
    accrual_address: Option<String>,

    /// 积分系统请求超时（毫秒）
    #[arg(short = 't', long)]
    request_timeout_ms: Option<u64>,

    /// 对账周期（秒）
    #[arg(short = 'p', long)]
    poll_interval_secs: Option<u64>,

    /// 并发 worker 数
    #[arg(short = 'w', long)]
    workers: Option<usize>,

    /// 数据库连接串
    #[arg(short = 'd', long)]
    database_url: Option<String>,

    /// 日志级别 (trace, debug, info, warn, error)
    #[arg(short = 'l', long)]
    log_level: Option<String>,
}

impl Args {
    fn apply(self, config: &mut AppConfig) {
        if let Some(address) = self.accrual_address {
            config.accrual.base_url = address;
        }
        if let Some(timeout) = self.request_timeout_ms {
            config.accrual.request_timeout_ms = timeout;
        }
        if let Some(interval) = self.poll_interval_secs {
            config.reconciliation.poll_interval_secs = interval;
        }
        if let Some(workers) = self.workers {
            config.reconciliation.workers = workers;
        }
        if let Some(url) = self.database_url {
            config.database.url = url;
        }
        if let Some(level) = self.log_level {
            config.observability.log_level = level;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = AppConfig::load(SERVICE_NAME)?;
    args.apply(&mut config);
    config.validate()?;

    let obs_config = config.observability.clone().with_service_name(&config.service_name);
    let _guard = observability::init(&obs_config).await?;

    info!(
        accrual = %config.accrual.base_url,
        workers = config.reconciliation.workers,
        poll_interval_secs = config.reconciliation.poll_interval_secs,
        "Starting {}...",
        SERVICE_NAME
    );

    let db = Database::connect(&config.database).await?;
    let latency = db.health_check().await?;
    info!(latency_ms = latency.as_millis() as u64, "数据库连通性检查通过");

    let client = AccrualClient::new(&config.accrual)?;
    let repository = PgOrderRepository::new(db.pool().clone());

    let reconciler = AccrualReconciler::new(
        Arc::new(client),
        Arc::new(repository),
        &config.reconciliation,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut handle = tokio::spawn(reconciler.run(shutdown_rx));

    tokio::select! {
        _ = shutdown_signal() => {
            let _ = shutdown_tx.send(true);
            match tokio::time::timeout(SHUTDOWN_GRACE, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "对账循环异常退出"),
                Err(_) => {
                    warn!(
                        grace_secs = SHUTDOWN_GRACE.as_secs(),
                        "对账循环未在宽限期内退出，强制终止"
                    );
                    handle.abort();
                }
            }
        }
        result = &mut handle => {
            if let Err(e) = result {
                warn!(error = %e, "对账循环异常退出");
            }
        }
    }

    db.close().await;
    info!("{} shutdown complete", SERVICE_NAME);

    Ok(())
}

/// 监听关闭信号
///
/// K8s 通过 SIGTERM 通知 Pod 停止；本地开发通过 Ctrl+C。
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "注册 Ctrl+C 处理器失败");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "注册 SIGTERM 处理器失败");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, initiating graceful shutdown..."),
        _ = terminate => info!("Received SIGTERM, initiating graceful shutdown..."),
    }
}
