//! 积分对账服务
//!
//! 周期性地把尚未结算的订单（NEW / PROCESSING）提交给外部积分计算系统查询，
//! 将判定结果写回订单，并在订单进入 PROCESSED 时原子地为用户入账。
//! 积分系统限流时所有 worker 共享同一个退避闸门。

pub mod backoff;
pub mod client;
pub mod distributor;
pub mod error;
pub mod models;
pub mod order_number;
pub mod pool;
pub mod reconciler;
pub mod repository;
pub mod shutdown;

pub use backoff::BackoffGate;
pub use client::{AccrualClient, AccrualService};
pub use error::{AccrualError, ErrorKind};
pub use pool::{CycleReport, WorkerPool};
pub use reconciler::{AccrualReconciler, CycleOutcome};
pub use repository::{OrderRepository, PgOrderRepository};
