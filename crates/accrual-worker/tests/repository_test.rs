//! PgOrderRepository 集成测试
//!
//! 需要真实 PostgreSQL，测试启动时执行 migrations/ 下的建表脚本。
//! 每个用例使用独立的用户和订单号，可重复运行。
//!
//! ## 运行方式
//!
//! ```bash
//! DATABASE_URL=postgres://... cargo test -p accrual-worker --test repository_test -- --ignored
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

use accrual_worker::models::{OrderStatus, User};
use accrual_worker::order_number::OrderNumber;
use accrual_worker::repository::{OrderRepository, PgOrderRepository};
use loyalty_shared::error::LoyaltyError;
use rust_decimal::Decimal;
use sqlx::PgPool;

// ==================== 辅助函数 ====================

fn database_url() -> String {
    std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for integration tests")
}

async fn setup() -> PgOrderRepository {
    let pool = PgPool::connect(&database_url())
        .await
        .expect("连接数据库失败");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("执行建表脚本失败");
    PgOrderRepository::new(pool)
}

static SEQ: AtomicU64 = AtomicU64::new(0);

/// 生成本次运行内唯一的种子
fn unique_seed() -> u64 {
    let nanos = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default() as u64;
    (nanos / 1000) * 100 + SEQ.fetch_add(1, Ordering::SeqCst) % 100
}

/// 在种子后追加 Luhn 校验位，生成合法订单号
fn order_number() -> OrderNumber {
    let payload = unique_seed().to_string();
    let sum: u32 = payload
        .bytes()
        .rev()
        .enumerate()
        .map(|(i, b)| {
            let d = u32::from(b - b'0');
            // 追加校验位后，payload 的最右位处于需要加倍的位置
            if i % 2 == 0 {
                let doubled = d * 2;
                if doubled > 9 { doubled - 9 } else { doubled }
            } else {
                d
            }
        })
        .sum();
    let check = (10 - sum % 10) % 10;
    OrderNumber::parse(&format!("{payload}{check}")).expect("生成的订单号应通过校验")
}

async fn create_user(repository: &PgOrderRepository) -> User {
    let login = format!("integ-{}", unique_seed());
    repository
        .create_user(&login, "hash")
        .await
        .expect("创建用户失败")
}

// ==================== 订单上传 ====================

#[tokio::test]
#[ignore = "需要数据库环境"]
async fn test_add_order_is_idempotent() {
    let repository = setup().await;
    let user = create_user(&repository).await;
    let other = create_user(&repository).await;
    let number = order_number();

    let (order, is_new) = repository.add_order(user.id, &number).await.unwrap();
    assert!(is_new);
    assert_eq!(order.status, OrderStatus::New);
    assert_eq!(order.user_id, user.id);

    // 他人重复上传返回原订单，归属不变
    let (order, is_new) = repository.add_order(other.id, &number).await.unwrap();
    assert!(!is_new);
    assert_eq!(order.user_id, user.id);
}

#[tokio::test]
#[ignore = "需要数据库环境"]
async fn test_duplicate_login_rejected() {
    let repository = setup().await;
    let user = create_user(&repository).await;

    let err = repository.create_user(&user.login, "hash").await.unwrap_err();
    assert!(matches!(err, LoyaltyError::AlreadyExists { .. }));
}

// ==================== 对账写回 ====================

#[tokio::test]
#[ignore = "需要数据库环境"]
async fn test_candidates_exclude_terminal_orders() {
    let repository = setup().await;
    let user = create_user(&repository).await;

    let new = order_number();
    let processing = order_number();
    let invalid = order_number();
    for number in [&new, &processing, &invalid] {
        repository.add_order(user.id, number).await.unwrap();
    }
    repository
        .update_order(processing.as_str(), OrderStatus::Processing, None)
        .await
        .unwrap();
    repository
        .update_order(invalid.as_str(), OrderStatus::Invalid, None)
        .await
        .unwrap();

    let candidates: Vec<String> = repository
        .get_orders_by_status(&OrderStatus::CANDIDATES)
        .await
        .unwrap()
        .into_iter()
        .filter(|o| o.user_id == user.id)
        .map(|o| o.number)
        .collect();

    assert_eq!(
        candidates,
        vec![new.to_string(), processing.to_string()]
    );
}

#[tokio::test]
#[ignore = "需要数据库环境"]
async fn test_processed_order_credits_balance_once() {
    let repository = setup().await;
    let user = create_user(&repository).await;
    let number = order_number();
    repository.add_order(user.id, &number).await.unwrap();

    repository
        .update_order(number.as_str(), OrderStatus::Processed, Some(Decimal::from(500)))
        .await
        .unwrap();

    let order = repository.get_order(number.as_str()).await.unwrap().unwrap();
    assert_eq!(order.status, OrderStatus::Processed);
    assert_eq!(order.accrual, Some(Decimal::from(500)));
    assert_eq!(
        repository.get_balance(user.id).await.unwrap().current,
        Decimal::from(500)
    );

    // 重复写回不会重复入账
    repository
        .update_order(number.as_str(), OrderStatus::Processed, Some(Decimal::from(500)))
        .await
        .unwrap();
    assert_eq!(
        repository.get_balance(user.id).await.unwrap().current,
        Decimal::from(500)
    );
}

#[tokio::test]
#[ignore = "需要数据库环境"]
async fn test_processing_update_keeps_balance() {
    let repository = setup().await;
    let user = create_user(&repository).await;
    let number = order_number();
    repository.add_order(user.id, &number).await.unwrap();

    repository
        .update_order(number.as_str(), OrderStatus::Processing, None)
        .await
        .unwrap();

    assert_eq!(
        repository.get_balance(user.id).await.unwrap().current,
        Decimal::ZERO
    );
}

#[tokio::test]
#[ignore = "需要数据库环境"]
async fn test_negative_accrual_rejected_without_debit() {
    let repository = setup().await;
    let user = create_user(&repository).await;
    let credited = order_number();
    let rejected = order_number();
    repository.add_order(user.id, &credited).await.unwrap();
    repository.add_order(user.id, &rejected).await.unwrap();

    repository
        .update_order(credited.as_str(), OrderStatus::Processed, Some(Decimal::from(100)))
        .await
        .unwrap();

    let err = repository
        .update_order(rejected.as_str(), OrderStatus::Processed, Some(Decimal::from(-40)))
        .await
        .unwrap_err();
    assert!(matches!(err, LoyaltyError::Validation(_)));

    assert_eq!(
        repository.get_balance(user.id).await.unwrap().current,
        Decimal::from(100)
    );
    let order = repository.get_order(rejected.as_str()).await.unwrap().unwrap();
    assert_eq!(order.status, OrderStatus::New);
    assert_eq!(order.accrual, None);
}

#[tokio::test]
#[ignore = "需要数据库环境"]
async fn test_update_unknown_order_not_found() {
    let repository = setup().await;
    let number = order_number();

    let err = repository
        .update_order(number.as_str(), OrderStatus::Processed, Some(Decimal::ONE))
        .await
        .unwrap_err();
    assert!(matches!(err, LoyaltyError::NotFound { .. }));
}

// ==================== 提现 ====================

#[tokio::test]
#[ignore = "需要数据库环境"]
async fn test_withdraw_moves_balance() {
    let repository = setup().await;
    let user = create_user(&repository).await;
    let number = order_number();
    repository.add_order(user.id, &number).await.unwrap();
    repository
        .update_order(number.as_str(), OrderStatus::Processed, Some(Decimal::from(100)))
        .await
        .unwrap();

    let target = order_number();
    repository
        .withdraw(user.id, &target, Decimal::from(40))
        .await
        .unwrap();

    let balance = repository.get_balance(user.id).await.unwrap();
    assert_eq!(balance.current, Decimal::from(60));
    assert_eq!(balance.withdrawn, Decimal::from(40));

    let withdrawals = repository.list_withdrawals(user.id).await.unwrap();
    assert_eq!(withdrawals.len(), 1);
    assert_eq!(withdrawals[0].order_number, target.as_str());
    assert_eq!(withdrawals[0].sum, Decimal::from(40));
}

#[tokio::test]
#[ignore = "需要数据库环境"]
async fn test_withdraw_insufficient_funds() {
    let repository = setup().await;
    let user = create_user(&repository).await;

    let err = repository
        .withdraw(user.id, &order_number(), Decimal::from(1))
        .await
        .unwrap_err();
    assert!(matches!(err, LoyaltyError::InsufficientFunds { .. }));

    let balance = repository.get_balance(user.id).await.unwrap();
    assert_eq!(balance.current, Decimal::ZERO);
    assert!(repository.list_withdrawals(user.id).await.unwrap().is_empty());
}

#[tokio::test]
#[ignore = "需要数据库环境"]
async fn test_list_user_orders_in_upload_order() {
    let repository = setup().await;
    let user = create_user(&repository).await;
    let first = order_number();
    let second = order_number();
    repository.add_order(user.id, &first).await.unwrap();
    repository.add_order(user.id, &second).await.unwrap();

    let numbers: Vec<String> = repository
        .list_user_orders(user.id)
        .await
        .unwrap()
        .into_iter()
        .map(|o| o.number)
        .collect();
    assert_eq!(numbers, vec![first.to_string(), second.to_string()]);
}
