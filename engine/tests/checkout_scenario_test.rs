//! Checkout scenarios across baskets, discount codes and the payment gateway.

#![allow(clippy::expect_used, clippy::unwrap_used)] // Test code can use unwrap/expect

use chrono::TimeDelta;
use std::sync::Arc;
use stockpay_engine::error::{CodeRejection, DiscountError};
use stockpay_engine::{
    AdminConsole, AdminError, BasketError, CheckoutError, Config, Currency, DiscountCode,
    IntentError, IntentStatus, MockPaymentGateway, Money, PaymentGatewayError, Percentage,
    ProviderStatus, ResellerRates, SettlementError, SettlementEvent, StaticAccessPolicy,
    Storefront, Unit, UnitId, UnitStatus, UserId,
};
use stockpay_testing::ManualClock;
use tokio_test::{assert_err, assert_ok};

fn fast_retry_config() -> Config {
    let mut config = Config::default();
    config.gateway.max_retries = 2;
    config.gateway.initial_backoff_ms = 1;
    config.gateway.max_backoff_ms = 2;
    config
}

fn setup(gateway: Arc<MockPaymentGateway>) -> (Storefront, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::default());
    let shop = Storefront::new(&fast_retry_config(), gateway, clock.clone());
    shop.discounts.upsert_code(
        DiscountCode::percentage("SAVE20", Percentage::from_percent(20))
            .with_min_order(Money::from_major(50)),
    );
    (shop, clock)
}

fn stock(shop: &Storefront, product_type: &str, major: u64) -> UnitId {
    shop.inventory
        .stock(Unit::new("vilnius", product_type, Money::from_major(major)))
        .unwrap()
}

fn usdt() -> Currency {
    Currency::new("usdt")
}

#[tokio::test]
async fn test_save20_quote_and_intent_amount() {
    let (shop, _) = setup(Arc::new(MockPaymentGateway::new()));
    let user = UserId::new();
    let unit = stock(&shop, "flower", 100);
    let basket = shop.baskets.add_item(user, unit).unwrap();

    let quote = shop.baskets.apply_code(user, " save20 ").unwrap();
    assert_eq!(quote.subtotal, Money::from_major(100));
    assert_eq!(quote.code_discount, Money::from_major(20));
    assert_eq!(quote.total, Money::from_major(80));
    assert_eq!(shop.baskets.checkout_total(user).unwrap().total, Money::from_major(80));

    let intent = shop
        .intents
        .open_purchase_intent(user, basket.id, usdt())
        .await
        .unwrap();
    assert_eq!(intent.expected_amount, Money::from_major(80));
    assert_eq!(intent.status, IntentStatus::Pending);
    assert_eq!(shop.basket(user).unwrap().pending_intent, Some(intent.id));
}

#[tokio::test]
async fn test_code_below_minimum_order_is_refused() {
    let (shop, _) = setup(Arc::new(MockPaymentGateway::new()));
    let user = UserId::new();
    shop.baskets.add_item(user, stock(&shop, "flower", 40)).unwrap();

    let err = shop.baskets.apply_code(user, "SAVE20").unwrap_err();

    assert_eq!(
        err,
        BasketError::Discount(DiscountError::InvalidCode {
            code: "SAVE20".to_string(),
            reason: CodeRejection::BelowMinimumOrder {
                minimum: Money::from_major(50)
            },
        })
    );
    assert_eq!(shop.baskets.checkout_total(user).unwrap().total, Money::from_major(40));
}

#[tokio::test]
async fn test_reseller_rate_applies_before_code_minimum() {
    let (shop, _) = setup(Arc::new(MockPaymentGateway::new()));
    let user = UserId::new();
    shop.discounts
        .set_reseller(user, ResellerRates::new().with_rate("flower", Percentage::from_percent(10)));
    shop.baskets.add_item(user, stock(&shop, "flower", 100)).unwrap();

    let quote = shop.baskets.apply_code(user, "SAVE20").unwrap();

    // 100 - 10 reseller = 90, then 20% of 90
    assert_eq!(quote.reseller_discount, Money::from_major(10));
    assert_eq!(quote.code_discount, Money::from_major(18));
    assert_eq!(quote.total, Money::from_major(72));
}

#[tokio::test]
async fn test_stale_basket_id_is_rejected() {
    let (shop, _) = setup(Arc::new(MockPaymentGateway::new()));
    let user = UserId::new();
    shop.baskets.add_item(user, stock(&shop, "flower", 30)).unwrap();

    let err = shop
        .intents
        .open_purchase_intent(user, stockpay_engine::BasketId::new(), usdt())
        .await
        .unwrap_err();

    assert!(matches!(err, IntentError::StaleBasket { .. }));
}

#[tokio::test]
async fn test_rejected_invoice_releases_basket() {
    let gateway = Arc::new(MockPaymentGateway::new());
    let (shop, _) = setup(gateway.clone());
    let user = UserId::new();
    let unit = stock(&shop, "flower", 30);
    let basket = shop.baskets.add_item(user, unit).unwrap();
    gateway.fail_next(PaymentGatewayError::Rejected {
        reason: "blocked".to_string(),
    });

    let err = shop
        .intents
        .open_purchase_intent(user, basket.id, usdt())
        .await
        .unwrap_err();

    assert!(matches!(err, IntentError::Gateway(PaymentGatewayError::Rejected { .. })));
    assert_eq!(gateway.calls(), 1);
    assert!(shop.basket(user).is_none());
    assert_eq!(shop.inventory.get(unit).unwrap().status, UnitStatus::Available);
}

#[tokio::test]
async fn test_transient_failure_is_retried() {
    let gateway = Arc::new(MockPaymentGateway::new());
    let (shop, _) = setup(gateway.clone());
    let user = UserId::new();
    let basket = shop.baskets.add_item(user, stock(&shop, "flower", 30)).unwrap();
    gateway.fail_next(PaymentGatewayError::Timeout);

    let intent = shop.intents.open_purchase_intent(user, basket.id, usdt()).await;

    assert_ok!(&intent);
    assert_eq!(gateway.calls(), 2);
}

#[tokio::test]
async fn test_exhausted_retries_release_basket() {
    let gateway = Arc::new(MockPaymentGateway::new());
    let (shop, _) = setup(gateway.clone());
    let user = UserId::new();
    let unit = stock(&shop, "flower", 30);
    let basket = shop.baskets.add_item(user, unit).unwrap();
    for _ in 0..3 {
        gateway.fail_next(PaymentGatewayError::Unavailable {
            message: "502".to_string(),
        });
    }

    let err = shop
        .intents
        .open_purchase_intent(user, basket.id, usdt())
        .await
        .unwrap_err();

    assert!(matches!(err, IntentError::Gateway(PaymentGatewayError::Unavailable { .. })));
    assert_eq!(gateway.calls(), 3);
    assert_eq!(shop.inventory.get(unit).unwrap().status, UnitStatus::Available);
}

#[tokio::test]
async fn test_unsupported_currency_keeps_basket() {
    let gateway = Arc::new(MockPaymentGateway::new().with_currencies([Currency::new("btc")]));
    let (shop, _) = setup(gateway);
    let user = UserId::new();
    let unit = stock(&shop, "flower", 30);
    let basket = shop.baskets.add_item(user, unit).unwrap();

    let err = shop
        .intents
        .open_purchase_intent(user, basket.id, usdt())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        IntentError::Gateway(PaymentGatewayError::UnsupportedCurrency { .. })
    ));
    assert!(shop.basket(user).is_some());
    assert_eq!(shop.inventory.get(unit).unwrap().reserved_by(), Some(user));
}

#[tokio::test]
async fn test_gateway_minimum_maps_to_below_minimum() {
    let gateway =
        Arc::new(MockPaymentGateway::new().with_minimum(usdt(), Money::from_major(20)));
    let (shop, _) = setup(gateway);
    let user = UserId::new();
    let basket = shop.baskets.add_item(user, stock(&shop, "flower", 10)).unwrap();

    let err = shop
        .intents
        .open_purchase_intent(user, basket.id, usdt())
        .await
        .unwrap_err();

    assert_eq!(
        err,
        IntentError::BelowMinimum {
            amount: Money::from_major(10),
            minimum: Money::from_major(20),
        }
    );
    assert!(shop.basket(user).is_some());
}

#[tokio::test]
async fn test_refill_below_minimum_never_reaches_gateway() {
    let gateway = Arc::new(MockPaymentGateway::new());
    let (shop, _) = setup(gateway.clone());

    let result = shop
        .intents
        .open_refill_intent(UserId::new(), Money::from_cents(100), usdt())
        .await;

    assert_err!(&result);
    assert_eq!(gateway.calls(), 0);
}

#[tokio::test]
async fn test_new_intent_supersedes_previous() {
    let (shop, _) = setup(Arc::new(MockPaymentGateway::new()));
    let user = UserId::new();
    let unit = stock(&shop, "flower", 30);
    let basket = shop.baskets.add_item(user, unit).unwrap();

    let first = shop.intents.open_purchase_intent(user, basket.id, usdt()).await.unwrap();
    let second = shop.intents.open_purchase_intent(user, basket.id, usdt()).await.unwrap();

    assert_eq!(shop.intent_status(&first.id).await, Some(IntentStatus::Superseded));
    assert_eq!(shop.basket(user).unwrap().pending_intent, Some(second.id.clone()));

    let late = shop
        .settlement
        .apply(SettlementEvent {
            intent_id: first.id.clone(),
            received_amount: Money::from_major(30),
            currency: usdt(),
            reported_status: ProviderStatus::Finished,
            nonce: "a".to_string(),
        })
        .await;
    assert!(matches!(late, Err(SettlementError::ExpiredIntent { .. })));
    assert_eq!(shop.inventory.get(unit).unwrap().reserved_by(), Some(user));

    assert_ok!(
        shop.settlement
            .apply(SettlementEvent {
                intent_id: second.id.clone(),
                received_amount: Money::from_major(30),
                currency: usdt(),
                reported_status: ProviderStatus::Finished,
                nonce: "b".to_string(),
            })
            .await
    );
    assert_eq!(shop.inventory.get(unit).unwrap().status, UnitStatus::Sold);
}

#[tokio::test]
async fn test_reissued_intent_id_is_refused_and_keeps_holder() {
    let gateway = Arc::new(MockPaymentGateway::new());
    let (shop, _) = setup(gateway.clone());
    let user = UserId::new();
    let unit = stock(&shop, "flower", 30);
    let basket = shop.baskets.add_item(user, unit).unwrap();
    let first = shop.intents.open_purchase_intent(user, basket.id, usdt()).await.unwrap();

    gateway.issue_id_next(first.id.clone());
    let err = shop
        .intents
        .open_purchase_intent(user, basket.id, usdt())
        .await
        .unwrap_err();

    assert_eq!(err, IntentError::DuplicateIntent(first.id.clone()));
    assert_eq!(shop.intent(&first.id).await.unwrap(), first);
    assert_eq!(shop.basket(user).unwrap().pending_intent, Some(first.id.clone()));

    gateway.issue_id_next(first.id.clone());
    let refill = shop.intents.open_refill_intent(user, Money::from_major(10), usdt()).await;
    assert_eq!(refill.unwrap_err(), IntentError::DuplicateIntent(first.id.clone()));

    assert_ok!(
        shop.settlement
            .apply(SettlementEvent {
                intent_id: first.id.clone(),
                received_amount: Money::from_major(30),
                currency: usdt(),
                reported_status: ProviderStatus::Finished,
                nonce: "a".to_string(),
            })
            .await
    );
    assert_eq!(shop.inventory.get(unit).unwrap().status, UnitStatus::Sold);
    assert_eq!(shop.balance(user), Money::ZERO);
}

#[tokio::test]
async fn test_basket_is_frozen_while_payment_pending() {
    let (shop, _) = setup(Arc::new(MockPaymentGateway::new()));
    let user = UserId::new();
    let basket = shop.baskets.add_item(user, stock(&shop, "flower", 30)).unwrap();
    let intent = shop.intents.open_purchase_intent(user, basket.id, usdt()).await.unwrap();
    let other = stock(&shop, "extract", 15);

    let expected = BasketError::CheckoutPending { intent: intent.id };
    assert_eq!(shop.baskets.add_item(user, other).unwrap_err(), expected);
    assert_eq!(shop.baskets.clear(user).unwrap_err(), expected);
    assert_eq!(
        shop.checkout_with_balance(user).unwrap_err(),
        CheckoutError::Basket(expected)
    );
    assert_eq!(shop.inventory.get(other).unwrap().status, UnitStatus::Available);
}

#[tokio::test]
async fn test_expired_basket_reads_as_empty() {
    let (shop, clock) = setup(Arc::new(MockPaymentGateway::new()));
    let user = UserId::new();
    let unit = stock(&shop, "flower", 30);
    shop.baskets.add_item(user, unit).unwrap();

    clock.advance(TimeDelta::minutes(15));

    assert_eq!(
        shop.baskets.checkout_total(user).unwrap_err(),
        BasketError::EmptyBasket
    );
    assert!(shop.basket(user).is_none());
    assert_eq!(shop.inventory.get(unit).unwrap().status, UnitStatus::Available);
}

#[tokio::test]
async fn test_refill_then_spend_balance() {
    let (shop, _) = setup(Arc::new(MockPaymentGateway::new()));
    let user = UserId::new();
    let refill = shop
        .intents
        .open_refill_intent(user, Money::from_major(50), usdt())
        .await
        .unwrap();
    assert_ok!(
        shop.settlement
            .apply(SettlementEvent {
                intent_id: refill.id,
                received_amount: Money::from_major(55),
                currency: usdt(),
                reported_status: ProviderStatus::Finished,
                nonce: "r1".to_string(),
            })
            .await
    );
    let unit = stock(&shop, "flower", 40);
    shop.baskets.add_item(user, unit).unwrap();

    let receipt = shop.checkout_with_balance(user).unwrap();

    assert_eq!(receipt.total, Money::from_major(40));
    assert_eq!(receipt.balance, Money::from_major(15));
    assert_eq!(receipt.units, vec![unit]);
    assert_eq!(shop.inventory.get(unit).unwrap().status, UnitStatus::Sold);
}

#[test]
fn test_admin_capabilities_follow_policy() {
    let (shop, _) = setup(Arc::new(MockPaymentGateway::new()));
    let primary = UserId::new();
    let secondary = UserId::new();
    let console = AdminConsole::new(
        Arc::new(StaticAccessPolicy::new([primary], [secondary])),
        Arc::clone(&shop.inventory),
        Arc::clone(&shop.discounts),
    );

    let loaded = console
        .load_stock(primary, vec![Unit::new("vilnius", "flower", Money::from_major(12))])
        .unwrap();
    assert_eq!(loaded.len(), 1);
    assert_ok!(console.view_stock(secondary));

    let denied = console.load_stock(secondary, vec![Unit::new("vilnius", "flower", Money::from_major(12))]);
    assert!(matches!(denied, Err(AdminError::Forbidden { .. })));
    assert!(matches!(
        console.view_stock(UserId::new()),
        Err(AdminError::Forbidden { .. })
    ));
    assert_eq!(shop.available_count(), 1);
}
