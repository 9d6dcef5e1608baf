//! End-to-end walk through the engine with the mock gateway.
//!
//! Loads stock as an admin, buys a unit with a discount code through a
//! payment intent, replays the confirmation, tops up a balance, runs the
//! reaper briefly and prints the Prometheus scrape.

use anyhow::Context;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use stockpay_core::environment::SystemClock;
use stockpay_engine::{
    AdminConsole, Config, Currency, DiscountCode, MockPaymentGateway, Money, Percentage,
    ProviderStatus, SettlementEvent, StaticAccessPolicy, Storefront, Unit, UserId,
};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let config = Config::from_env();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("stockpay_engine={}", config.runtime.log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let prometheus = PrometheusBuilder::new()
        .install_recorder()
        .context("failed to install Prometheus recorder")?;
    stockpay_engine::metrics::register_business_metrics();

    let shop = Storefront::new(&config, MockPaymentGateway::shared(), Arc::new(SystemClock));
    let currency = Currency::new("usdt");

    // Admin setup
    let admin = UserId::new();
    let console = AdminConsole::new(
        Arc::new(StaticAccessPolicy::new([admin], [])),
        Arc::clone(&shop.inventory),
        Arc::clone(&shop.discounts),
    );
    let units = console.load_stock(
        admin,
        vec![
            Unit::new("berlin-mitte", "flower", Money::from_major(100)),
            Unit::new("berlin-mitte", "flower", Money::from_major(60)),
            Unit::new("hamburg", "extract", Money::from_major(40)),
        ],
    )?;
    console.upsert_code(
        admin,
        DiscountCode::percentage("SAVE20", Percentage::from_percent(20)).with_min_order(Money::from_major(50)),
    )?;
    info!(stock = ?console.view_stock(admin)?, "Stock loaded");

    // Purchase through a payment intent
    let buyer = UserId::new();
    let basket = shop.baskets.add_item(buyer, units[0])?;
    let quote = shop.baskets.apply_code(buyer, "save20")?;
    info!(subtotal = %quote.subtotal, total = %quote.total, "Basket quoted");
    info!(basket = %serde_json::to_string(&shop.basket(buyer))?, "Basket view");

    let intent = shop
        .intents
        .open_purchase_intent(buyer, basket.id, currency.clone())
        .await?;
    info!(intent = %intent.id, pay_to = %intent.pay_address, amount = %intent.expected_amount, "Awaiting payment");

    let confirmation = SettlementEvent {
        intent_id: intent.id.clone(),
        received_amount: intent.expected_amount,
        currency: currency.clone(),
        reported_status: ProviderStatus::Finished,
        nonce: "evt-1".to_string(),
    };
    let first = shop.settlement.apply(confirmation.clone()).await?;
    let replay = shop.settlement.apply(confirmation).await?;
    info!(?first, ?replay, status = ?shop.intent_status(&intent.id).await, "Purchase settled");
    info!(purchases = shop.purchases(buyer).len(), tier = ?shop.tier(buyer), "Buyer history");

    // Refill with overpayment
    let refill = shop
        .intents
        .open_refill_intent(buyer, Money::from_major(50), currency.clone())
        .await?;
    shop.settlement
        .apply(SettlementEvent {
            intent_id: refill.id.clone(),
            received_amount: Money::from_major(55),
            currency,
            reported_status: ProviderStatus::Finished,
            nonce: "evt-2".to_string(),
        })
        .await?;
    info!(
        balance = %shop.balance(buyer),
        ledger = %serde_json::to_string(&shop.ledger_entries(buyer))?,
        "Balance topped up"
    );

    // Spend the balance
    shop.baskets.add_item(buyer, units[2])?;
    let receipt = shop.checkout_with_balance(buyer)?;
    info!(total = %receipt.total, balance = %receipt.balance, "Paid from balance");

    // Reaper
    let reaper = shop.reaper().spawn(config.runtime.reaper_interval());
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    reaper.shutdown(config.runtime.shutdown_timeout()).await;

    info!(available = shop.available_count(), "Demo finished");
    println!("{}", prometheus.render());
    Ok(())
}
