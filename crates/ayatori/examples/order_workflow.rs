//! Order fulfilment workflow.
//!
//! Demonstrates:
//! - Parallel branches joined by a step with two prerequisites
//! - A `Step` implementation with rollback
//! - Closure-defined steps with a retry policy
//! - Rolling back reserved stock when shipping fails
//!
//! Run with `RUST_LOG=info cargo run --example order_workflow`.

use async_trait::async_trait;
use ayatori::prelude::*;
use ayatori::FnStep;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

#[derive(Debug, Deserialize)]
struct Order {
    id: String,
    items: Vec<Item>,
    country: String,
}

#[derive(Debug, Deserialize)]
struct Item {
    sku: String,
    quantity: u32,
    price: f64,
}

fn order(ctx: &Context) -> Result<Order, StepError> {
    let raw = ctx.arg(0).ok_or("order argument missing")?;
    serde_json::from_value(raw).map_err(|e| StepError::new(format!("invalid order: {}", e)))
}

/// Reserves stock for every item and releases it again on rollback.
#[derive(Debug)]
struct ReserveStock;

#[async_trait]
impl Step for ReserveStock {
    fn name(&self) -> StepName {
        StepName::new("reserve_stock")
    }

    async fn execute(&self, ctx: &Context) -> Result<Value, StepError> {
        let order = order(ctx)?;
        let skus: Vec<&str> = order.items.iter().map(|i| i.sku.as_str()).collect();
        println!("Reserving {:?} for order {}", skus, order.id);
        Ok(json!({ "reservation": format!("res-{}", order.id), "skus": skus }))
    }

    async fn rollback(&self, ctx: &Context, error: &ProcessError) -> Result<(), StepError> {
        let reservation = ctx.result("reserve_stock").unwrap_or_default();
        println!(
            "Releasing reservation {} after: {}",
            reservation["reservation"],
            error.message()
        );
        Ok(())
    }
}

fn validate() -> Result<FnStep, ProcessError> {
    step("validate", |ctx, _props| async move {
        let order = order(&ctx)?;
        if order.items.is_empty() {
            return Err(StepError::new("order has no items").with_severity(Severity::Fatal));
        }
        let total: f64 = order
            .items
            .iter()
            .map(|i| i.price * f64::from(i.quantity))
            .sum();
        Ok(json!({ "total": total }))
    })
    .build()
}

fn charge_payment() -> Result<FnStep, ProcessError> {
    // The gateway rejects the first call.
    step("charge_payment", |ctx, props| async move {
        let attempt = props.increment("attempt");
        if attempt == 1 {
            return Err(StepError::new("payment gateway unavailable").with("attempt", json!(attempt)));
        }
        let total = ctx
            .result("validate")
            .and_then(|v| v["total"].as_f64())
            .unwrap_or_default();
        println!("Charged {:.2} on attempt {}", total, attempt);
        Ok(json!({ "transaction": "tx-7781", "amount": total }))
    })
    .retry_policy(RetryPolicy::exponential(3, Duration::from_millis(50)))
    .build()
}

fn ship() -> Result<FnStep, ProcessError> {
    step("ship", |ctx, _props| async move {
        let order = order(&ctx)?;
        if order.country != "JP" {
            return Err(StepError::new(format!("cannot ship to {}", order.country))
                .with("order", json!(order.id)));
        }
        Ok(json!({ "tracking": format!("JP-{}", order.id) }))
    })
    .success(|_ctx, _props| async {
        println!("Shipment confirmed");
        Ok(())
    })
    .failure(|_ctx, _props, error| async move {
        println!("Shipping not possible: {}", error);
        Ok(())
    })
    .build()
}

fn fulfilment() -> Result<Workflow, ProcessError> {
    Workflow::builder("order_fulfilment")
        .step(validate()?)
        .step(ReserveStock)
        .step(charge_payment()?)
        .step(ship()?)
        .depends_on("reserve_stock", ["validate"])
        .depends_on("charge_payment", ["validate"])
        .depends_on("ship", ["reserve_stock", "charge_payment"])
        .build()
}

#[tokio::main]
async fn main() -> Result<(), ProcessError> {
    tracing_subscriber::fmt::init();

    let workflow = fulfilment()?;
    let dispatch = workflow.dispatcher();

    println!("=== Domestic order ===");
    let domestic = json!({
        "id": "A-100",
        "country": "JP",
        "items": [
            { "sku": "tea", "quantity": 2, "price": 12.5 },
            { "sku": "cup", "quantity": 1, "price": 30.0 }
        ]
    });
    let results = dispatch(vec![domestic]).await?;
    println!("Results: {}", serde_json::to_string_pretty(&results).unwrap_or_default());

    println!("\n=== Overseas order ===");
    let overseas = json!({
        "id": "B-200",
        "country": "FR",
        "items": [{ "sku": "tea", "quantity": 1, "price": 12.5 }]
    });
    match dispatch(vec![overseas]).await {
        Ok(results) => println!("Unexpected success: {:?}", results),
        Err(e) => {
            println!("Failed in {:?}: {}", e.step(), e.message());
            println!("Completed before failure: {:?}", e.completed());
        }
    }

    Ok(())
}
