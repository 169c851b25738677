//! The order fulfillment saga.
//!
//! Reserve stock, charge the customer, book the shipment. A failure at any
//! step undoes the earlier ones in reverse.

use std::time::Duration;

use chrono::{DateTime, Utc};
use covenant_core::command::Command;
use covenant_saga::{RetryPolicy, SagaStep, SagaTransaction};
use serde_json::{Value, json};

use crate::domain::commands::{
    CANCEL_SHIPMENT, CHARGE_PAYMENT, REFUND_PAYMENT, RELEASE_INVENTORY, RESERVE_INVENTORY,
    SCHEDULE_SHIPMENT,
};

/// Saga type recorded on every fulfillment saga.
pub const ORDER_FULFILLMENT_SAGA: &str = "order_fulfillment";

/// Step ids, in execution order.
pub const RESERVE_INVENTORY_STEP: &str = "reserve_inventory";
pub const CHARGE_PAYMENT_STEP: &str = "charge_payment";
pub const SCHEDULE_SHIPMENT_STEP: &str = "schedule_shipment";

/// Tunables for the fulfillment saga.
#[derive(Debug, Clone)]
pub struct FulfillmentOptions {
    /// Deadline of every step attempt.
    pub step_timeout: Duration,
    /// Retry policy of the payment step. Other steps are not retried.
    pub payment_retry: RetryPolicy,
}

impl Default for FulfillmentOptions {
    fn default() -> Self {
        Self {
            step_timeout: Duration::from_secs(30),
            payment_retry: RetryPolicy::exponential(3, Duration::from_millis(200)),
        }
    }
}

fn order_command(command_type: &str, order_id: &str) -> Command {
    Command::new(command_type, order_id, Value::Object(serde_json::Map::new()))
}

/// Builds a fulfillment saga for `order_id`.
#[must_use]
pub fn fulfillment_saga(
    order_id: &str,
    options: &FulfillmentOptions,
    now: DateTime<Utc>,
) -> SagaTransaction {
    let steps = vec![
        SagaStep::new(
            RESERVE_INVENTORY_STEP,
            order_command(RESERVE_INVENTORY, order_id),
            order_command(RELEASE_INVENTORY, order_id),
        )
        .with_timeout(options.step_timeout),
        SagaStep::new(
            CHARGE_PAYMENT_STEP,
            order_command(CHARGE_PAYMENT, order_id),
            order_command(REFUND_PAYMENT, order_id),
        )
        .with_timeout(options.step_timeout)
        .with_retry_policy(options.payment_retry.clone()),
        SagaStep::new(
            SCHEDULE_SHIPMENT_STEP,
            order_command(SCHEDULE_SHIPMENT, order_id),
            order_command(CANCEL_SHIPMENT, order_id),
        )
        .with_timeout(options.step_timeout),
    ];
    SagaTransaction::new(ORDER_FULFILLMENT_SAGA, steps, now).with_context("order_id", json!(order_id))
}
