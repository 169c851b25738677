//! Commands for the Order fulfillment context.
//!
//! Commands travel through the command bus as `covenant_core::command::Command`
//! values; the structs here are their typed payloads.

use serde::{Deserialize, Serialize};

use super::events::OrderLine;

/// Places a new order.
pub const PLACE_ORDER: &str = "order.place";
/// Reserves stock for every line.
pub const RESERVE_INVENTORY: &str = "order.reserve_inventory";
/// Gives the reservation back.
pub const RELEASE_INVENTORY: &str = "order.release_inventory";
/// Charges the order total.
pub const CHARGE_PAYMENT: &str = "order.charge_payment";
/// Refunds the charge.
pub const REFUND_PAYMENT: &str = "order.refund_payment";
/// Books a shipment.
pub const SCHEDULE_SHIPMENT: &str = "order.schedule_shipment";
/// Calls off the shipment.
pub const CANCEL_SHIPMENT: &str = "order.cancel_shipment";
/// Cancels the order.
pub const CANCEL_ORDER: &str = "order.cancel";

/// Payload of [`PLACE_ORDER`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaceOrder {
    /// The customer placing the order.
    pub customer_id: String,
    /// Ordered lines.
    pub lines: Vec<OrderLine>,
}

/// Payload of [`CANCEL_ORDER`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelOrder {
    /// Why the order is cancelled.
    pub reason: String,
}
