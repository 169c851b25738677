//! Domain events for the Order fulfillment context.

use covenant_core::error::DomainError;
use covenant_core::event::DomainEvent;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Event type for an order being placed.
pub const ORDER_PLACED_EVENT_TYPE: &str = "order.placed";
/// Event type for stock being reserved.
pub const INVENTORY_RESERVED_EVENT_TYPE: &str = "order.inventory_reserved";
/// Event type for a reservation being released.
pub const INVENTORY_RELEASED_EVENT_TYPE: &str = "order.inventory_released";
/// Event type for the customer being charged.
pub const PAYMENT_CHARGED_EVENT_TYPE: &str = "order.payment_charged";
/// Event type for a charge being refunded.
pub const PAYMENT_REFUNDED_EVENT_TYPE: &str = "order.payment_refunded";
/// Event type for a shipment being scheduled.
pub const SHIPMENT_SCHEDULED_EVENT_TYPE: &str = "order.shipment_scheduled";
/// Event type for a scheduled shipment being cancelled.
pub const SHIPMENT_CANCELLED_EVENT_TYPE: &str = "order.shipment_cancelled";
/// Event type for an order being cancelled.
pub const ORDER_CANCELLED_EVENT_TYPE: &str = "order.cancelled";

/// Every event type an order produces.
pub const ORDER_EVENT_TYPES: [&str; 8] = [
    ORDER_PLACED_EVENT_TYPE,
    INVENTORY_RESERVED_EVENT_TYPE,
    INVENTORY_RELEASED_EVENT_TYPE,
    PAYMENT_CHARGED_EVENT_TYPE,
    PAYMENT_REFUNDED_EVENT_TYPE,
    SHIPMENT_SCHEDULED_EVENT_TYPE,
    SHIPMENT_CANCELLED_EVENT_TYPE,
    ORDER_CANCELLED_EVENT_TYPE,
];

/// One product line of an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderLine {
    /// Stock keeping unit.
    pub sku: String,
    /// Units ordered.
    pub quantity: u32,
    /// Price of one unit in cents.
    pub unit_price_cents: u64,
}

/// Emitted when an order is placed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderPlaced {
    /// The customer placing the order.
    pub customer_id: String,
    /// Ordered lines.
    pub lines: Vec<OrderLine>,
    /// Sum of all lines in cents.
    pub total_cents: u64,
}

/// Emitted when stock is reserved for the order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventoryReserved {
    /// The reservation identifier.
    pub reservation_id: Uuid,
}

/// Emitted when a reservation is given back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventoryReleased {
    /// The released reservation.
    pub reservation_id: Uuid,
}

/// Emitted when the customer is charged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentCharged {
    /// The payment identifier.
    pub payment_id: Uuid,
    /// Amount charged in cents.
    pub amount_cents: u64,
}

/// Emitted when a charge is refunded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentRefunded {
    /// The refunded payment.
    pub payment_id: Uuid,
    /// Amount refunded in cents.
    pub amount_cents: u64,
}

/// Emitted when a shipment is booked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShipmentScheduled {
    /// The shipment identifier.
    pub shipment_id: Uuid,
}

/// Emitted when a booked shipment is called off.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShipmentCancelled {
    /// The cancelled shipment.
    pub shipment_id: Uuid,
}

/// Emitted when the order is cancelled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderCancelled {
    /// Why the order was cancelled.
    pub reason: String,
}

/// Event union for the `Order` aggregate.
#[derive(Debug, Clone, PartialEq)]
pub enum OrderEvent {
    OrderPlaced(OrderPlaced),
    InventoryReserved(InventoryReserved),
    InventoryReleased(InventoryReleased),
    PaymentCharged(PaymentCharged),
    PaymentRefunded(PaymentRefunded),
    ShipmentScheduled(ShipmentScheduled),
    ShipmentCancelled(ShipmentCancelled),
    OrderCancelled(OrderCancelled),
}

impl DomainEvent for OrderEvent {
    fn event_type(&self) -> &'static str {
        match self {
            Self::OrderPlaced(_) => ORDER_PLACED_EVENT_TYPE,
            Self::InventoryReserved(_) => INVENTORY_RESERVED_EVENT_TYPE,
            Self::InventoryReleased(_) => INVENTORY_RELEASED_EVENT_TYPE,
            Self::PaymentCharged(_) => PAYMENT_CHARGED_EVENT_TYPE,
            Self::PaymentRefunded(_) => PAYMENT_REFUNDED_EVENT_TYPE,
            Self::ShipmentScheduled(_) => SHIPMENT_SCHEDULED_EVENT_TYPE,
            Self::ShipmentCancelled(_) => SHIPMENT_CANCELLED_EVENT_TYPE,
            Self::OrderCancelled(_) => ORDER_CANCELLED_EVENT_TYPE,
        }
    }

    fn to_payload(&self) -> Result<Value, DomainError> {
        Ok(match self {
            Self::OrderPlaced(p) => serde_json::to_value(p)?,
            Self::InventoryReserved(p) => serde_json::to_value(p)?,
            Self::InventoryReleased(p) => serde_json::to_value(p)?,
            Self::PaymentCharged(p) => serde_json::to_value(p)?,
            Self::PaymentRefunded(p) => serde_json::to_value(p)?,
            Self::ShipmentScheduled(p) => serde_json::to_value(p)?,
            Self::ShipmentCancelled(p) => serde_json::to_value(p)?,
            Self::OrderCancelled(p) => serde_json::to_value(p)?,
        })
    }
}
