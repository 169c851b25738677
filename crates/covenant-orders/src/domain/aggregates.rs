//! Aggregate roots for the Order fulfillment context.

use covenant_core::aggregate::{AggregateRoot, EventRegistry};
use covenant_core::clock::Clock;
use covenant_core::error::DomainError;
use covenant_core::event::{EventContext, UncommittedEvent};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::events::{
    INVENTORY_RELEASED_EVENT_TYPE, INVENTORY_RESERVED_EVENT_TYPE, InventoryReleased,
    InventoryReserved, ORDER_CANCELLED_EVENT_TYPE, ORDER_PLACED_EVENT_TYPE, OrderCancelled,
    OrderEvent, OrderLine, OrderPlaced, PAYMENT_CHARGED_EVENT_TYPE, PAYMENT_REFUNDED_EVENT_TYPE,
    PaymentCharged, PaymentRefunded, SHIPMENT_CANCELLED_EVENT_TYPE, SHIPMENT_SCHEDULED_EVENT_TYPE,
    ShipmentCancelled, ShipmentScheduled,
};

/// Where an order is in its fulfillment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    /// Not placed yet.
    Draft,
    /// Placed, nothing reserved.
    Placed,
    /// Stock is reserved.
    Reserved,
    /// Stock is reserved and the customer is charged.
    Paid,
    /// A shipment is booked.
    Scheduled,
    /// The order was cancelled.
    Cancelled,
}

/// Snapshot-able state of an order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrderState {
    /// `true` once `OrderPlaced` has been applied.
    pub placed: bool,
    /// The customer who placed the order.
    pub customer_id: String,
    /// Ordered lines.
    pub lines: Vec<OrderLine>,
    /// Sum of all lines in cents.
    pub total_cents: u64,
    /// Active stock reservation.
    pub reservation_id: Option<Uuid>,
    /// Active payment.
    pub payment_id: Option<Uuid>,
    /// Active shipment.
    pub shipment_id: Option<Uuid>,
    /// Cancellation reason, once cancelled.
    pub cancellation_reason: Option<String>,
}

impl OrderState {
    /// Derives the order status from the active reservation, payment and
    /// shipment.
    #[must_use]
    pub fn status(&self) -> OrderStatus {
        if self.cancellation_reason.is_some() {
            OrderStatus::Cancelled
        } else if self.shipment_id.is_some() {
            OrderStatus::Scheduled
        } else if self.payment_id.is_some() {
            OrderStatus::Paid
        } else if self.reservation_id.is_some() {
            OrderStatus::Reserved
        } else if self.placed {
            OrderStatus::Placed
        } else {
            OrderStatus::Draft
        }
    }
}

/// The aggregate root for an order.
///
/// Compensating operations (`release_inventory`, `refund_payment`,
/// `cancel_shipment`) are no-ops when there is nothing to undo, so a saga
/// may repeat them safely.
#[derive(Debug)]
pub struct Order {
    id: String,
    version: u64,
    state: OrderState,
    uncommitted: Vec<UncommittedEvent>,
}

impl Order {
    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> &OrderState {
        &self.state
    }

    /// Places the order, producing an `OrderPlaced` event.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` if the order was already placed, the
    /// customer is blank, there are no lines, a line is malformed, or the
    /// total overflows.
    pub fn place(
        &mut self,
        customer_id: String,
        lines: Vec<OrderLine>,
        context: &EventContext,
        clock: &dyn Clock,
    ) -> Result<(), DomainError> {
        if self.state.placed {
            return Err(DomainError::Validation(format!(
                "order {} has already been placed",
                self.id
            )));
        }
        if customer_id.trim().is_empty() {
            return Err(DomainError::Validation("customer id must not be empty".into()));
        }
        if lines.is_empty() {
            return Err(DomainError::Validation(
                "an order needs at least one line".into(),
            ));
        }
        let mut total_cents: u64 = 0;
        for line in &lines {
            if line.sku.trim().is_empty() || line.quantity == 0 {
                return Err(DomainError::Validation(format!(
                    "order line `{}` needs a sku and a positive quantity",
                    line.sku
                )));
            }
            total_cents = line
                .unit_price_cents
                .checked_mul(u64::from(line.quantity))
                .and_then(|subtotal| total_cents.checked_add(subtotal))
                .ok_or_else(|| DomainError::Validation("order total overflows".into()))?;
        }
        self.raise(
            OrderEvent::OrderPlaced(OrderPlaced {
                customer_id,
                lines,
                total_cents,
            }),
            context,
            clock,
        )
    }

    /// Reserves stock. A second reservation is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` if the order is not open.
    pub fn reserve_inventory(
        &mut self,
        reservation_id: Uuid,
        context: &EventContext,
        clock: &dyn Clock,
    ) -> Result<(), DomainError> {
        self.ensure_open()?;
        if self.state.reservation_id.is_some() {
            return Ok(());
        }
        self.raise(
            OrderEvent::InventoryReserved(InventoryReserved { reservation_id }),
            context,
            clock,
        )
    }

    /// Releases the reservation, if any.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` while a shipment is scheduled.
    pub fn release_inventory(
        &mut self,
        context: &EventContext,
        clock: &dyn Clock,
    ) -> Result<(), DomainError> {
        let Some(reservation_id) = self.state.reservation_id else {
            return Ok(());
        };
        if self.state.shipment_id.is_some() {
            return Err(DomainError::Validation(format!(
                "order {} has a scheduled shipment; cancel it first",
                self.id
            )));
        }
        self.raise(
            OrderEvent::InventoryReleased(InventoryReleased { reservation_id }),
            context,
            clock,
        )
    }

    /// Charges the order total. A second charge is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` if the order is not open or no
    /// stock is reserved.
    pub fn charge_payment(
        &mut self,
        payment_id: Uuid,
        context: &EventContext,
        clock: &dyn Clock,
    ) -> Result<(), DomainError> {
        self.ensure_open()?;
        if self.state.payment_id.is_some() {
            return Ok(());
        }
        if self.state.reservation_id.is_none() {
            return Err(DomainError::Validation(format!(
                "order {} cannot be charged before inventory is reserved",
                self.id
            )));
        }
        let amount_cents = self.state.total_cents;
        self.raise(
            OrderEvent::PaymentCharged(PaymentCharged {
                payment_id,
                amount_cents,
            }),
            context,
            clock,
        )
    }

    /// Refunds the charge, if any.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` while a shipment is scheduled.
    pub fn refund_payment(
        &mut self,
        context: &EventContext,
        clock: &dyn Clock,
    ) -> Result<(), DomainError> {
        let Some(payment_id) = self.state.payment_id else {
            return Ok(());
        };
        if self.state.shipment_id.is_some() {
            return Err(DomainError::Validation(format!(
                "order {} has a scheduled shipment; cancel it first",
                self.id
            )));
        }
        let amount_cents = self.state.total_cents;
        self.raise(
            OrderEvent::PaymentRefunded(PaymentRefunded {
                payment_id,
                amount_cents,
            }),
            context,
            clock,
        )
    }

    /// Books a shipment. A second booking is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` if the order is not open or not
    /// paid.
    pub fn schedule_shipment(
        &mut self,
        shipment_id: Uuid,
        context: &EventContext,
        clock: &dyn Clock,
    ) -> Result<(), DomainError> {
        self.ensure_open()?;
        if self.state.shipment_id.is_some() {
            return Ok(());
        }
        if self.state.payment_id.is_none() {
            return Err(DomainError::Validation(format!(
                "order {} cannot ship before payment",
                self.id
            )));
        }
        self.raise(
            OrderEvent::ShipmentScheduled(ShipmentScheduled { shipment_id }),
            context,
            clock,
        )
    }

    /// Calls off the shipment, if any.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Serialization` if the event cannot be encoded.
    pub fn cancel_shipment(
        &mut self,
        context: &EventContext,
        clock: &dyn Clock,
    ) -> Result<(), DomainError> {
        let Some(shipment_id) = self.state.shipment_id else {
            return Ok(());
        };
        self.raise(
            OrderEvent::ShipmentCancelled(ShipmentCancelled { shipment_id }),
            context,
            clock,
        )
    }

    /// Cancels the order. Cancelling twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` if the order was never placed or a
    /// shipment is scheduled.
    pub fn cancel(
        &mut self,
        reason: String,
        context: &EventContext,
        clock: &dyn Clock,
    ) -> Result<(), DomainError> {
        if self.state.cancellation_reason.is_some() {
            return Ok(());
        }
        self.ensure_open()?;
        if self.state.shipment_id.is_some() {
            return Err(DomainError::Validation(format!(
                "order {} has a scheduled shipment and cannot be cancelled",
                self.id
            )));
        }
        self.raise(
            OrderEvent::OrderCancelled(OrderCancelled { reason }),
            context,
            clock,
        )
    }

    fn ensure_open(&self) -> Result<(), DomainError> {
        if !self.state.placed {
            return Err(DomainError::Validation(format!(
                "order {} has not been placed",
                self.id
            )));
        }
        if self.state.cancellation_reason.is_some() {
            return Err(DomainError::Validation(format!(
                "order {} is cancelled",
                self.id
            )));
        }
        Ok(())
    }
}

impl AggregateRoot for Order {
    type Event = OrderEvent;
    const AGGREGATE_TYPE: &'static str = "order";

    fn new(aggregate_id: &str) -> Self {
        Self {
            id: aggregate_id.to_owned(),
            version: 0,
            state: OrderState::default(),
            uncommitted: Vec::new(),
        }
    }

    fn aggregate_id(&self) -> &str {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn apply(&mut self, event: &OrderEvent) {
        let state = &mut self.state;
        match event {
            OrderEvent::OrderPlaced(e) => {
                state.placed = true;
                state.customer_id.clone_from(&e.customer_id);
                state.lines.clone_from(&e.lines);
                state.total_cents = e.total_cents;
            }
            OrderEvent::InventoryReserved(e) => state.reservation_id = Some(e.reservation_id),
            OrderEvent::InventoryReleased(_) => state.reservation_id = None,
            OrderEvent::PaymentCharged(e) => state.payment_id = Some(e.payment_id),
            OrderEvent::PaymentRefunded(_) => state.payment_id = None,
            OrderEvent::ShipmentScheduled(e) => state.shipment_id = Some(e.shipment_id),
            OrderEvent::ShipmentCancelled(_) => state.shipment_id = None,
            OrderEvent::OrderCancelled(e) => state.cancellation_reason = Some(e.reason.clone()),
        }
        self.version += 1;
    }

    fn uncommitted_events(&self) -> &[UncommittedEvent] {
        &self.uncommitted
    }

    fn push_uncommitted(&mut self, event: UncommittedEvent) {
        self.uncommitted.push(event);
    }

    fn clear_uncommitted_events(&mut self) {
        self.uncommitted.clear();
    }

    fn register_events(registry: &mut EventRegistry<OrderEvent>) -> Result<(), DomainError> {
        registry
            .register(ORDER_PLACED_EVENT_TYPE, OrderEvent::OrderPlaced)?
            .register(INVENTORY_RESERVED_EVENT_TYPE, OrderEvent::InventoryReserved)?
            .register(INVENTORY_RELEASED_EVENT_TYPE, OrderEvent::InventoryReleased)?
            .register(PAYMENT_CHARGED_EVENT_TYPE, OrderEvent::PaymentCharged)?
            .register(PAYMENT_REFUNDED_EVENT_TYPE, OrderEvent::PaymentRefunded)?
            .register(SHIPMENT_SCHEDULED_EVENT_TYPE, OrderEvent::ShipmentScheduled)?
            .register(SHIPMENT_CANCELLED_EVENT_TYPE, OrderEvent::ShipmentCancelled)?
            .register(ORDER_CANCELLED_EVENT_TYPE, OrderEvent::OrderCancelled)?;
        Ok(())
    }

    fn snapshot_state(&self) -> Result<Value, DomainError> {
        Ok(serde_json::to_value(&self.state)?)
    }

    fn restore(aggregate_id: &str, version: u64, state: &Value) -> Result<Self, DomainError> {
        let mut order = Self::new(aggregate_id);
        order.version = version;
        order.state = serde_json::from_value(state.clone())?;
        Ok(order)
    }
}
