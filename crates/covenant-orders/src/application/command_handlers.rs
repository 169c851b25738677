//! Command handlers for the Order fulfillment context.
//!
//! Each handler loads the order through the repository, runs one domain
//! method and saves the resulting events. Handlers are registered on the
//! command bus by [`register_command_handlers`].

use std::future::Future;
use std::sync::Arc;

use covenant_core::aggregate::AggregateRoot;
use covenant_core::clock::Clock;
use covenant_core::command::Command;
use covenant_core::error::DomainError;
use covenant_core::event::EventContext;
use covenant_core::repository::AggregateRepository;
use covenant_cqrs::{CommandBus, CommandHandler, command_handler_fn};
use serde_json::{Value, json};
use tracing::info;

use crate::domain::aggregates::Order;
use crate::domain::commands::{
    CANCEL_ORDER, CANCEL_SHIPMENT, CHARGE_PAYMENT, CancelOrder, PLACE_ORDER, PlaceOrder,
    REFUND_PAYMENT, RELEASE_INVENTORY, RESERVE_INVENTORY, SCHEDULE_SHIPMENT,
};

/// Repository type shared by every order handler.
pub type OrderRepository = AggregateRepository<Order>;

/// Summary returned as the result of every order command.
fn outcome(order: &Order, appended: usize) -> Value {
    json!({
        "order_id": order.aggregate_id(),
        "version": order.version(),
        "status": order.state().status(),
        "events_appended": appended,
    })
}

fn check_expected_version(command: &Command, order: &Order) -> Result<(), DomainError> {
    match command.expected_version {
        Some(expected) if expected != order.version() => Err(DomainError::ConcurrencyConflict {
            aggregate_id: order.aggregate_id().to_owned(),
            expected,
            actual: order.version(),
        }),
        _ => Ok(()),
    }
}

/// Loads the target order, applies `operation` and saves.
async fn execute_on_order<F>(
    command: &Command,
    repository: &OrderRepository,
    clock: &dyn Clock,
    operation: F,
) -> Result<Value, DomainError>
where
    F: FnOnce(&mut Order, &EventContext, &dyn Clock) -> Result<(), DomainError>,
{
    let mut order = repository.get_by_id(&command.target_id).await?;
    check_expected_version(command, &order)?;
    operation(&mut order, &command.event_context(), clock)?;
    let stored = repository.save(&mut order).await?;
    Ok(outcome(&order, stored.len()))
}

/// Handles [`PLACE_ORDER`]: creates the order stream.
///
/// # Errors
///
/// Returns `DomainError::CommandValidation` for a malformed payload,
/// `DomainError::Validation` if the order exists or fails domain checks, and
/// `DomainError::ConcurrencyConflict` if another placement won the race.
pub async fn handle_place_order(
    command: &Command,
    repository: &OrderRepository,
    clock: &dyn Clock,
) -> Result<Value, DomainError> {
    let payload: PlaceOrder = command.payload_as()?;
    if repository.exists(&command.target_id).await? {
        return Err(DomainError::Validation(format!(
            "order {} already exists",
            command.target_id
        )));
    }
    let mut order = Order::new(&command.target_id);
    order.place(payload.customer_id, payload.lines, &command.event_context(), clock)?;
    let stored = repository.save(&mut order).await?;
    info!(
        order_id = %command.target_id,
        total_cents = order.state().total_cents,
        "order placed"
    );
    Ok(outcome(&order, stored.len()))
}

/// Handles [`RESERVE_INVENTORY`]. The command id becomes the reservation id.
///
/// # Errors
///
/// Returns `DomainError` if the order is missing, not open, or the save fails.
pub async fn handle_reserve_inventory(
    command: &Command,
    repository: &OrderRepository,
    clock: &dyn Clock,
) -> Result<Value, DomainError> {
    let reservation_id = command.id;
    execute_on_order(command, repository, clock, |order, ctx, clock| {
        order.reserve_inventory(reservation_id, ctx, clock)
    })
    .await
}

/// Handles [`RELEASE_INVENTORY`].
///
/// # Errors
///
/// Returns `DomainError` if the order is missing, has shipped, or the save
/// fails.
pub async fn handle_release_inventory(
    command: &Command,
    repository: &OrderRepository,
    clock: &dyn Clock,
) -> Result<Value, DomainError> {
    execute_on_order(command, repository, clock, Order::release_inventory).await
}

/// Handles [`CHARGE_PAYMENT`]. The command id becomes the payment id.
///
/// # Errors
///
/// Returns `DomainError` if the order is missing, unreserved, or the save
/// fails.
pub async fn handle_charge_payment(
    command: &Command,
    repository: &OrderRepository,
    clock: &dyn Clock,
) -> Result<Value, DomainError> {
    let payment_id = command.id;
    execute_on_order(command, repository, clock, |order, ctx, clock| {
        order.charge_payment(payment_id, ctx, clock)
    })
    .await
}

/// Handles [`REFUND_PAYMENT`].
///
/// # Errors
///
/// Returns `DomainError` if the order is missing, has shipped, or the save
/// fails.
pub async fn handle_refund_payment(
    command: &Command,
    repository: &OrderRepository,
    clock: &dyn Clock,
) -> Result<Value, DomainError> {
    execute_on_order(command, repository, clock, Order::refund_payment).await
}

/// Handles [`SCHEDULE_SHIPMENT`]. The command id becomes the shipment id.
///
/// # Errors
///
/// Returns `DomainError` if the order is missing, unpaid, or the save fails.
pub async fn handle_schedule_shipment(
    command: &Command,
    repository: &OrderRepository,
    clock: &dyn Clock,
) -> Result<Value, DomainError> {
    let shipment_id = command.id;
    execute_on_order(command, repository, clock, |order, ctx, clock| {
        order.schedule_shipment(shipment_id, ctx, clock)
    })
    .await
}

/// Handles [`CANCEL_SHIPMENT`].
///
/// # Errors
///
/// Returns `DomainError` if the order is missing or the save fails.
pub async fn handle_cancel_shipment(
    command: &Command,
    repository: &OrderRepository,
    clock: &dyn Clock,
) -> Result<Value, DomainError> {
    execute_on_order(command, repository, clock, Order::cancel_shipment).await
}

/// Handles [`CANCEL_ORDER`].
///
/// # Errors
///
/// Returns `DomainError::CommandValidation` for a malformed payload and
/// `DomainError` if the order cannot be cancelled or the save fails.
pub async fn handle_cancel_order(
    command: &Command,
    repository: &OrderRepository,
    clock: &dyn Clock,
) -> Result<Value, DomainError> {
    let payload: CancelOrder = command.payload_as()?;
    execute_on_order(command, repository, clock, |order, ctx, clock| {
        order.cancel(payload.reason, ctx, clock)
    })
    .await
}

/// Adapts a handler function into a bus handler sharing the repository and
/// clock.
fn bind<F, Fut>(
    repository: &Arc<OrderRepository>,
    clock: &Arc<dyn Clock>,
    handler: F,
) -> Arc<dyn CommandHandler>
where
    F: Fn(Command, Arc<OrderRepository>, Arc<dyn Clock>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, DomainError>> + Send + 'static,
{
    let repository = Arc::clone(repository);
    let clock = Arc::clone(clock);
    command_handler_fn(move |command| handler(command, Arc::clone(&repository), Arc::clone(&clock)))
}

/// Registers every order command on `bus`.
///
/// # Errors
///
/// Returns `DomainError::Dispatch` if a command type already has a handler.
pub fn register_command_handlers(
    bus: &CommandBus,
    repository: &Arc<OrderRepository>,
    clock: &Arc<dyn Clock>,
) -> Result<(), DomainError> {
    bus.register(
        PLACE_ORDER,
        bind(repository, clock, |c, r, k| async move {
            handle_place_order(&c, &r, k.as_ref()).await
        }),
    )?;
    bus.register(
        RESERVE_INVENTORY,
        bind(repository, clock, |c, r, k| async move {
            handle_reserve_inventory(&c, &r, k.as_ref()).await
        }),
    )?;
    bus.register(
        RELEASE_INVENTORY,
        bind(repository, clock, |c, r, k| async move {
            handle_release_inventory(&c, &r, k.as_ref()).await
        }),
    )?;
    bus.register(
        CHARGE_PAYMENT,
        bind(repository, clock, |c, r, k| async move {
            handle_charge_payment(&c, &r, k.as_ref()).await
        }),
    )?;
    bus.register(
        REFUND_PAYMENT,
        bind(repository, clock, |c, r, k| async move {
            handle_refund_payment(&c, &r, k.as_ref()).await
        }),
    )?;
    bus.register(
        SCHEDULE_SHIPMENT,
        bind(repository, clock, |c, r, k| async move {
            handle_schedule_shipment(&c, &r, k.as_ref()).await
        }),
    )?;
    bus.register(
        CANCEL_SHIPMENT,
        bind(repository, clock, |c, r, k| async move {
            handle_cancel_shipment(&c, &r, k.as_ref()).await
        }),
    )?;
    bus.register(
        CANCEL_ORDER,
        bind(repository, clock, |c, r, k| async move {
            handle_cancel_order(&c, &r, k.as_ref()).await
        }),
    )?;
    Ok(())
}
