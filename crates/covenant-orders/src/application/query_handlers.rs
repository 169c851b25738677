//! Query handlers and the order summary read model.
//!
//! The summary read model is fed by the `order_summary` projection and is
//! eventually consistent. `order.get` bypasses it and rebuilds the aggregate
//! from the event store.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use covenant_core::aggregate::AggregateRoot;
use covenant_core::command::Query;
use covenant_core::error::DomainError;
use covenant_core::event::StoredEvent;
use covenant_cqrs::{ProjectionManager, QueryBus, projection_handler_fn, query_handler_fn};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::application::command_handlers::OrderRepository;
use crate::domain::aggregates::{OrderState, OrderStatus};
use crate::domain::events::{
    INVENTORY_RELEASED_EVENT_TYPE, INVENTORY_RESERVED_EVENT_TYPE, ORDER_CANCELLED_EVENT_TYPE,
    ORDER_EVENT_TYPES, ORDER_PLACED_EVENT_TYPE, OrderPlaced, PAYMENT_CHARGED_EVENT_TYPE,
    PAYMENT_REFUNDED_EVENT_TYPE, SHIPMENT_CANCELLED_EVENT_TYPE, SHIPMENT_SCHEDULED_EVENT_TYPE,
};

/// Name of the projection maintaining [`OrderSummaryReadModel`].
pub const ORDER_SUMMARY_PROJECTION: &str = "order_summary";

/// Reads one order summary from the read model.
pub const GET_ORDER_SUMMARY: &str = "order.get_summary";
/// Lists order summaries, optionally filtered by `{"status": ...}`.
pub const LIST_ORDER_SUMMARIES: &str = "order.list_summaries";
/// Rebuilds one order from its event stream.
pub const GET_ORDER: &str = "order.get";

/// Read-only view of an order kept by the projection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderSummary {
    /// The order identifier.
    pub order_id: String,
    /// The customer who placed it.
    pub customer_id: String,
    /// Order total in cents.
    pub total_cents: u64,
    /// Reservation, payment and shipment flags folded into one status.
    pub status: OrderStatus,
    /// Version of the last applied event.
    pub version: u64,
}

/// Filter accepted by [`LIST_ORDER_SUMMARIES`].
#[derive(Debug, Default, Deserialize)]
struct SummaryFilter {
    status: Option<OrderStatus>,
}

/// In-memory order summaries keyed by order id.
#[derive(Debug, Default)]
pub struct OrderSummaryReadModel {
    summaries: RwLock<HashMap<String, OrderSummary>>,
}

impl OrderSummaryReadModel {
    /// Creates an empty read model.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the summary of `order_id`, if projected.
    #[must_use]
    pub fn get(&self, order_id: &str) -> Option<OrderSummary> {
        self.summaries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(order_id)
            .cloned()
    }

    /// Returns every summary matching `status`, ordered by order id.
    #[must_use]
    pub fn list(&self, status: Option<OrderStatus>) -> Vec<OrderSummary> {
        let mut summaries: Vec<_> = self
            .summaries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|s| status.is_none_or(|wanted| s.status == wanted))
            .cloned()
            .collect();
        summaries.sort_by(|a, b| a.order_id.cmp(&b.order_id));
        summaries
    }

    /// Folds `event` into the summary of its order. Events at or below the
    /// summary's version are ignored, which makes redelivery harmless.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Serialization` for a malformed `order.placed`
    /// payload and `DomainError::EventSourcing` for an event on an order
    /// that was never placed.
    pub fn apply(&self, event: &StoredEvent) -> Result<(), DomainError> {
        let mut summaries = self
            .summaries
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        if event.event_type == ORDER_PLACED_EVENT_TYPE {
            if summaries.contains_key(&event.aggregate_id) {
                return Ok(());
            }
            let placed: OrderPlaced = serde_json::from_value(event.data.clone())?;
            summaries.insert(
                event.aggregate_id.clone(),
                OrderSummary {
                    order_id: event.aggregate_id.clone(),
                    customer_id: placed.customer_id,
                    total_cents: placed.total_cents,
                    status: OrderStatus::Placed,
                    version: event.version,
                },
            );
            return Ok(());
        }

        let summary = summaries.get_mut(&event.aggregate_id).ok_or_else(|| {
            DomainError::EventSourcing(format!(
                "{} for order {} arrived before order.placed",
                event.event_type, event.aggregate_id
            ))
        })?;
        if event.version <= summary.version {
            return Ok(());
        }
        summary.status = match event.event_type.as_str() {
            INVENTORY_RESERVED_EVENT_TYPE | PAYMENT_REFUNDED_EVENT_TYPE => OrderStatus::Reserved,
            INVENTORY_RELEASED_EVENT_TYPE => OrderStatus::Placed,
            PAYMENT_CHARGED_EVENT_TYPE | SHIPMENT_CANCELLED_EVENT_TYPE => OrderStatus::Paid,
            SHIPMENT_SCHEDULED_EVENT_TYPE => OrderStatus::Scheduled,
            ORDER_CANCELLED_EVENT_TYPE => OrderStatus::Cancelled,
            _ => summary.status,
        };
        summary.version = event.version;
        Ok(())
    }
}

/// Subscribes the read model to every order event type under
/// [`ORDER_SUMMARY_PROJECTION`].
///
/// # Errors
///
/// Returns `DomainError::Dispatch` if the projection is already registered.
pub fn register_order_projection(
    projections: &ProjectionManager,
    read_model: &Arc<OrderSummaryReadModel>,
) -> Result<(), DomainError> {
    for event_type in ORDER_EVENT_TYPES {
        let read_model = Arc::clone(read_model);
        projections.register(
            event_type,
            ORDER_SUMMARY_PROJECTION,
            projection_handler_fn(move |event: StoredEvent| {
                let read_model = Arc::clone(&read_model);
                async move { read_model.apply(&event) }
            }),
        )?;
    }
    Ok(())
}

/// Rejects a read that is older than the query's expected version.
fn ensure_caught_up(query: &Query, actual: u64) -> Result<(), DomainError> {
    match query.expected_version {
        Some(expected) if actual < expected => Err(DomainError::ConcurrencyConflict {
            aggregate_id: query.target_id.clone(),
            expected,
            actual,
        }),
        _ => Ok(()),
    }
}

/// Reads one summary from the read model.
///
/// # Errors
///
/// Returns `DomainError::AggregateNotFound` if the order has not been
/// projected yet and `DomainError::ConcurrencyConflict` if the projection
/// lags behind the query's expected version.
pub fn get_order_summary(
    query: &Query,
    read_model: &OrderSummaryReadModel,
) -> Result<Value, DomainError> {
    let summary = read_model
        .get(&query.target_id)
        .ok_or_else(|| DomainError::AggregateNotFound(query.target_id.clone()))?;
    ensure_caught_up(query, summary.version)?;
    Ok(serde_json::to_value(summary)?)
}

/// Lists summaries from the read model.
///
/// # Errors
///
/// Returns `DomainError::QueryValidation` for a malformed filter.
pub fn list_order_summaries(
    query: &Query,
    read_model: &OrderSummaryReadModel,
) -> Result<Value, DomainError> {
    let filter: SummaryFilter = if query.payload.is_null() {
        SummaryFilter::default()
    } else {
        query.payload_as()?
    };
    Ok(serde_json::to_value(read_model.list(filter.status))?)
}

/// View returned by [`GET_ORDER`].
#[derive(Debug, Serialize)]
struct OrderView<'a> {
    order_id: &'a str,
    version: u64,
    status: OrderStatus,
    #[serde(flatten)]
    state: &'a OrderState,
}

/// Rebuilds the order from the event store.
///
/// # Errors
///
/// Returns `DomainError::AggregateNotFound` for an unknown order and
/// `DomainError::ConcurrencyConflict` if the stream is behind the query's
/// expected version.
pub async fn get_order(query: &Query, repository: &OrderRepository) -> Result<Value, DomainError> {
    let order = repository.get_by_id(&query.target_id).await?;
    ensure_caught_up(query, order.version())?;
    Ok(serde_json::to_value(OrderView {
        order_id: order.aggregate_id(),
        version: order.version(),
        status: order.state().status(),
        state: order.state(),
    })?)
}

/// Registers every order query on `bus`.
///
/// # Errors
///
/// Returns `DomainError::Dispatch` if a query type already has a handler.
pub fn register_query_handlers(
    bus: &QueryBus,
    read_model: &Arc<OrderSummaryReadModel>,
    repository: &Arc<OrderRepository>,
) -> Result<(), DomainError> {
    let summaries = Arc::clone(read_model);
    bus.register(
        GET_ORDER_SUMMARY,
        query_handler_fn(move |query: Query| {
            let summaries = Arc::clone(&summaries);
            async move { get_order_summary(&query, &summaries) }
        }),
    )?;
    let summaries = Arc::clone(read_model);
    bus.register(
        LIST_ORDER_SUMMARIES,
        query_handler_fn(move |query: Query| {
            let summaries = Arc::clone(&summaries);
            async move { list_order_summaries(&query, &summaries) }
        }),
    )?;
    let repository = Arc::clone(repository);
    bus.register(
        GET_ORDER,
        query_handler_fn(move |query: Query| {
            let repository = Arc::clone(&repository);
            async move { get_order(&query, &repository).await }
        }),
    )?;
    Ok(())
}
