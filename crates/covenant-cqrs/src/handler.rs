//! Handler traits and closure adapters.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use covenant_core::command::{Command, Query};
use covenant_core::error::DomainError;
use covenant_core::event::StoredEvent;

/// Handles one command type. The returned value becomes the command result.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// Executes `command`.
    ///
    /// # Errors
    ///
    /// Any error is reported to the caller as a failed `CommandResult`.
    async fn handle(&self, command: Command) -> Result<Value, DomainError>;
}

/// Handles one query type against a read model.
#[async_trait]
pub trait QueryHandler: Send + Sync {
    /// Executes `query`.
    ///
    /// # Errors
    ///
    /// Any error is reported to the caller as a failed `QueryResult`.
    async fn handle(&self, query: Query) -> Result<Value, DomainError>;
}

/// Applies events of one type to a read model. Must be idempotent: delivery
/// is at-least-once.
#[async_trait]
pub trait ProjectionHandler: Send + Sync {
    /// Applies `event`.
    ///
    /// # Errors
    ///
    /// An error stops the current batch; the event is retried next poll.
    async fn handle(&self, event: &StoredEvent) -> Result<(), DomainError>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> CommandHandler for FnHandler<F>
where
    F: Fn(Command) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, DomainError>> + Send + 'static,
{
    async fn handle(&self, command: Command) -> Result<Value, DomainError> {
        (self.0)(command).await
    }
}

struct FnQueryHandler<F>(F);

#[async_trait]
impl<F, Fut> QueryHandler for FnQueryHandler<F>
where
    F: Fn(Query) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, DomainError>> + Send + 'static,
{
    async fn handle(&self, query: Query) -> Result<Value, DomainError> {
        (self.0)(query).await
    }
}

struct FnProjectionHandler<F>(F);

#[async_trait]
impl<F, Fut> ProjectionHandler for FnProjectionHandler<F>
where
    F: Fn(StoredEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), DomainError>> + Send + 'static,
{
    async fn handle(&self, event: &StoredEvent) -> Result<(), DomainError> {
        (self.0)(event.clone()).await
    }
}

/// Wraps an async closure as a [`CommandHandler`].
pub fn command_handler_fn<F, Fut>(f: F) -> Arc<dyn CommandHandler>
where
    F: Fn(Command) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, DomainError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Wraps an async closure as a [`QueryHandler`].
pub fn query_handler_fn<F, Fut>(f: F) -> Arc<dyn QueryHandler>
where
    F: Fn(Query) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, DomainError>> + Send + 'static,
{
    Arc::new(FnQueryHandler(f))
}

/// Wraps an async closure as a [`ProjectionHandler`]. The closure receives
/// an owned copy of the event.
pub fn projection_handler_fn<F, Fut>(f: F) -> Arc<dyn ProjectionHandler>
where
    F: Fn(StoredEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), DomainError>> + Send + 'static,
{
    Arc::new(FnProjectionHandler(f))
}
