//! Wiring of the engine's components.

use std::sync::Arc;

use covenant_core::clock::{Clock, SystemClock};
use covenant_core::repository::AggregateRepository;
use covenant_core::rng::StdRngSource;
use covenant_core::store::EventStore;
use covenant_cqrs::{CommandBus, InMemoryCheckpointStore, ProjectionManager, QueryBus};
use covenant_event_store::{InMemoryEventStore, PgEventStore};
use covenant_orders::application::command_handlers::{OrderRepository, register_command_handlers};
use covenant_orders::application::query_handlers::{
    ORDER_SUMMARY_PROJECTION, OrderSummaryReadModel, register_order_projection,
    register_query_handlers,
};
use covenant_saga::{InMemorySagaStore, SagaOrchestrator};
use covenant_transaction::{
    DistributedTransactionCoordinator, InMemoryTransactionStore, ParticipantClient,
};
use sqlx::postgres::PgPoolOptions;
use tracing::info;

use crate::config::EngineConfig;
use crate::error::EngineError;

/// A fully wired engine.
///
/// Commands for the order context are registered on [`Engine::commands`],
/// its queries on [`Engine::queries`], and the order summary projection on
/// [`Engine::projections`]. Applications add their own handlers to the same
/// buses.
pub struct Engine {
    pub config: EngineConfig,
    pub clock: Arc<dyn Clock>,
    pub event_store: Arc<dyn EventStore>,
    pub orders: Arc<OrderRepository>,
    pub order_summaries: Arc<OrderSummaryReadModel>,
    pub commands: Arc<CommandBus>,
    pub queries: Arc<QueryBus>,
    pub projections: ProjectionManager,
    pub sagas: SagaOrchestrator,
    pub transactions: DistributedTransactionCoordinator,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Builds an engine over the in-memory event store.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Domain` if handler registration fails.
    pub fn in_memory(
        config: EngineConfig,
        participants: Arc<dyn ParticipantClient>,
    ) -> Result<Self, EngineError> {
        Self::assemble(
            config,
            Arc::new(InMemoryEventStore::new()),
            participants,
            Arc::new(SystemClock),
        )
    }

    /// Builds an engine over PostgreSQL when `config.database_url` is set,
    /// and over the in-memory store otherwise.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Database` if the pool cannot connect or the
    /// tables cannot be created, and `EngineError::Domain` if handler
    /// registration fails.
    pub async fn connect(
        config: EngineConfig,
        participants: Arc<dyn ParticipantClient>,
    ) -> Result<Self, EngineError> {
        let Some(database_url) = config.database_url.clone() else {
            info!("DATABASE_URL not set, using the in-memory event store");
            return Self::in_memory(config, participants);
        };

        let pool = PgPoolOptions::new()
            .max_connections(config.db_max_connections)
            .connect(&database_url)
            .await?;
        let store = PgEventStore::new(pool);
        store.migrate().await?;
        info!(
            max_connections = config.db_max_connections,
            "connected to the PostgreSQL event store"
        );
        Self::assemble(config, Arc::new(store), participants, Arc::new(SystemClock))
    }

    /// Wires every component around `event_store` and `clock`.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Domain` if handler registration fails.
    pub fn assemble(
        config: EngineConfig,
        event_store: Arc<dyn EventStore>,
        participants: Arc<dyn ParticipantClient>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, EngineError> {
        let orders = Arc::new(AggregateRepository::new(
            Arc::clone(&event_store),
            config.snapshot_frequency,
            Arc::clone(&clock),
        )?);
        let order_summaries = Arc::new(OrderSummaryReadModel::new());

        let commands = Arc::new(CommandBus::new());
        register_command_handlers(&commands, &orders, &clock)?;
        let queries = Arc::new(QueryBus::new());
        register_query_handlers(&queries, &order_summaries, &orders)?;

        let projections = ProjectionManager::new(
            Arc::clone(&event_store),
            Arc::new(InMemoryCheckpointStore::new()),
            Arc::clone(&clock),
            config.projection_poll_interval,
        );
        register_order_projection(&projections, &order_summaries)?;

        let sagas = SagaOrchestrator::new(
            Arc::clone(&commands),
            Arc::new(InMemorySagaStore::new()),
            Arc::clone(&clock),
            Box::new(StdRngSource::from_os_rng()),
        );
        let transactions = DistributedTransactionCoordinator::new(
            participants,
            Arc::new(InMemoryTransactionStore::new()),
            Arc::clone(&clock),
            config.participant_call_timeout,
        );

        info!(
            snapshot_frequency = config.snapshot_frequency,
            poll_interval = ?config.projection_poll_interval,
            "engine assembled"
        );
        Ok(Self {
            config,
            clock,
            event_store,
            orders,
            order_summaries,
            commands,
            queries,
            projections,
            sagas,
            transactions,
        })
    }

    /// Starts the background polling of the built-in projections.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Dispatch` (wrapped) if a projection is unknown.
    pub async fn start(&self) -> Result<(), EngineError> {
        self.projections.start(ORDER_SUMMARY_PROJECTION).await?;
        info!("engine started");
        Ok(())
    }

    /// Stops every running projection and waits for the polling tasks.
    pub async fn shutdown(&self) {
        self.projections.stop_all().await;
        info!("engine stopped");
    }
}
