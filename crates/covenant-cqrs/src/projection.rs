//! Polling projections over the event store's by-type index.
//!
//! Each projection subscribes one handler per event type. A poll reads every
//! subscribed type from the last checkpoint timestamp onward, applies the
//! new events in timestamp order and advances the checkpoint. Delivery is
//! at-least-once and there is no ordering across event types.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use covenant_core::clock::Clock;
use covenant_core::error::DomainError;
use covenant_core::store::EventStore;

use crate::checkpoint::{CheckpointStore, ProjectionCheckpoint};
use crate::handler::ProjectionHandler;

struct Projection {
    handlers: HashMap<String, Arc<dyn ProjectionHandler>>,
    poll_lock: Arc<Mutex<()>>,
}

struct Shared {
    store: Arc<dyn EventStore>,
    checkpoints: Arc<dyn CheckpointStore>,
    clock: Arc<dyn Clock>,
    projections: RwLock<HashMap<String, Projection>>,
}

struct RunningProjection {
    cancel: watch::Sender<bool>,
    task: JoinHandle<()>,
}

fn unknown_projection(name: &str) -> DomainError {
    DomainError::Dispatch(format!("no projection registered under `{name}`"))
}

impl Shared {
    fn ensure_registered(&self, name: &str) -> Result<Arc<Mutex<()>>, DomainError> {
        self.projections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .map(|p| Arc::clone(&p.poll_lock))
            .ok_or_else(|| unknown_projection(name))
    }

    async fn poll_once(&self, name: &str) -> Result<usize, DomainError> {
        let (handlers, poll_lock) = {
            let projections = self
                .projections
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            let projection = projections.get(name).ok_or_else(|| unknown_projection(name))?;
            (projection.handlers.clone(), Arc::clone(&projection.poll_lock))
        };
        let _guard = poll_lock.lock().await;

        let mut checkpoint = match self.checkpoints.load(name).await? {
            Some(checkpoint) => checkpoint,
            None => ProjectionCheckpoint::new(name, self.clock.now()),
        };

        let mut pending = Vec::new();
        for event_type in handlers.keys() {
            pending.extend(
                self.store
                    .get_events_by_type(event_type, checkpoint.last_timestamp)
                    .await?,
            );
        }
        pending.retain(|event| !checkpoint.has_processed(event));
        pending.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a.aggregate_id.cmp(&b.aggregate_id))
                .then(a.version.cmp(&b.version))
        });

        if pending.is_empty() && checkpoint.last_error.is_none() {
            return Ok(0);
        }

        let mut applied = 0;
        let mut failure = None;
        for event in &pending {
            let Some(handler) = handlers.get(&event.event_type) else {
                continue;
            };
            match handler.handle(event).await {
                Ok(()) => {
                    checkpoint.record(event);
                    applied += 1;
                }
                Err(e) => {
                    warn!(
                        projection = name,
                        event_id = %event.event_id,
                        event_type = %event.event_type,
                        error = %e,
                        "projection handler failed; batch stopped"
                    );
                    failure = Some(e.to_string());
                    break;
                }
            }
        }

        checkpoint.last_error = failure;
        checkpoint.updated_at = self.clock.now();
        self.checkpoints.save(checkpoint).await?;
        debug!(projection = name, applied, "projection polled");
        Ok(applied)
    }
}

/// Runs projections as background polling tasks.
pub struct ProjectionManager {
    shared: Arc<Shared>,
    poll_interval: Duration,
    running: Mutex<HashMap<String, RunningProjection>>,
}

impl ProjectionManager {
    /// Creates a manager polling `store` every `poll_interval`.
    #[must_use]
    pub fn new(
        store: Arc<dyn EventStore>,
        checkpoints: Arc<dyn CheckpointStore>,
        clock: Arc<dyn Clock>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                store,
                checkpoints,
                clock,
                projections: RwLock::new(HashMap::new()),
            }),
            poll_interval,
            running: Mutex::new(HashMap::new()),
        }
    }

    /// Subscribes `handler` to `event_type` within `projection_name`.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Dispatch` if the projection already handles
    /// `event_type`.
    pub fn register(
        &self,
        event_type: impl Into<String>,
        projection_name: impl Into<String>,
        handler: Arc<dyn ProjectionHandler>,
    ) -> Result<(), DomainError> {
        let event_type = event_type.into();
        let projection_name = projection_name.into();
        let mut projections = self
            .shared
            .projections
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let projection = projections
            .entry(projection_name.clone())
            .or_insert_with(|| Projection {
                handlers: HashMap::new(),
                poll_lock: Arc::new(Mutex::new(())),
            });
        if projection.handlers.contains_key(&event_type) {
            return Err(DomainError::Dispatch(format!(
                "projection `{projection_name}` already handles `{event_type}`"
            )));
        }
        projection.handlers.insert(event_type, handler);
        Ok(())
    }

    /// Starts the polling loop of `projection_name`. Starting a running
    /// projection is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Dispatch` for an unknown projection.
    #[instrument(skip(self))]
    pub async fn start(&self, projection_name: &str) -> Result<(), DomainError> {
        self.shared.ensure_registered(projection_name)?;
        let mut running = self.running.lock().await;
        if running
            .get(projection_name)
            .is_some_and(|r| !r.task.is_finished())
        {
            debug!("projection already running");
            return Ok(());
        }

        let (cancel_tx, mut cancel_rx) = watch::channel(false);
        let shared = Arc::clone(&self.shared);
        let name = projection_name.to_owned();
        let interval = self.poll_interval;

        let task = tokio::spawn(async move {
            info!(projection = %name, interval = ?interval, "projection started");
            loop {
                if let Err(e) = shared.poll_once(&name).await {
                    error!(projection = %name, error = %e, "projection poll failed");
                }
                tokio::select! {
                    () = tokio::time::sleep(interval) => {}
                    changed = cancel_rx.changed() => {
                        if changed.is_err() || *cancel_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            info!(projection = %name, "projection stopped");
        });

        running.insert(
            projection_name.to_owned(),
            RunningProjection {
                cancel: cancel_tx,
                task,
            },
        );
        Ok(())
    }

    /// Signals the polling loop to stop after its current iteration and
    /// waits for it. Stopping an idle projection is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Dispatch` for an unknown projection.
    #[instrument(skip(self))]
    pub async fn stop(&self, projection_name: &str) -> Result<(), DomainError> {
        self.shared.ensure_registered(projection_name)?;
        let running = self.running.lock().await.remove(projection_name);
        if let Some(running) = running {
            Self::join(projection_name, running).await;
        }
        Ok(())
    }

    /// Stops every running projection.
    pub async fn stop_all(&self) {
        let running: Vec<_> = self.running.lock().await.drain().collect();
        for (name, projection) in running {
            Self::join(&name, projection).await;
        }
    }

    async fn join(projection_name: &str, running: RunningProjection) {
        let _ = running.cancel.send(true);
        if let Err(e) = running.task.await {
            warn!(projection = projection_name, error = %e, "projection task ended abnormally");
        }
    }

    /// Returns `true` while the polling loop of `projection_name` is alive.
    pub async fn is_running(&self, projection_name: &str) -> bool {
        self.running
            .lock()
            .await
            .get(projection_name)
            .is_some_and(|r| !r.task.is_finished())
    }

    /// Runs one poll inline and returns the number of events applied.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Dispatch` for an unknown projection and store
    /// errors unchanged. Handler errors are recorded on the checkpoint.
    pub async fn poll_once(&self, projection_name: &str) -> Result<usize, DomainError> {
        self.shared.poll_once(projection_name).await
    }

    /// Returns the persisted checkpoint of `projection_name`.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Dispatch` for an unknown projection and store
    /// errors unchanged.
    pub async fn checkpoint(
        &self,
        projection_name: &str,
    ) -> Result<Option<ProjectionCheckpoint>, DomainError> {
        self.shared.ensure_registered(projection_name)?;
        self.shared.checkpoints.load(projection_name).await
    }

    /// Discards the checkpoint so the next poll rebuilds the read model from
    /// the first event.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Dispatch` for an unknown projection and store
    /// errors unchanged.
    #[instrument(skip(self))]
    pub async fn reset(&self, projection_name: &str) -> Result<(), DomainError> {
        let poll_lock = self.shared.ensure_registered(projection_name)?;
        let _guard = poll_lock.lock().await;
        self.shared.checkpoints.delete(projection_name).await?;
        info!("projection checkpoint reset");
        Ok(())
    }
}

impl std::fmt::Debug for ProjectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjectionManager")
            .field("poll_interval", &self.poll_interval)
            .finish_non_exhaustive()
    }
}
