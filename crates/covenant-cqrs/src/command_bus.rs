//! Command bus: routes each command to its single registered handler.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, PoisonError, RwLock};

use futures::FutureExt;
use tracing::{error, instrument, warn};

use covenant_core::command::{Command, CommandResult};
use covenant_core::error::DomainError;

use crate::handler::CommandHandler;

/// Extracts a readable message from a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "handler panicked".to_owned()
    }
}

/// Dispatches commands to exactly one handler per command type.
#[derive(Default)]
pub struct CommandBus {
    handlers: RwLock<HashMap<String, Arc<dyn CommandHandler>>>,
}

impl CommandBus {
    /// Creates a bus with no handlers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `command_type`.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Dispatch` if the type already has a handler.
    pub fn register(
        &self,
        command_type: impl Into<String>,
        handler: Arc<dyn CommandHandler>,
    ) -> Result<(), DomainError> {
        let command_type = command_type.into();
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        if handlers.contains_key(&command_type) {
            return Err(DomainError::Dispatch(format!(
                "a handler is already registered for command type `{command_type}`"
            )));
        }
        handlers.insert(command_type, handler);
        Ok(())
    }

    /// Returns `true` if `command_type` has a handler.
    #[must_use]
    pub fn has_handler(&self, command_type: &str) -> bool {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(command_type)
    }

    /// Validates `command` and awaits its handler.
    ///
    /// Handler errors and panics are returned as a failed `CommandResult`.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::CommandValidation` for a malformed command and
    /// `DomainError::Dispatch` when no handler is registered.
    #[instrument(
        skip(self, command),
        fields(
            command_type = %command.command_type,
            command_id = %command.id,
            target_id = %command.target_id,
        )
    )]
    pub async fn execute(&self, command: Command) -> Result<CommandResult, DomainError> {
        command.validate()?;
        let handler = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&command.command_type)
            .cloned()
            .ok_or_else(|| {
                DomainError::Dispatch(format!(
                    "no handler registered for command type `{}`",
                    command.command_type
                ))
            })?;

        match AssertUnwindSafe(handler.handle(command)).catch_unwind().await {
            Ok(Ok(result)) => Ok(CommandResult::succeeded(result)),
            Ok(Err(e)) => {
                warn!(error = %e, "command handler failed");
                Ok(CommandResult::failed(e.to_string()))
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(panic = %message, "command handler panicked");
                Ok(CommandResult::failed(format!("handler panicked: {message}")))
            }
        }
    }
}

impl fmt::Debug for CommandBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
        let mut types: Vec<_> = handlers.keys().collect();
        types.sort();
        f.debug_struct("CommandBus")
            .field("command_types", &types)
            .finish()
    }
}
