//! Application layer for the Order fulfillment context.

pub mod command_handlers;
pub mod fulfillment;
pub mod query_handlers;
