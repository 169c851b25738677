//! Domain layer for the Order fulfillment context.

pub mod aggregates;
pub mod commands;
pub mod events;
