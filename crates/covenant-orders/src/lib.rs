//! Covenant — Order fulfillment bounded context.
//!
//! Responsible for placing orders and walking them through inventory
//! reservation, payment and shipment. Exercises the event store, both buses,
//! a read-model projection and the fulfillment saga.

pub mod application;
pub mod domain;
