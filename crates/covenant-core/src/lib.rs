//! Covenant Core — shared event-sourcing abstractions.
//!
//! This crate defines the event, aggregate, command and event-store
//! contracts that every other crate in the engine builds on, together with
//! the snapshot-aware aggregate repository. Storage backends live in
//! `covenant-event-store`.

pub mod aggregate;
pub mod clock;
pub mod command;
pub mod error;
pub mod event;
pub mod repository;
pub mod rng;
pub mod store;
