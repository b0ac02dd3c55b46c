//! Spendwire: multi-tenant expense capture over a consumer messaging
//! platform.
//!
//! The [`connection`] manager keeps one live session per tenant identity
//! and publishes inbound messages on the [`events`] bus. The [`router`]
//! deduplicates them and hands each to the [`queue`] (receipt images) or
//! the [`flow`] engine (guided questions and AI confirmations), which
//! writes finished records through the [`collaborators`].
//!
//! See `DESIGN.md` for the architecture notes.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod credentials;
pub mod error;
pub mod logging;
pub mod service;
pub mod types;

pub mod events;
pub mod store;

pub mod collaborators;
pub mod connection;

pub mod flow;
pub mod queue;
pub mod router;

pub mod engine;
