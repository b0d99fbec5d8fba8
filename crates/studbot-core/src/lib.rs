//! Core domain + application logic for the studbot backend.
//!
//! This crate is intentionally framework-agnostic. The chat frontend, the
//! persistent store, the payment gateway and the AI providers live behind
//! ports (traits) implemented in adapter crates or by the deployment.

pub mod cache;
pub mod config;
pub mod context;
pub mod domain;
pub mod errors;
pub mod intake;
pub mod limiter;
pub mod logging;
pub mod messaging;
pub mod payments;
pub mod provider;
pub mod queue;
pub mod report;
pub mod store;

pub use errors::{Error, Result};
