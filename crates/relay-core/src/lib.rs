//! Core domain + application logic for the booking relay.
//!
//! This crate is intentionally transport-agnostic. The browser bridge and the HTTP
//! gateway live behind ports (traits) implemented in adapter crates.

pub mod address;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod domain;
pub mod errors;
pub mod logging;
pub mod store;
pub mod utils;

pub use errors::{Error, Result};
