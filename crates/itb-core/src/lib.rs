//! Core domain + application logic for the Instagram Telegram Bot.
//!
//! This crate is intentionally framework-agnostic. Telegram / Instagram / the
//! assistant API live behind ports (traits) implemented in adapter crates.

pub mod config;
pub mod domain;
pub mod errors;
pub mod instagram;
pub mod logging;
pub mod messaging;
pub mod scheduler;
pub mod session;
pub mod store;
pub mod vault;

pub use errors::{Error, Result};
