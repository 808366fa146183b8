//! # Connection Module
//!
//! Drives a peripheral from selection to authenticated monitoring and back.
//!
//! This module handles:
//! - The pure connection state machine
//! - Radio connect, service discovery and characteristic selection
//! - The ordered authentication chain
//! - Forwarding notifications through the frame decoder to cache and hub
//! - Idempotent teardown for user and link-initiated disconnects

pub mod auth;
pub mod manager;
pub mod state;

pub use manager::{select_characteristics, ConnectionManager, ManagerDeps, Selection};
pub use state::{transition, ConnectionEvent, ConnectionState};
