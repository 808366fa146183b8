//! # Ride Telemetry Library
//!
//! Acquire live motorcycle telemetry from a wireless peripheral and keep the
//! stream alive with cached, phone-sensor and synthetic fallback data.
//!
//! The [`engine::TelemetryEngine`] context ties the pieces together:
//! discovery, the connection state machine, the frame decoder, the telemetry
//! cache, the fallback synthesizer and the subscription hub.

pub mod config;
pub mod connection;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod fallback;
pub mod hub;
pub mod oplog;
pub mod protocol;
pub mod radio;
pub mod settings;
pub mod storage;
pub mod telemetry;
