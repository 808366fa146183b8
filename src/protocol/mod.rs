//! # Peripheral Protocol Module
//!
//! Best-effort implementation of the peripheral's undocumented wire format.
//!
//! This module handles:
//! - Length-tiered telemetry frame decoding with an overridable byte layout
//! - Command frame encoding (trip reset, authentication)
//! - CRC-8 (DVB-S2) trailer for command frames
//! - Well-known service and characteristic identifiers

pub mod checksum;
pub mod command;
pub mod constants;
pub mod decoder;

pub use decoder::{FrameDecoder, FrameLayout, PlaceholderPolicy};
