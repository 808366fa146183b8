//! # Command Encoder
//!
//! Encodes host → peripheral command frames.
//!
//! Frame structure: sync(1) + length(1) + opcode(1) + payload(N) + crc(1),
//! where `length = 1 + N` (opcode and payload) and the CRC covers length,
//! opcode and payload.

use serde::{Deserialize, Serialize};

use super::checksum::checksum;
use super::constants::*;
use crate::error::{EngineError, Result};

/// Trip counter selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TripCounter {
    A,
    B,
}

impl TripCounter {
    fn code(self) -> u8 {
        match self {
            TripCounter::A => 0x01,
            TripCounter::B => 0x02,
        }
    }
}

/// Encode a command frame
///
/// # Arguments
///
/// * `opcode` - Command opcode byte
/// * `payload` - Command payload (max [`MAX_COMMAND_PAYLOAD`] bytes)
///
/// # Returns
///
/// * `Ok(Vec<u8>)` - Sync byte, length, opcode, payload and checksum
/// * `Err(EngineError)` - If the payload is too long
///
/// # Errors
///
/// Returns error if the payload exceeds [`MAX_COMMAND_PAYLOAD`]
pub fn encode_command(opcode: u8, payload: &[u8]) -> Result<Vec<u8>> {
    if payload.len() > MAX_COMMAND_PAYLOAD {
        return Err(EngineError::Connection(format!(
            "command payload of {} bytes exceeds maximum {}",
            payload.len(),
            MAX_COMMAND_PAYLOAD
        )));
    }

    let mut body = Vec::with_capacity(2 + payload.len());
    body.push((1 + payload.len()) as u8);
    body.push(opcode);
    body.extend_from_slice(payload);

    let mut frame = Vec::with_capacity(body.len() + 2);
    frame.push(COMMAND_SYNC_BYTE);
    frame.extend_from_slice(&body);
    frame.push(checksum(&body));
    Ok(frame)
}

/// Encode a trip reset command
///
/// # Arguments
///
/// * `trip` - Counter to reset
///
/// # Returns
///
/// * `Vec<u8>` - Complete 5-byte frame
///
/// # Examples
///
/// ```
/// use ride_telemetry::protocol::command::{encode_trip_reset, TripCounter};
///
/// let frame = encode_trip_reset(TripCounter::A);
/// assert_eq!(&frame[..4], &[0xA5, 0x02, 0x10, 0x01]);
/// ```
pub fn encode_trip_reset(trip: TripCounter) -> Vec<u8> {
    let body = [2u8, OPCODE_TRIP_RESET, trip.code()];
    let mut frame = Vec::with_capacity(body.len() + 2);
    frame.push(COMMAND_SYNC_BYTE);
    frame.extend_from_slice(&body);
    frame.push(checksum(&body));
    frame
}

/// Encode the shared-key presentation used by the key write strategy
///
/// # Arguments
///
/// * `key` - Raw key bytes
pub fn encode_auth_key(key: &[u8]) -> Result<Vec<u8>> {
    encode_command(OPCODE_AUTH_KEY, key)
}

/// Encode a challenge response digest
///
/// # Arguments
///
/// * `digest` - Response digest for the peripheral's challenge
pub fn encode_auth_response(digest: &[u8]) -> Result<Vec<u8>> {
    encode_command(OPCODE_AUTH_RESPONSE, digest)
}
