//! # Protocol Constants
//!
//! Identifiers and limits for the peripheral link. The UUIDs are defaults;
//! custom link settings override them.

use uuid::{uuid, Uuid};

/// UART-style service exposed by most BLE telemetry bridges
pub const UART_SERVICE: Uuid = uuid!("6e400001-b5a3-f393-e0a9-e50e24dcca9e");

/// Host → peripheral write characteristic of the UART service
pub const UART_RX_CHARACTERISTIC: Uuid = uuid!("6e400002-b5a3-f393-e0a9-e50e24dcca9e");

/// Peripheral → host notify characteristic of the UART service
pub const UART_TX_CHARACTERISTIC: Uuid = uuid!("6e400003-b5a3-f393-e0a9-e50e24dcca9e");

/// Generic 16-bit vendor service seen on some dashboards
pub const VENDOR_SERVICE: Uuid = uuid!("0000fff0-0000-1000-8000-00805f9b34fb");

/// Notify characteristic of the vendor service
pub const VENDOR_NOTIFY_CHARACTERISTIC: Uuid = uuid!("0000fff1-0000-1000-8000-00805f9b34fb");

/// Write characteristic of the vendor service
pub const VENDOR_WRITE_CHARACTERISTIC: Uuid = uuid!("0000fff2-0000-1000-8000-00805f9b34fb");

/// Telemetry characteristics tried in order when no override is configured
pub const TELEMETRY_CANDIDATES: &[Uuid] = &[UART_TX_CHARACTERISTIC, VENDOR_NOTIFY_CHARACTERISTIC];

/// Command characteristics tried in order when no override is configured
pub const COMMAND_CANDIDATES: &[Uuid] = &[UART_RX_CHARACTERISTIC, VENDOR_WRITE_CHARACTERISTIC];

/// Leading byte of every command frame
pub const COMMAND_SYNC_BYTE: u8 = 0xA5;

/// Opcode: present the shared auth key
pub const OPCODE_AUTH_KEY: u8 = 0x01;

/// Opcode: answer an authentication challenge
pub const OPCODE_AUTH_RESPONSE: u8 = 0x02;

/// Opcode: reset a trip counter
pub const OPCODE_TRIP_RESET: u8 = 0x10;

/// Status byte the peripheral returns after accepting a challenge response
pub const AUTH_STATUS_OK: u8 = 0x01;

/// Number of digest bytes sent in a challenge response
pub const AUTH_DIGEST_LEN: usize = 16;

/// Maximum command payload
pub const MAX_COMMAND_PAYLOAD: usize = 32;

/// Smallest frame decoded with the full layout
pub const FULL_FRAME_MIN_LEN: usize = 10;

/// Smallest frame decoded with the minimal layout
pub const MINIMAL_FRAME_MIN_LEN: usize = 4;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidates_are_distinct() {
        assert_ne!(TELEMETRY_CANDIDATES[0], COMMAND_CANDIDATES[0]);
        assert_ne!(UART_SERVICE, VENDOR_SERVICE);
    }

    #[test]
    fn test_tier_lengths() {
        assert_eq!(FULL_FRAME_MIN_LEN, 10);
        assert_eq!(MINIMAL_FRAME_MIN_LEN, 4);
        assert!(AUTH_DIGEST_LEN <= MAX_COMMAND_PAYLOAD);
    }
}
