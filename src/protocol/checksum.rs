//! # Command Checksum
//!
//! CRC-8 trailer appended to command frames written to the peripheral.
//!
//! **Polynomial**: 0xD5 (x^8 + x^7 + x^6 + x^4 + x^2 + 1), DVB-S2 variant
//! **Initial Value**: 0x00

/// CRC-8-DVB-S2 polynomial
const POLY: u8 = 0xD5;

/// Lookup table built at compile time
const TABLE: [u8; 256] = build_table();

const fn build_table() -> [u8; 256] {
    let mut table = [0u8; 256];
    let mut i = 0;

    while i < 256 {
        let mut crc = i as u8;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 0x80 != 0 { (crc << 1) ^ POLY } else { crc << 1 };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }

    table
}

/// Checksum over a command body
///
/// # Arguments
///
/// * `data` - Command body to checksum (Length + Opcode + Payload)
///
/// # Returns
///
/// * `u8` - CRC-8-DVB-S2 of `data`
///
/// # Examples
///
/// ```
/// use ride_telemetry::protocol::checksum::checksum;
///
/// assert_eq!(checksum(&[]), 0x00);
/// assert_eq!(checksum(&[0x01]), 0xD5);
/// ```
pub fn checksum(data: &[u8]) -> u8 {
    data.iter()
        .fold(0u8, |crc, &byte| TABLE[(crc ^ byte) as usize])
}

/// Check the trailer of a complete command frame
///
/// # Arguments
///
/// * `frame` - Sync byte, body and checksum trailer
///
/// # Returns
///
/// * `bool` - true when the trailer matches the checksum of the body
pub fn verify(frame: &[u8]) -> bool {
    match frame {
        [_sync, body @ .., trailer] => checksum(body) == *trailer,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bitwise(data: &[u8]) -> u8 {
        let mut crc = 0u8;
        for &byte in data {
            crc ^= byte;
            for _ in 0..8 {
                crc = if crc & 0x80 != 0 { (crc << 1) ^ POLY } else { crc << 1 };
            }
        }
        crc
    }

    #[test]
    fn test_empty_input() {
        assert_eq!(checksum(&[]), 0x00);
    }

    #[test]
    fn test_table_matches_bitwise() {
        let vectors: [&[u8]; 5] = [
            &[0x01, 0x02, 0x03],
            &[0xFF, 0xFE, 0xFD],
            &[0x03, 0x10, 0x01],
            &[0x00; 24],
            &[0xFF; 10],
        ];
        for data in vectors {
            assert_eq!(checksum(data), bitwise(data), "mismatch for {:02X?}", data);
        }
    }

    #[test]
    fn test_changes_with_data() {
        assert_ne!(checksum(&[0x03, 0x10, 0x01]), checksum(&[0x03, 0x10, 0x02]));
    }

    #[test]
    fn test_verify() {
        let body = [0x03, 0x10, 0x01];
        let frame = [0xA5, 0x03, 0x10, 0x01, checksum(&body)];
        assert!(verify(&frame));

        let mut corrupt = frame;
        corrupt[3] ^= 0xFF;
        assert!(!verify(&corrupt));

        assert!(!verify(&[0xA5]));
    }
}
