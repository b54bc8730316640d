//! CRC-16 used by the SMP serial framing
//!
//! This is the bit-serial, MSB-first "shift in" variant used by the MCUmgr
//! console transport. With the two zero bytes of padding enabled the result is
//! identical to CRC-16/XMODEM, which lets a sender checksum a buffer whose
//! trailing CRC bytes have not been written yet.

/// Polynomial used by the SMP serial transport
pub const CRC16_POLYNOMIAL: u16 = 0x1021;

/// Initial value used by the SMP serial transport
pub const CRC16_INITIAL: u16 = 0x0000;

/// Compute a CRC-16 over `data[start..start + length]`
///
/// When `pad` is set, two implicit zero bytes are processed after the input.
///
/// # Panics
///
/// Panics if `start + length` is beyond the end of `data`.
pub fn crc16(data: &[u8], start: usize, length: usize, polynomial: u16, initial: u16, pad: bool) -> u16 {
    let input = &data[start..start + length];
    let padding: &[u8] = if pad { &[0, 0] } else { &[] };

    let mut crc = initial;

    for &byte in input.iter().chain(padding) {
        for bit in 0..8 {
            let divide = crc & 0x8000 != 0;
            crc = (crc << 1) | u16::from(byte & (0x80 >> bit) != 0);
            if divide {
                crc ^= polynomial;
            }
        }
    }

    crc
}

/// CRC of a whole buffer with the SMP serial parameters and padding enabled
pub fn smp_crc16(data: &[u8]) -> u16 {
    crc16(data, 0, data.len(), CRC16_POLYNOMIAL, CRC16_INITIAL, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_value() {
        // CRC-16/XMODEM check value
        assert_eq!(smp_crc16(b"123456789"), 0x31C3);
    }

    #[test]
    fn test_empty_input() {
        assert_eq!(smp_crc16(&[]), 0x0000);
        assert_eq!(crc16(&[], 0, 0, CRC16_POLYNOMIAL, CRC16_INITIAL, false), 0x0000);
    }

    #[test]
    fn test_padding_equals_literal_zeros() {
        let data: Vec<u8> = (0u8..=200).map(|b| b.wrapping_mul(37)).collect();
        let mut padded = data.clone();
        padded.extend_from_slice(&[0, 0]);

        let with_pad = crc16(&data, 0, data.len(), CRC16_POLYNOMIAL, CRC16_INITIAL, true);
        let literal = crc16(&padded, 0, padded.len(), CRC16_POLYNOMIAL, CRC16_INITIAL, false);
        assert_eq!(with_pad, literal);
    }

    #[test]
    fn test_sub_range() {
        let data = b"xx123456789yy";
        assert_eq!(
            crc16(data, 2, 9, CRC16_POLYNOMIAL, CRC16_INITIAL, true),
            smp_crc16(b"123456789")
        );
    }

    #[test]
    fn test_appended_crc_checks_to_zero() {
        let mut data = b"SMP frame body".to_vec();
        let crc = smp_crc16(&data);
        data.extend_from_slice(&crc.to_be_bytes());
        assert_eq!(smp_crc16(&data), 0);
    }

    #[test]
    fn test_deterministic() {
        let data = [0x09, 0x00, 0x00, 0x0A, 0x00, 0x00, 0x01, 0x00];
        assert_eq!(smp_crc16(&data), smp_crc16(&data));
    }
}
