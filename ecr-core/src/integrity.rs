//! Integrity: 16-bit frame CRC over the unescaped logical bytes.

/// Fold one byte into the CRC register. All arithmetic stays in 16 bits.
pub fn crc16_update(crc: u16, byte: u8) -> u16 {
    let mut crc = crc.swap_bytes();
    crc ^= u16::from(byte);
    crc ^= (crc & 0xFF) >> 4;
    crc ^= (crc << 8) << 4;
    crc ^= ((crc & 0xFF) << 4) << 1;
    crc
}

/// CRC of a logical byte sequence (register starts at 0).
pub fn crc16(bytes: &[u8]) -> u16 {
    bytes.iter().fold(0, |crc, &b| crc16_update(crc, b))
}

/// CRC as transmitted: high byte first.
pub fn crc16_bytes(bytes: &[u8]) -> [u8; 2] {
    crc16(bytes).to_be_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_is_zero() {
        assert_eq!(crc16(&[]), 0);
    }

    #[test]
    fn check_value() {
        // Same register walk as CRC-16/XMODEM, so the usual check string applies.
        assert_eq!(crc16(b"123456789"), 0x31C3);
    }

    #[test]
    fn single_escape_byte() {
        assert_eq!(crc16(&[0x10]), 0x1231);
    }

    #[test]
    fn deterministic() {
        let data = b"\x01\x91{\"StatusResponse\":{\"TrmStatus\":1}}\n";
        assert_eq!(crc16(data), crc16(data));
        assert_eq!(crc16_bytes(data), crc16(data).to_be_bytes());
    }

    #[test]
    fn single_bit_flip_changes_crc() {
        let data = b"\x07\x11{\"ReceiptRequest\":{\"ReceiptType\":1}}\n".to_vec();
        let reference = crc16(&data);
        for i in 0..data.len() {
            for bit in 0..8 {
                let mut flipped = data.clone();
                flipped[i] ^= 1 << bit;
                assert_ne!(crc16(&flipped), reference, "byte {} bit {}", i, bit);
            }
        }
    }
}
