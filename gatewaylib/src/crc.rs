//! CRC helpers shared by the frame codec and the GPS-A collector.
//!
//! D-Star headers and GPS-A payloads both use CRC-16/CCITT-FALSE:
//! polynomial 0x1021, initial value 0xFFFF, no reflection, no final
//! XOR. `crc_any`'s `crc16ccitt_false` constructor is exactly this
//! variant.

/// Computes the CCITT-16 CRC used by D-Star headers and GPS-A frames.
pub fn ccitt16(data: &[u8]) -> u16 {
    let mut crc = crc_any::CRC::crc16ccitt_false();
    crc.digest(data);
    crc.get_crc() as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_vector() {
        // Standard CRC-16/CCITT-FALSE check value for the ASCII string "123456789".
        assert_eq!(ccitt16(b"123456789"), 0x29B1);
    }
}
