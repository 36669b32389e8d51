//! CRC-16 for MODBUS RTU frames.
//!
//! Polynomial 0xA001 (0x8005 reflected), initial value 0xFFFF, processed
//! byte by byte with right shifts. The accumulator is byte-swapped before
//! returning: MODBUS puts the CRC low byte first on the wire, so a caller
//! appending the returned value high-byte-then-low-byte produces the
//! correct on-wire order.

/// Calculate the MODBUS CRC-16 of `data`, byte-swapped for hi-then-lo framing.
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for byte in data {
        crc ^= *byte as u16;
        for _ in 0..8 {
            if (crc & 0x0001) != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc.swap_bytes()
}
