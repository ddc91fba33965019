//! CRC-16/CCITT
//!
//! Used to protect CV bank transfers. Polynomial `0x1021`, initial value
//! `0xFFFF`, processed most significant bit first, no final XOR.

const POLY: u16 = 0x1021;
const INIT: u16 = 0xFFFF;

/// Calculate the CRC-16/CCITT of `data`
pub fn crc16_ccitt(data: &[u8]) -> u16 {
    data.iter().fold(INIT, |crc, &b| update(crc, b))
}

fn update(mut crc: u16, byte: u8) -> u16 {
    crc ^= u16::from(byte) << 8;
    for _ in 0..8 {
        if crc & 0x8000 != 0 {
            crc = (crc << 1) ^ POLY;
        } else {
            crc <<= 1;
        }
    }
    crc
}
