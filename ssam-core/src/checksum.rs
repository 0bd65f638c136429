//! Frame checksums: CRC-16/CCITT-FALSE (poly 0x1021, init 0xFFFF), stored little-endian.

const POLY: u16 = 0x1021;
const INIT: u16 = 0xffff;

const TABLE: [u16; 256] = build_table();

const fn build_table() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = (i as u16) << 8;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ POLY
            } else {
                crc << 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

/// Checksum over `data`.
pub fn crc16(data: &[u8]) -> u16 {
    data.iter().fold(INIT, |crc, &b| {
        (crc << 8) ^ TABLE[usize::from((crc >> 8) as u8 ^ b)]
    })
}

/// Checksum as it appears on the wire.
pub fn crc16_bytes(data: &[u8]) -> [u8; 2] {
    crc16(data).to_le_bytes()
}

/// Verify `data` against a 2-byte wire checksum.
pub fn verify(data: &[u8], wire: [u8; 2]) -> bool {
    crc16(data) == u16::from_le_bytes(wire)
}
