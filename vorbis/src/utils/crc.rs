//! CRC validation for Ogg pages.
//!
//! Ogg uses an unreflected CRC-32 with an all-zero initial value and no final
//! XOR. The checksum covers the whole page with the CRC field itself zeroed.

/// CRC algorithm specification with polynomial and initial value.
pub struct Algorithm<T> {
    poly: T,
    init: T,
}

/// CRC-32 algorithm for Ogg page validation.
pub const CRC_OGG_PAGE_ALG: Algorithm<u32> = Algorithm {
    poly: 0x04c1_1db7,
    init: 0x0000_0000,
};

/// Computes CRC-32 checksum using specified polynomial.
#[inline(always)]
pub const fn crc32(poly: u32, mut value: u32, len: usize) -> u32 {
    value <<= 24;

    let mut i = 0;
    while i < len {
        value = (value << 1) ^ (((value >> 31) & 1) * poly);
        i += 1;
    }

    value
}

#[inline(always)]
const fn crc32_table(poly: u32) -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < table.len() {
        table[i] = crc32(poly, i as u32, 8);
        i += 1;
    }

    table
}

#[derive(Debug)]
pub struct Crc32 {
    pub poly: u32,
    pub init: u32,
    table: [u32; 256],
}

impl Crc32 {
    pub const fn new(algorithm: &Algorithm<u32>) -> Self {
        Self {
            poly: algorithm.poly,
            init: algorithm.init,
            table: crc32_table(algorithm.poly),
        }
    }

    const fn table_entry(&self, index: u32) -> u32 {
        self.table[(index & 0xFF) as usize]
    }

    #[inline(always)]
    pub const fn update(&self, mut crc: u32, bytes: &[u8]) -> u32 {
        let mut i = 0;

        while i < bytes.len() {
            crc = self.table_entry((crc >> 24) ^ bytes[i] as u32) ^ (crc << 8);
            i += 1;
        }

        crc
    }
}

#[test]
fn ogg_page_crc_matches_reference_vector() {
    const CRC: Crc32 = Crc32::new(&CRC_OGG_PAGE_ALG);

    // Bitwise long division over the same message must agree with the
    // table-driven form.
    let msg = b"OggS\x00\x02 sample page header bytes";
    let mut expected = 0u32;
    for &byte in msg.iter() {
        expected ^= (byte as u32) << 24;
        for _ in 0..8 {
            expected = (expected << 1) ^ (((expected >> 31) & 1) * CRC.poly);
        }
    }

    assert_eq!(CRC.update(CRC.init, msg), expected);
}

#[test]
fn crc_detects_single_bit_corruption() {
    const CRC: Crc32 = Crc32::new(&CRC_OGG_PAGE_ALG);

    let msg = b"\x4f\x67\x67\x53\x00\x04\x10\x20\x30\x40";
    let good = CRC.update(CRC.init, msg);

    let mut corrupt = *msg;
    corrupt[6] ^= 0x01;
    assert_ne!(CRC.update(CRC.init, &corrupt), good);
}
