//! Small bit-level helpers shared across the decoder.

/// Number of bits needed to represent `x`, with `ilog(0) == 0`.
#[inline(always)]
pub const fn ilog(mut x: u32) -> u32 {
    let mut cnt = 0;
    while x > 0 {
        cnt += 1;
        x >>= 1;
    }
    cnt
}

/// Reverses the low `bits` bits of `n`.
#[inline(always)]
pub const fn bit_reverse(mut n: u32, bits: u32) -> u32 {
    n = ((n & 0xAAAA_AAAA) >> 1) | ((n & 0x5555_5555) << 1);
    n = ((n & 0xCCCC_CCCC) >> 2) | ((n & 0x3333_3333) << 2);
    n = ((n & 0xF0F0_F0F0) >> 4) | ((n & 0x0F0F_0F0F) << 4);
    n = ((n & 0xFF00_FF00) >> 8) | ((n & 0x00FF_00FF) << 8);
    ((n >> 16) | (n << 16)) >> (32 - bits)
}

/// Decodes the packed 32-bit float used by codebook minimum/delta values.
///
/// Layout: 1 sign bit, 10 exponent bits biased by 788, 21 mantissa bits.
pub fn float32_unpack(bits: u32) -> f32 {
    let sign = (bits as i32) >> 31;
    let exponent = ((bits & 0x7fe0_0000) >> 21) as i32 - 788;
    let mantissa = ((((bits & 0x1f_ffff) as i32) ^ sign) + (sign & 1)) as f32;

    // The exponent field allows far more range than f32 holds; going through
    // f64 keeps extreme-but-legal headers from misbehaving.
    mantissa * (2.0f64.powi(exponent) as f32)
}

/// Largest `r` such that `r.pow(dimensions) <= entries`, for lattice lookups.
pub fn lookup1_values(entries: u32, dimensions: u32) -> u32 {
    let mut r = ((entries as f64).ln() / dimensions as f64).exp().floor() as u32;
    if ((r + 1) as f64).powi(dimensions as i32).floor() as u32 <= entries {
        r += 1;
    }
    r
}

/// Clamps a sample into (-1.0, 1.0), latching `clipped` when it fires.
///
/// IEEE 754 singles order by magnitude when the sign bit is masked off, so a
/// single integer compare covers both directions. Full scale is 0.99999994
/// rather than 1.0 as a courtesy to 16/24-bit output stages.
#[inline(always)]
pub fn clip_sample(value: f32, clipped: &mut bool) -> f32 {
    let mut bits = value.to_bits();

    if (bits & 0x7FFF_FFFF) > 0x3f7f_ffff {
        *clipped = true;
        bits = 0x3f7f_ffff | (bits & 0x8000_0000);
    }
    f32::from_bits(bits)
}

#[test]
fn ilog_matches_definition() {
    assert_eq!(ilog(0), 0);
    assert_eq!(ilog(1), 1);
    assert_eq!(ilog(2), 2);
    assert_eq!(ilog(3), 2);
    assert_eq!(ilog(4), 3);
    assert_eq!(ilog(7), 3);
    assert_eq!(ilog(255), 8);
    assert_eq!(ilog(256), 9);
}

#[test]
fn bit_reverse_round_trips() {
    assert_eq!(bit_reverse(0b001, 3), 0b100);
    assert_eq!(bit_reverse(0b1101, 4), 0b1011);
    for n in 0..64u32 {
        assert_eq!(bit_reverse(bit_reverse(n, 6), 6), n);
    }
}

#[test]
fn float32_unpack_known_values() {
    // 1.0: mantissa 1, exponent bias exactly cancelled.
    assert_eq!(float32_unpack(1 | (788 << 21)), 1.0);
    // -1.0 is the same with the sign bit set.
    assert_eq!(float32_unpack(1 | (788 << 21) | 0x8000_0000), -1.0);
    // 0.5 drops the exponent by one.
    assert_eq!(float32_unpack(1 | (787 << 21)), 0.5);
    assert_eq!(float32_unpack(0), 0.0);
}

#[test]
fn lookup1_values_is_maximal() {
    assert_eq!(lookup1_values(8, 3), 2);
    assert_eq!(lookup1_values(27, 3), 3);
    assert_eq!(lookup1_values(26, 3), 2);
    assert_eq!(lookup1_values(1, 1), 1);
}

#[test]
fn clip_sample_clamps_and_latches() {
    let mut clipped = false;
    assert_eq!(clip_sample(0.25, &mut clipped), 0.25);
    assert!(!clipped);

    let v = clip_sample(1.5, &mut clipped);
    assert!(clipped);
    assert!(v < 1.0 && v > 0.9999);

    let v = clip_sample(-2.0, &mut clipped);
    assert!(v > -1.0 && v < -0.9999);
}
