//! Packet records and the bit-level packet reader.
//!
//! Vorbis packs fields LSB-first: the first bit of a packet is the least
//! significant bit of its first byte. [`BitCursor`] maintains a 64-bit
//! accumulator plus one overflow byte so a full 64-bit peek is always
//! non-destructive, and it degrades gracefully at end of packet by returning
//! the bits that exist and latching a short flag instead of failing.
//!
//! Packet payload bytes stay in the stream cache; a [`PacketEntry`] records
//! where they live as `(offset, len)` fragments, merged across page
//! continuations. Entries live in a per-stream arena indexed by handle, so
//! ordering is positional and nothing carries linked-list pointers.

/// Index of a packet within its stream's arena.
pub type PacketHandle = usize;

/// One logical packet: location, page bookkeeping, and granule annotations.
#[derive(Debug, Clone)]
pub struct PacketEntry {
    /// Byte runs in the cache, one per page fragment.
    pub fragments: Vec<(u64, usize)>,

    pub page_granule_position: i64,
    pub page_sequence_number: u32,

    pub is_resync: bool,
    /// Set while the final fragment has not arrived yet.
    pub is_continued: bool,
    pub is_continuation: bool,
    pub is_end_of_stream: bool,

    /// Granule position of the last sample in this packet, once known.
    pub granule_position: Option<i64>,
    /// Samples this packet contributes, once known.
    pub granule_count: Option<i64>,
}

impl PacketEntry {
    pub fn len(&self) -> usize {
        self.fragments.iter().map(|&(_, len)| len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Offset just past the last byte of the packet.
    pub fn end_offset(&self) -> u64 {
        self.fragments
            .last()
            .map(|&(off, len)| off + len as u64)
            .unwrap_or(0)
    }
}

/// Byte supplier for a [`BitCursor`].
pub trait ByteSource {
    /// Returns the next payload byte, or `None` at end of packet.
    fn next_byte(&mut self) -> Option<u8>;
}

/// In-memory source, used for header sub-parses and tests.
pub struct SliceSource<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> SliceSource<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }
}

impl ByteSource for SliceSource<'_> {
    fn next_byte(&mut self) -> Option<u8> {
        let b = self.data.get(self.pos).copied();
        if b.is_some() {
            self.pos += 1;
        }
        b
    }
}

/// LSB-first bit reader over a [`ByteSource`].
pub struct BitCursor<S> {
    source: S,

    bit_bucket: u64,
    bit_count: u32,
    overflow_bits: u8,

    bits_read: u64,
    is_short: bool,
}

impl<S: ByteSource> BitCursor<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            bit_bucket: 0,
            bit_count: 0,
            overflow_bits: 0,
            bits_read: 0,
            is_short: false,
        }
    }

    /// Bits consumed so far (peeked bits do not count).
    pub fn bits_read(&self) -> u64 {
        self.bits_read
    }

    /// Whether a read ever ran past the end of the packet.
    pub fn is_short(&self) -> bool {
        self.is_short
    }

    /// Returns up to `count` bits without consuming them.
    ///
    /// At end of packet the available shorter value is returned along with
    /// its actual bit count, and the short flag latches.
    pub fn try_peek_bits(&mut self, mut count: u32) -> (u64, u32) {
        assert!(count <= 64, "cannot peek more than 64 bits");
        if count == 0 {
            return (0, 0);
        }

        while self.bit_count < count {
            let Some(val) = self.source.next_byte() else {
                count = self.bit_count;
                self.is_short = true;
                break;
            };
            self.bit_bucket |= (val as u64) << self.bit_count;
            self.bit_count += 8;

            if self.bit_count > 64 {
                self.overflow_bits = val >> (72 - self.bit_count);
            }
        }

        let mut value = self.bit_bucket;
        if count < 64 {
            value &= (1u64 << count) - 1;
        }

        (value, count)
    }

    pub fn skip_bits(&mut self, count: u32) {
        if count == 0 {
            // no-op
        } else if self.bit_count > count {
            if count > 63 {
                self.bit_bucket = 0;
            } else {
                self.bit_bucket >>= count;
            }
            if self.bit_count > 64 {
                let overflow_count = self.bit_count - 64;
                self.bit_bucket |= (self.overflow_bits as u64)
                    << (self.bit_count - count - overflow_count);
                if overflow_count > count {
                    self.overflow_bits >>= count;
                }
            }
            self.bit_count -= count;
            self.bits_read += count as u64;
        } else if self.bit_count == count {
            self.bit_bucket = 0;
            self.bit_count = 0;
            self.bits_read += count as u64;
        } else {
            // draining past the accumulator
            let mut count = count - self.bit_count;
            self.bits_read += self.bit_count as u64;
            self.bit_count = 0;
            self.bit_bucket = 0;

            while count >= 8 {
                if self.source.next_byte().is_none() {
                    count = 0;
                    self.is_short = true;
                    break;
                }
                count -= 8;
                self.bits_read += 8;
            }

            // count is now 1..=7, the rest of one more byte
            if count > 0 {
                match self.source.next_byte() {
                    None => self.is_short = true,
                    Some(temp) => {
                        self.bit_bucket = (temp >> count) as u64;
                        self.bit_count = 8 - count;
                        self.bits_read += count as u64;
                    }
                }
            }
        }
    }

    /// Reads `count` bits (0..=64); short reads return the bits that exist.
    pub fn read_bits(&mut self, count: u32) -> u64 {
        assert!(count <= 64, "cannot read more than 64 bits");
        if count == 0 {
            return 0;
        }

        let (value, actual) = self.try_peek_bits(count);
        self.skip_bits(actual);
        value
    }

    pub fn read_bit(&mut self) -> bool {
        self.read_bits(1) == 1
    }

    pub fn read_u8(&mut self) -> u8 {
        self.read_bits(8) as u8
    }

    pub fn read_u16(&mut self) -> u16 {
        self.read_bits(16) as u16
    }

    pub fn read_u32(&mut self) -> u32 {
        self.read_bits(32) as u32
    }
}

/// LSB-first bit writer for building synthetic packets in tests.
#[cfg(test)]
#[derive(Default)]
pub(crate) struct BitWriter {
    bytes: Vec<u8>,
    bit: u32,
}

#[cfg(test)]
impl BitWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write(&mut self, value: u64, count: u32) {
        for i in 0..count {
            if self.bit == 0 {
                self.bytes.push(0);
            }
            let bit = ((value >> i) & 1) as u8;
            *self.bytes.last_mut().unwrap() |= bit << self.bit;
            self.bit = (self.bit + 1) % 8;
        }
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.write(b as u64, 8);
        }
    }

    pub fn finish(self) -> Vec<u8> {
        self.bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern(len: usize) -> Vec<u8> {
        // simple LCG, deterministic
        let mut state = 0x2545_F491u32;
        (0..len)
            .map(|_| {
                state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
                (state >> 24) as u8
            })
            .collect()
    }

    // naive reference: pull bits one at a time, LSB-first
    struct NaiveBits<'a> {
        data: &'a [u8],
        pos: usize,
    }

    impl NaiveBits<'_> {
        fn read(&mut self, count: u32) -> (u64, u32) {
            let mut value = 0u64;
            let mut got = 0;
            for i in 0..count {
                let byte = self.pos / 8;
                if byte >= self.data.len() {
                    break;
                }
                let bit = (self.data[byte] >> (self.pos % 8)) & 1;
                if i < 64 {
                    value |= (bit as u64) << i;
                }
                self.pos += 1;
                got = i + 1;
            }
            (value, got)
        }
    }

    #[test]
    fn bits_come_out_lsb_first() {
        let data = [0b1011_0100u8, 0b0000_1111];
        let mut cursor = BitCursor::new(SliceSource::new(&data));

        assert_eq!(cursor.read_bits(3), 0b100);
        assert_eq!(cursor.read_bits(5), 0b10110);
        assert_eq!(cursor.read_bits(4), 0b1111);
        assert_eq!(cursor.read_bits(4), 0b0000);
        assert_eq!(cursor.bits_read(), 16);
        assert!(!cursor.is_short());
    }

    #[test]
    fn peek_is_non_destructive_for_all_widths() {
        let data = pattern(32);

        for count in 0..=64u32 {
            let mut peeker = BitCursor::new(SliceSource::new(&data));
            let mut reader = BitCursor::new(SliceSource::new(&data));

            let (peeked, n) = peeker.try_peek_bits(count);
            assert_eq!(n, count);
            peeker.skip_bits(n);

            let read = reader.read_bits(count);
            assert_eq!(peeked, read, "width {count}");

            // both cursors must agree on everything that follows
            assert_eq!(peeker.read_bits(33), reader.read_bits(33), "width {count}");
        }
    }

    #[test]
    fn matches_naive_reader_over_mixed_widths() {
        let data = pattern(512);
        let mut cursor = BitCursor::new(SliceSource::new(&data));
        let mut naive = NaiveBits {
            data: &data,
            pos: 0,
        };

        let widths = [1, 7, 64, 3, 12, 24, 64, 5, 1, 1, 9, 33, 63, 2, 17, 8];
        for (i, &w) in widths.iter().cycle().take(200).enumerate() {
            let got = cursor.read_bits(w);
            let (want, n) = naive.read(w);
            assert_eq!(n, w, "step {i} ran short");
            assert_eq!(got, want, "step {i} width {w}");
        }
    }

    #[test]
    fn skipping_matches_naive_reader() {
        let data = pattern(64);
        let mut cursor = BitCursor::new(SliceSource::new(&data));
        let mut naive = NaiveBits {
            data: &data,
            pos: 0,
        };

        let ops: [(bool, u32); 12] = [
            (true, 5),
            (false, 11),
            (true, 64),
            (false, 64),
            (true, 1),
            (false, 3),
            (true, 31),
            (false, 70),
            (true, 17),
            (false, 1),
            (true, 62),
            (false, 9),
        ];
        for (i, &(read, w)) in ops.iter().enumerate() {
            if read {
                let got = cursor.read_bits(w.min(64));
                let (want, _) = naive.read(w.min(64));
                assert_eq!(got, want, "step {i}");
            } else {
                cursor.skip_bits(w);
                naive.read(w);
            }
        }
    }

    #[test]
    fn skips_whole_bytes_past_the_accumulator() {
        // spans that drain the bucket and end on a byte boundary
        for extra in [8u32, 16, 24, 64] {
            let data = pattern(48);
            let mut cursor = BitCursor::new(SliceSource::new(&data));
            let mut naive = NaiveBits {
                data: &data,
                pos: 0,
            };

            // fill the bucket so the skip has to reach into the source
            assert_eq!(cursor.read_bits(6), naive.read(6).0);
            cursor.skip_bits(58 + extra);
            naive.read(58 + extra);

            assert_eq!(cursor.read_bits(32), naive.read(32).0, "extra {extra}");
            assert_eq!(cursor.bits_read(), (96 + extra) as u64);
        }
    }

    #[test]
    fn short_packet_returns_partial_bits() {
        let data = [0xFFu8, 0x01];
        let mut cursor = BitCursor::new(SliceSource::new(&data));

        let (value, count) = cursor.try_peek_bits(24);
        assert_eq!(count, 16);
        assert_eq!(value, 0x01FF);
        assert!(cursor.is_short());

        // reading still consumes what exists
        assert_eq!(cursor.read_bits(24), 0x01FF);
        assert_eq!(cursor.bits_read(), 16);

        // and everything past the end is zero
        assert_eq!(cursor.read_bits(8), 0);
    }

    #[test]
    fn bits_read_counts_consumed_only() {
        let data = pattern(16);
        let mut cursor = BitCursor::new(SliceSource::new(&data));

        cursor.try_peek_bits(64);
        assert_eq!(cursor.bits_read(), 0);

        cursor.read_bits(13);
        cursor.skip_bits(6);
        assert_eq!(cursor.bits_read(), 19);
    }

    #[test]
    fn entry_length_sums_fragments() {
        let entry = PacketEntry {
            fragments: vec![(100, 255), (400, 255), (700, 13)],
            page_granule_position: -1,
            page_sequence_number: 2,
            is_resync: false,
            is_continued: false,
            is_continuation: false,
            is_end_of_stream: false,
            granule_position: None,
            granule_count: None,
        };

        assert_eq!(entry.len(), 523);
        assert_eq!(entry.end_offset(), 713);
    }
}
