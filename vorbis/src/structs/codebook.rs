//! Codebook setup and symbol decode.
//!
//! Each codebook carries a canonical Huffman code over its entries plus an
//! optional vector lookup table. Codeword assignment walks the entries in
//! order, handing each one the lowest available code of its length; a length
//! list that overfills the code space is rejected.
//!
//! Decode uses a prefix table covering codes up to [`MAX_TABLE_BITS`] bits,
//! with longer codes on a linear overflow list sorted by length. Codewords
//! are stored bit-reversed so they compare directly against the LSB-first
//! peeked bits.

use crate::structs::packet::{BitCursor, ByteSource};
use crate::utils::bits::{bit_reverse, float32_unpack, ilog, lookup1_values};
use crate::utils::errors::CodebookError;

pub const CODEBOOK_SYNC: u32 = 0x56_4342;

const MAX_TABLE_BITS: u32 = 10;

#[derive(Debug, Clone, Copy)]
struct HuffmanEntry {
    value: u32,
    length: u32,
    bits: u32,
    mask: u32,
}

/// One decoded codebook: Huffman code plus optional VQ lookup vectors.
#[derive(Debug, Clone)]
pub struct Codebook {
    pub dimensions: usize,
    pub entries: usize,
    pub map_type: u8,

    max_bits: u32,
    prefix_bits: u32,
    prefix_table: Vec<Option<HuffmanEntry>>,
    overflow: Vec<HuffmanEntry>,

    lookup_table: Vec<f32>,
}

impl Codebook {
    pub fn read<S: ByteSource>(reader: &mut BitCursor<S>) -> Result<Self, CodebookError> {
        let sync = reader.read_bits(24) as u32;
        if sync != CODEBOOK_SYNC {
            return Err(CodebookError::BadSyncPattern(sync));
        }

        let dimensions = reader.read_bits(16) as usize;
        let entries = reader.read_bits(24) as usize;

        let (lengths, mut sparse, total) = read_lengths(reader, entries);

        let max_bits = lengths.iter().copied().max().unwrap_or(0).max(0) as u32;

        // a mostly-populated sparse book decodes faster densified
        if sparse && total >= entries >> 2 {
            sparse = false;
        }

        let sets = compute_codewords(sparse, &lengths).ok_or(CodebookError::InvalidTree)?;

        let (prefix_bits, prefix_table, overflow) = build_prefix_table(&sets);

        let mut book = Self {
            dimensions,
            entries,
            map_type: 0,
            max_bits,
            prefix_bits,
            prefix_table,
            overflow,
            lookup_table: Vec::new(),
        };
        book.read_lookup_table(reader)?;

        Ok(book)
    }

    fn read_lookup_table<S: ByteSource>(
        &mut self,
        reader: &mut BitCursor<S>,
    ) -> Result<(), CodebookError> {
        let map_type = reader.read_bits(4) as u8;
        self.map_type = map_type;
        if map_type == 0 {
            return Ok(());
        }
        if map_type > 2 {
            return Err(CodebookError::InvalidLookupType(map_type));
        }

        let min_value = float32_unpack(reader.read_u32());
        let delta_value = float32_unpack(reader.read_u32());
        let value_bits = reader.read_bits(4) as u32 + 1;
        let sequence_p = reader.read_bit();

        let lookup_count = if map_type == 1 {
            lookup1_values(self.entries as u32, self.dimensions as u32) as usize
        } else {
            self.entries * self.dimensions
        };

        let mut multiplicands = Vec::with_capacity(lookup_count);
        for _ in 0..lookup_count {
            multiplicands.push(reader.read_bits(value_bits) as u32);
        }

        let mut table = vec![0.0f32; self.entries * self.dimensions];
        if map_type == 1 {
            for idx in 0..self.entries {
                let mut last = 0.0f64;
                let mut idx_div = 1usize;
                for i in 0..self.dimensions {
                    let moff = (idx / idx_div) % lookup_count;
                    let value =
                        multiplicands[moff] as f64 * delta_value as f64 + min_value as f64 + last;
                    table[idx * self.dimensions + i] = value as f32;

                    if sequence_p {
                        last = value;
                    }

                    idx_div *= lookup_count;
                }
            }
        } else {
            for idx in 0..self.entries {
                let mut last = 0.0f64;
                let mut moff = idx * self.dimensions;
                for i in 0..self.dimensions {
                    let value =
                        multiplicands[moff] as f64 * delta_value as f64 + min_value as f64 + last;
                    table[idx * self.dimensions + i] = value as f32;

                    if sequence_p {
                        last = value;
                    }

                    moff += 1;
                }
            }
        }

        self.lookup_table = table;
        Ok(())
    }

    /// Whether this book carries vectors (required by floor 0 and residues).
    pub fn has_lookup(&self) -> bool {
        self.map_type != 0
    }

    /// The vector for one entry. Panics without a lookup table; callers
    /// validate [`Self::has_lookup`] at setup time.
    pub fn vector(&self, entry: usize) -> &[f32] {
        &self.lookup_table[entry * self.dimensions..(entry + 1) * self.dimensions]
    }

    /// Decodes one symbol, or `None` when the bits do not resolve to a
    /// codeword (corrupt packet or end of packet).
    pub fn decode_scalar<S: ByteSource>(&self, reader: &mut BitCursor<S>) -> Option<u32> {
        let (bits, count) = reader.try_peek_bits(self.prefix_bits);
        if count == 0 {
            return None;
        }

        if let Some(entry) = self.prefix_table[bits as usize] {
            if entry.length > count {
                return None;
            }
            reader.skip_bits(entry.length);
            return Some(entry.value);
        }

        // long codeword, walk the overflow list
        let (bits, count) = reader.try_peek_bits(self.max_bits);
        for entry in &self.overflow {
            if entry.length <= count && entry.bits == (bits as u32 & entry.mask) {
                reader.skip_bits(entry.length);
                return Some(entry.value);
            }
        }

        None
    }
}

fn read_lengths<S: ByteSource>(
    reader: &mut BitCursor<S>,
    entries: usize,
) -> (Vec<i32>, bool, usize) {
    let mut lengths = vec![-1i32; entries];
    let mut total = 0usize;

    if reader.read_bit() {
        // ordered: runs of incrementing lengths
        let mut len = reader.read_bits(5) as i32 + 1;
        let mut i = 0;
        while i < entries && !reader.is_short() {
            let count = reader.read_bits(ilog((entries - i) as u32)) as usize;
            for _ in 0..count.min(entries - i) {
                lengths[i] = len;
                i += 1;
            }
            len += 1;
        }
        (lengths, false, entries)
    } else {
        let sparse = reader.read_bit();
        for length in lengths.iter_mut() {
            if !sparse || reader.read_bit() {
                *length = reader.read_bits(5) as i32 + 1;
                total += 1;
            }
        }
        (lengths, sparse, total)
    }
}

struct CodewordSets {
    /// Bit-reversed codewords; indexed by symbol when dense.
    codewords: Vec<u32>,
    lengths: Vec<i32>,
    /// Symbol per position when sparse; dense books use the position itself.
    values: Option<Vec<u32>>,
}

/// Assigns canonical codes front to back, tracking the lowest unused code of
/// each length in `available`. Returns `None` when an entry needs a code but
/// the space is exhausted.
fn compute_codewords(sparse: bool, lengths: &[i32]) -> Option<CodewordSets> {
    let n = lengths.len();
    let mut sets = if sparse {
        CodewordSets {
            codewords: Vec::new(),
            lengths: Vec::new(),
            values: Some(Vec::new()),
        }
    } else {
        CodewordSets {
            codewords: vec![0u32; n],
            lengths: lengths.to_vec(),
            values: None,
        }
    };

    let mut add_entry = |sets: &mut CodewordSets, code: u32, symbol: usize, len: i32| {
        if sparse {
            sets.codewords.push(code);
            sets.lengths.push(len);
            sets.values.as_mut().unwrap().push(symbol as u32);
        } else {
            sets.codewords[symbol] = code;
        }
    };

    let Some(k) = lengths.iter().position(|&len| len > 0) else {
        return Some(sets);
    };

    add_entry(&mut sets, 0, k, lengths[k]);

    // lengths run 1..=32, so index by length directly
    let mut available = [0u32; 33];
    for i in 1..=lengths[k] as usize {
        available[i] = 1u32 << (32 - i);
    }

    for i in k + 1..n {
        let len = lengths[i];
        if len <= 0 {
            continue;
        }

        let mut z = len as usize;
        while z > 0 && available[z] == 0 {
            z -= 1;
        }
        if z == 0 {
            return None;
        }

        let res = available[z];
        available[z] = 0;
        add_entry(&mut sets, bit_reverse(res, 32), i, len);

        if z != len as usize {
            for y in ((z + 1)..=(len as usize)).rev() {
                available[y] = res + (1u32 << (32 - y));
            }
        }
    }

    Some(sets)
}

fn build_prefix_table(sets: &CodewordSets) -> (u32, Vec<Option<HuffmanEntry>>, Vec<HuffmanEntry>) {
    let mut nodes: Vec<HuffmanEntry> = sets
        .lengths
        .iter()
        .enumerate()
        .filter(|&(_, &len)| len > 0)
        .map(|(i, &len)| HuffmanEntry {
            value: sets
                .values
                .as_ref()
                .map(|values| values[i])
                .unwrap_or(i as u32),
            length: len as u32,
            bits: sets.codewords[i],
            mask: u32::MAX >> (32 - len),
        })
        .collect();

    nodes.sort_by_key(|node| (node.length, node.bits));

    let max_len = nodes.last().map(|node| node.length).unwrap_or(0);
    let table_bits = max_len.min(MAX_TABLE_BITS);

    let mut prefix_table: Vec<Option<HuffmanEntry>> = vec![None; 1usize << table_bits];
    let mut overflow = Vec::new();
    for node in nodes {
        if node.length > table_bits {
            overflow.push(node);
        } else {
            // every peeked value whose low bits match the code hits this slot
            let fills = 1usize << (table_bits - node.length);
            for j in 0..fills {
                prefix_table[(j << node.length) | node.bits as usize] = Some(node);
            }
        }
    }

    (table_bits, prefix_table, overflow)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structs::packet::{BitWriter, SliceSource};

    fn write_book_header(w: &mut BitWriter, dimensions: u16, lengths: &[u32]) {
        w.write(CODEBOOK_SYNC as u64, 24);
        w.write(dimensions as u64, 16);
        w.write(lengths.len() as u64, 24);
        w.write(0, 1); // unordered
        w.write(0, 1); // not sparse
        for &len in lengths {
            w.write(len as u64 - 1, 5);
        }
    }

    #[test]
    fn decodes_uniform_code() {
        let mut w = BitWriter::new();
        write_book_header(&mut w, 1, &[2, 2, 2, 2]);
        w.write(0, 4); // no lookup

        // canonical codes, already bit-reversed: 00, 10, 01, 11
        w.write(0b00, 2);
        w.write(0b10, 2);
        w.write(0b01, 2);
        w.write(0b11, 2);
        let data = w.finish();

        let mut reader = BitCursor::new(SliceSource::new(&data));
        let book = Codebook::read(&mut reader).unwrap();
        assert_eq!(book.dimensions, 1);
        assert_eq!(book.entries, 4);
        assert!(!book.has_lookup());

        for expected in 0..4 {
            assert_eq!(book.decode_scalar(&mut reader), Some(expected));
        }

        // the last byte's zero padding reads as the all-zeros codeword
        for _ in 0..3 {
            assert_eq!(book.decode_scalar(&mut reader), Some(0));
        }
        assert_eq!(book.decode_scalar(&mut reader), None);
    }

    #[test]
    fn supports_full_width_codewords() {
        // complete tree over lengths 1..=31 plus two at 32
        let lengths: Vec<u32> = (1..=31).chain([32, 32]).collect();
        let mut w = BitWriter::new();
        write_book_header(&mut w, 1, &lengths);
        w.write(0, 4);
        let data = w.finish();

        let mut reader = BitCursor::new(SliceSource::new(&data));
        let book = Codebook::read(&mut reader).unwrap();
        assert_eq!(book.entries, 33);

        // symbol k's code is k ones then a zero; the final symbol is all ones
        let mut w = BitWriter::new();
        w.write(0, 1);
        w.write((1u64 << 31) - 1, 32);
        w.write(u32::MAX as u64, 32);
        w.write((1u64 << 7) - 1, 8);
        let data = w.finish();
        let mut reader = BitCursor::new(SliceSource::new(&data));
        for &expected in &[0u32, 31, 32, 7] {
            assert_eq!(book.decode_scalar(&mut reader), Some(expected));
        }
    }

    #[test]
    fn long_codes_hit_the_overflow_list() {
        // complete tree with lengths 1..=12, 12: the two longest codes
        // exceed the prefix table and land on the overflow chain
        let lengths: Vec<u32> = (1..=12).chain([12]).collect();
        let mut w = BitWriter::new();
        write_book_header(&mut w, 1, &lengths);
        w.write(0, 4);

        // symbol k's code is k ones then a zero (reversed: ones in the low
        // bits); the final symbol is twelve ones
        for &symbol in &[0u32, 5, 11, 12, 3, 12] {
            if symbol == 12 {
                w.write((1u64 << 12) - 1, 12);
            } else {
                w.write((1u64 << symbol) - 1, symbol + 1);
            }
        }
        let data = w.finish();

        let mut reader = BitCursor::new(SliceSource::new(&data));
        let book = Codebook::read(&mut reader).unwrap();

        for &expected in &[0u32, 5, 11, 12, 3, 12] {
            assert_eq!(book.decode_scalar(&mut reader), Some(expected));
        }
    }

    #[test]
    fn ordered_lengths_round_trip() {
        let mut w = BitWriter::new();
        w.write(CODEBOOK_SYNC as u64, 24);
        w.write(1, 16);
        w.write(4, 24);
        w.write(1, 1); // ordered
        w.write(1, 5); // first length 2
        // two entries at length 2, then two at length 3
        w.write(2, ilog(4));
        w.write(2, ilog(2));
        w.write(0, 4);
        let data = w.finish();

        let mut reader = BitCursor::new(SliceSource::new(&data));
        let book = Codebook::read(&mut reader).unwrap();
        assert_eq!(book.entries, 4);

        // canonical codewords 00, 01, 100, 101; written first-bit-first
        let mut w = BitWriter::new();
        w.write(0b001, 3);
        w.write(0b10, 2);
        w.write(0b101, 3);
        w.write(0b00, 2);
        let data = w.finish();
        let mut reader = BitCursor::new(SliceSource::new(&data));
        for &expected in &[2u32, 1, 3, 0] {
            assert_eq!(book.decode_scalar(&mut reader), Some(expected));
        }
    }

    #[test]
    fn overfull_length_list_is_rejected() {
        // three codes of length 1 cannot fit in the code space
        let mut w = BitWriter::new();
        write_book_header(&mut w, 1, &[1, 1, 1]);
        w.write(0, 4);
        let data = w.finish();

        let mut reader = BitCursor::new(SliceSource::new(&data));
        assert!(matches!(
            Codebook::read(&mut reader),
            Err(CodebookError::InvalidTree)
        ));
    }

    #[test]
    fn sparse_book_skips_unused_entries() {
        let mut w = BitWriter::new();
        w.write(CODEBOOK_SYNC as u64, 24);
        w.write(1, 16);
        w.write(16, 24);
        w.write(0, 1); // unordered
        w.write(1, 1); // sparse
        // only entries 3 and 9 are used, each with a 1-bit code
        for i in 0..16u64 {
            if i == 3 || i == 9 {
                w.write(1, 1);
                w.write(0, 5); // length 1
            } else {
                w.write(0, 1);
            }
        }
        w.write(0, 4);
        let data = w.finish();

        let mut reader = BitCursor::new(SliceSource::new(&data));
        let book = Codebook::read(&mut reader).unwrap();

        let mut w = BitWriter::new();
        w.write(0b0, 1);
        w.write(0b1, 1);
        w.write(0b0, 1);
        let data = w.finish();
        let mut reader = BitCursor::new(SliceSource::new(&data));
        assert_eq!(book.decode_scalar(&mut reader), Some(3));
        assert_eq!(book.decode_scalar(&mut reader), Some(9));
        assert_eq!(book.decode_scalar(&mut reader), Some(3));
    }

    #[test]
    fn lattice_lookup_builds_vectors() {
        let mut w = BitWriter::new();
        write_book_header(&mut w, 2, &[2, 2, 2, 2]);
        w.write(1, 4); // lookup type 1
        w.write(0, 32); // minimum 0.0 in packed float form
        // delta 1.0: exponent field such that mantissa * 2^e = 1
        // packed float: mantissa 1, exponent biased by 788 -> 788 << 21
        w.write(1 | (788u64 << 21), 32);
        w.write(1, 4); // value bits = 2
        w.write(0, 1); // no sequence
        // lookup1_values(4, 2) == 2 multiplicands
        w.write(1, 2);
        w.write(2, 2);
        let data = w.finish();

        let mut reader = BitCursor::new(SliceSource::new(&data));
        let book = Codebook::read(&mut reader).unwrap();
        assert!(book.has_lookup());

        // entry index digits in base 2 select the multiplicand per dimension
        assert_eq!(book.vector(0), &[1.0, 1.0]);
        assert_eq!(book.vector(1), &[2.0, 1.0]);
        assert_eq!(book.vector(2), &[1.0, 2.0]);
        assert_eq!(book.vector(3), &[2.0, 2.0]);
    }

    #[test]
    fn bad_sync_pattern_is_rejected() {
        let mut w = BitWriter::new();
        w.write(0x123456, 24);
        let data = w.finish();

        let mut reader = BitCursor::new(SliceSource::new(&data));
        assert!(matches!(
            Codebook::read(&mut reader),
            Err(CodebookError::BadSyncPattern(0x123456))
        ));
    }
}
