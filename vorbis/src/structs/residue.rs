//! Residue setup and decode.
//!
//! Residues carry the fine spectral detail under the floor curve. All three
//! types share the same partition classification scheme: a class codebook
//! assigns each partition a class, and each class cascades through up to
//! eight value codebooks. The types differ only in how decoded vectors are
//! laid into the output.
//!
//! Type 0 stores dimensions non-interleaved within a partition, type 1
//! interleaves dimensions, and type 2 interleaves samples across channels by
//! treating all channels as one wide vector.

use crate::structs::codebook::Codebook;
use crate::structs::packet::{BitCursor, ByteSource};
use crate::utils::bits::ilog;
use crate::utils::errors::ResidueError;

#[derive(Debug, Clone)]
pub struct Residue {
    residue_type: u8,

    begin: usize,
    end: usize,
    partition_size: usize,
    class_book: usize,
    cascade: Vec<u32>,
    /// Per class, the value book for each cascade stage.
    books: Vec<Vec<Option<usize>>>,
    max_stages: usize,
    /// Class-number digits for each class codebook entry.
    decode_map: Vec<Vec<usize>>,

    buffers: Vec<Vec<f32>>,
    entry_cache: Vec<u32>,
    part_word_cache: Vec<Vec<Option<usize>>>,
}

impl Residue {
    pub fn read<S: ByteSource>(
        reader: &mut BitCursor<S>,
        channels: usize,
        block1_size: usize,
        books: &[Codebook],
    ) -> Result<Self, ResidueError> {
        let residue_type = reader.read_bits(16) as u16;
        if residue_type > 2 {
            return Err(ResidueError::UnsupportedType(residue_type));
        }

        let begin = reader.read_bits(24) as usize;
        let end = reader.read_bits(24) as usize;
        let partition_size = reader.read_bits(24) as usize + 1;
        let classifications = reader.read_bits(6) as usize + 1;
        let class_book_num = reader.read_bits(8) as usize;
        let class_book = books
            .get(class_book_num)
            .ok_or(ResidueError::InvalidClassbook(class_book_num as u8))?;
        if class_book.dimensions == 0 {
            return Err(ResidueError::ZeroDimensionBook(class_book_num as u8));
        }

        let mut cascade = Vec::with_capacity(classifications);
        let mut acc = 0usize;
        for _ in 0..classifications {
            let low_bits = reader.read_bits(3) as u32;
            let bits = if reader.read_bit() {
                (reader.read_bits(5) as u32) << 3 | low_bits
            } else {
                low_bits
            };
            acc += bits.count_ones() as usize;
            cascade.push(bits);
        }

        let mut book_nums = Vec::with_capacity(acc);
        for _ in 0..acc {
            let num = reader.read_bits(8) as usize;
            let book = books.get(num).ok_or(ResidueError::InvalidBook(num as u8))?;
            if !book.has_lookup() {
                return Err(ResidueError::MissingLookup(num as u8));
            }
            // partition_size / dimensions must be well defined at decode time
            if book.dimensions == 0 {
                return Err(ResidueError::ZeroDimensionBook(num as u8));
            }
            book_nums.push(num);
        }

        let entries = class_book.entries;
        let mut partvals = 1u64;
        for _ in 0..class_book.dimensions {
            partvals *= classifications as u64;
            if partvals > entries as u64 {
                return Err(ResidueError::PartitionOverflow {
                    partvals,
                    entries: entries as u32,
                });
            }
        }
        let partvals = partvals as usize;

        let mut stage_books = Vec::with_capacity(classifications);
        let mut acc = 0usize;
        let mut max_stages = 0usize;
        for &bits in &cascade {
            let stages = ilog(bits) as usize;
            max_stages = max_stages.max(stages);
            let mut row = vec![None; stages];
            for (k, slot) in row.iter_mut().enumerate() {
                if bits & (1 << k) != 0 {
                    *slot = Some(book_nums[acc]);
                    acc += 1;
                }
            }
            stage_books.push(row);
        }

        let dims = class_book.dimensions;
        let mut decode_map = Vec::with_capacity(partvals);
        for j in 0..partvals {
            let mut val = j;
            let mut mult = partvals / classifications;
            let mut row = Vec::with_capacity(dims);
            for _ in 0..dims {
                let deco = val / mult;
                val -= deco * mult;
                if mult >= classifications {
                    mult /= classifications;
                }
                row.push(deco);
            }
            decode_map.push(row);
        }

        let max_part_words =
            (end.saturating_sub(begin) / partition_size + dims - 1) / dims;

        Ok(Self {
            residue_type: residue_type as u8,
            begin,
            end,
            partition_size,
            class_book: class_book_num,
            cascade,
            books: stage_books,
            max_stages,
            decode_map,
            buffers: vec![vec![0.0; block1_size]; channels],
            entry_cache: vec![0; partition_size],
            part_word_cache: vec![vec![None; max_part_words]; channels],
        })
    }

    /// Decodes one packet's residue vectors, one row per channel. Corrupt
    /// data stops decode early and leaves whatever was recovered.
    pub fn decode<S: ByteSource>(
        &mut self,
        reader: &mut BitCursor<S>,
        do_not_decode: &[bool],
        channels: usize,
        block_size: usize,
        books: &[Codebook],
    ) -> &[Vec<f32>] {
        for buffer in self.buffers.iter_mut().take(do_not_decode.len()) {
            buffer.fill(0.0);
        }

        // type 2 decodes as one wide channel and de-interleaves on write
        let (decode_channels, decode_block_size) = if self.residue_type == 2 {
            (1, block_size * channels)
        } else {
            (channels, block_size)
        };

        let end = self.end.min(decode_block_size / 2);
        let n = end as i64 - self.begin as i64;

        if n > 0 && do_not_decode.iter().any(|&skip| !skip) {
            let part_vals = n as usize / self.partition_size;
            let dims = books[self.class_book].dimensions;
            let part_words = (part_vals + dims - 1) / dims;
            for cache in self.part_word_cache.iter_mut().take(decode_channels) {
                cache[..part_words].fill(None);
            }

            'stages: for s in 0..self.max_stages {
                let mut i = 0;
                let mut l = 0;
                while i < part_vals {
                    if s == 0 {
                        for j in 0..decode_channels {
                            match books[self.class_book].decode_scalar(reader) {
                                Some(idx) if (idx as usize) < self.decode_map.len() => {
                                    self.part_word_cache[j][l] = Some(idx as usize);
                                }
                                _ => break 'stages,
                            }
                        }
                    }
                    let mut k = 0;
                    while i < part_vals && k < dims {
                        let offset = self.begin + i * self.partition_size;
                        for j in 0..decode_channels {
                            let Some(map_idx) = self.part_word_cache[j][l] else {
                                break 'stages;
                            };
                            let idx = self.decode_map[map_idx][k];
                            if self.cascade[idx] & (1 << s) != 0 {
                                if let Some(book_idx) = self.books[idx][s] {
                                    if self.write_vectors(
                                        &books[book_idx],
                                        reader,
                                        j,
                                        offset,
                                        channels,
                                    ) {
                                        // bad packet, use what we already have
                                        break 'stages;
                                    }
                                }
                            }
                        }
                        k += 1;
                        i += 1;
                    }
                    l += 1;
                }
            }
        }

        &self.buffers[..do_not_decode.len()]
    }

    fn write_vectors<S: ByteSource>(
        &mut self,
        book: &Codebook,
        reader: &mut BitCursor<S>,
        channel: usize,
        offset: usize,
        channels: usize,
    ) -> bool {
        match self.residue_type {
            0 => {
                let step = self.partition_size / book.dimensions;
                for slot in self.entry_cache.iter_mut().take(step) {
                    match book.decode_scalar(reader) {
                        Some(entry) => *slot = entry,
                        None => return true,
                    }
                }
                let res = &mut self.buffers[channel];
                let mut offset = offset;
                for i in 0..book.dimensions {
                    for j in 0..step {
                        res[offset] += book.vector(self.entry_cache[j] as usize)[i];
                        offset += 1;
                    }
                }
                false
            }
            1 => {
                let res = &mut self.buffers[channel];
                let mut i = 0;
                while i < self.partition_size {
                    let Some(entry) = book.decode_scalar(reader) else {
                        return true;
                    };
                    for &value in book.vector(entry as usize) {
                        res[offset + i] += value;
                        i += 1;
                    }
                }
                false
            }
            _ => {
                let mut ch = 0;
                let mut offset = offset / channels;
                let mut c = 0;
                while c < self.partition_size {
                    let Some(entry) = book.decode_scalar(reader) else {
                        return true;
                    };
                    for &value in book.vector(entry as usize) {
                        self.buffers[ch][offset] += value;
                        ch += 1;
                        if ch == channels {
                            ch = 0;
                            offset += 1;
                        }
                        c += 1;
                    }
                }
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structs::codebook::CODEBOOK_SYNC;
    use crate::structs::packet::{BitWriter, SliceSource};

    // two entries with 1-bit codes, no lookup
    fn class_book() -> Codebook {
        let mut w = BitWriter::new();
        w.write(CODEBOOK_SYNC as u64, 24);
        w.write(1, 16);
        w.write(2, 24);
        w.write(0, 1);
        w.write(0, 1);
        w.write(0, 5);
        w.write(0, 5);
        w.write(0, 4);
        let data = w.finish();
        Codebook::read(&mut BitCursor::new(SliceSource::new(&data))).unwrap()
    }

    // dims 2, four entries with 2-bit codes, lattice over {1.0, 2.0}
    fn value_book() -> Codebook {
        let mut w = BitWriter::new();
        w.write(CODEBOOK_SYNC as u64, 24);
        w.write(2, 16);
        w.write(4, 24);
        w.write(0, 1);
        w.write(0, 1);
        for _ in 0..4 {
            w.write(1, 5);
        }
        w.write(1, 4);
        w.write(0, 32);
        w.write(1 | (788u64 << 21), 32);
        w.write(1, 4);
        w.write(0, 1);
        w.write(1, 2);
        w.write(2, 2);
        let data = w.finish();
        Codebook::read(&mut BitCursor::new(SliceSource::new(&data))).unwrap()
    }

    fn write_setup(w: &mut BitWriter, residue_type: u8) {
        w.write(residue_type as u64, 16);
        w.write(0, 24); // begin
        w.write(8, 24); // end
        w.write(3, 24); // partition size 4
        w.write(1, 6); // 2 classifications
        w.write(0, 8); // class book 0
        // class 0: no stages; class 1: stage 0 only
        w.write(0, 3);
        w.write(0, 1);
        w.write(1, 3);
        w.write(0, 1);
        w.write(1, 8); // value book 1
    }

    #[test]
    fn type0_decodes_partitioned_vectors() {
        let books = vec![class_book(), value_book()];

        let mut w = BitWriter::new();
        write_setup(&mut w, 0);
        let data = w.finish();
        let mut reader = BitCursor::new(SliceSource::new(&data));
        let mut residue = Residue::read(&mut reader, 1, 16, &books).unwrap();

        // partition 0 is class 1 (decoded), partition 1 is class 0 (silent)
        let mut w = BitWriter::new();
        w.write(1, 1); // class word: partition 0 -> class 1
        w.write(0b00, 2); // entry 0 -> [1, 1]
        w.write(0b10, 2); // entry 1 -> [2, 1]
        w.write(0, 1); // class word: partition 1 -> class 0
        let packet = w.finish();
        let mut reader = BitCursor::new(SliceSource::new(&packet));

        let out = residue.decode(&mut reader, &[false], 1, 16, &books);
        // non-interleaved: both first dimensions, then both second
        assert_eq!(&out[0][..8], &[1.0, 2.0, 1.0, 1.0, 0.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn type1_interleaves_dimensions() {
        let books = vec![class_book(), value_book()];

        let mut w = BitWriter::new();
        write_setup(&mut w, 1);
        let data = w.finish();
        let mut reader = BitCursor::new(SliceSource::new(&data));
        let mut residue = Residue::read(&mut reader, 1, 16, &books).unwrap();

        let mut w = BitWriter::new();
        w.write(1, 1);
        w.write(0b00, 2);
        w.write(0b10, 2);
        w.write(0, 1);
        let packet = w.finish();
        let mut reader = BitCursor::new(SliceSource::new(&packet));

        let out = residue.decode(&mut reader, &[false], 1, 16, &books);
        assert_eq!(&out[0][..8], &[1.0, 1.0, 2.0, 1.0, 0.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn type2_interleaves_channels() {
        let books = vec![class_book(), value_book()];

        let mut w = BitWriter::new();
        write_setup(&mut w, 2);
        let data = w.finish();
        let mut reader = BitCursor::new(SliceSource::new(&data));
        let mut residue = Residue::read(&mut reader, 2, 16, &books).unwrap();

        let mut w = BitWriter::new();
        w.write(1, 1);
        w.write(0b00, 2);
        w.write(0b10, 2);
        w.write(0, 1);
        let packet = w.finish();
        let mut reader = BitCursor::new(SliceSource::new(&packet));

        let out = residue.decode(&mut reader, &[false, false], 2, 8, &books);
        assert_eq!(&out[0][..4], &[1.0, 2.0, 0.0, 0.0]);
        assert_eq!(&out[1][..4], &[1.0, 1.0, 0.0, 0.0]);
    }

    #[test]
    fn empty_packet_leaves_silence() {
        let books = vec![class_book(), value_book()];

        let mut w = BitWriter::new();
        write_setup(&mut w, 0);
        let data = w.finish();
        let mut reader = BitCursor::new(SliceSource::new(&data));
        let mut residue = Residue::read(&mut reader, 1, 16, &books).unwrap();

        // the first class word cannot be decoded, so decode stops cleanly
        let mut reader = BitCursor::new(SliceSource::new(&[]));
        let out = residue.decode(&mut reader, &[false], 1, 16, &books);
        assert!(out[0].iter().all(|&v| v == 0.0));
    }

    #[test]
    fn overfull_classification_is_rejected() {
        // the class book has 2 entries but dims 2 over 2 classes needs 4
        let mut w = BitWriter::new();
        w.write(CODEBOOK_SYNC as u64, 24);
        w.write(2, 16);
        w.write(2, 24);
        w.write(0, 1);
        w.write(0, 1);
        w.write(0, 5);
        w.write(0, 5);
        w.write(0, 4);
        let data = w.finish();
        let wide_class_book =
            Codebook::read(&mut BitCursor::new(SliceSource::new(&data))).unwrap();
        let books = vec![wide_class_book];

        let mut w = BitWriter::new();
        w.write(0, 16);
        w.write(0, 24);
        w.write(8, 24);
        w.write(3, 24);
        w.write(1, 6);
        w.write(0, 8);
        let data = w.finish();
        let mut reader = BitCursor::new(SliceSource::new(&data));
        assert!(matches!(
            Residue::read(&mut reader, 1, 16, &books),
            Err(ResidueError::PartitionOverflow {
                partvals: 4,
                entries: 2
            })
        ));
    }

    #[test]
    fn zero_dimension_value_book_is_rejected() {
        // dims 0 with an explicit (type 2) lookup parses as a codebook, zero
        // multiplicands and all, but cannot partition residue vectors
        let mut w = BitWriter::new();
        w.write(CODEBOOK_SYNC as u64, 24);
        w.write(0, 16);
        w.write(2, 24);
        w.write(0, 1);
        w.write(0, 1);
        w.write(0, 5);
        w.write(0, 5);
        w.write(2, 4);
        w.write(0, 32);
        w.write(1 | (788u64 << 21), 32);
        w.write(0, 4);
        w.write(0, 1);
        let data = w.finish();
        let degenerate =
            Codebook::read(&mut BitCursor::new(SliceSource::new(&data))).unwrap();
        let books = vec![class_book(), degenerate];

        let mut w = BitWriter::new();
        write_setup(&mut w, 0);
        let data = w.finish();
        let mut reader = BitCursor::new(SliceSource::new(&data));
        assert!(matches!(
            Residue::read(&mut reader, 1, 16, &books),
            Err(ResidueError::ZeroDimensionBook(1))
        ));
    }

    #[test]
    fn unknown_type_is_rejected() {
        let mut w = BitWriter::new();
        w.write(3, 16);
        let data = w.finish();
        let mut reader = BitCursor::new(SliceSource::new(&data));
        assert!(matches!(
            Residue::read(&mut reader, 1, 16, &[]),
            Err(ResidueError::UnsupportedType(3))
        ));
    }
}
