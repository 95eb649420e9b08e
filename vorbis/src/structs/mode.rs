//! Mode setup.
//!
//! A mode selects the block size and mapping for an audio packet, and owns
//! the precomputed lapped windows. Long-block modes carry four window
//! shapes, one per combination of neighboring block sizes; short-block
//! modes need only one.

use crate::structs::packet::{BitCursor, ByteSource};
use crate::utils::errors::DecodeError;
use crate::utils::window::build_windows;

#[derive(Debug, Clone)]
pub struct Mode {
    pub block_flag: bool,
    pub block_size: usize,
    pub mapping: usize,

    windows: Vec<Vec<f32>>,
}

impl Mode {
    pub fn read<S: ByteSource>(
        reader: &mut BitCursor<S>,
        block0_size: usize,
        block1_size: usize,
        mapping_count: usize,
    ) -> Result<Self, DecodeError> {
        let block_flag = reader.read_bit();
        let window_type = reader.read_bits(16) as u16;
        let transform_type = reader.read_bits(16) as u16;
        let mapping = reader.read_bits(8) as usize;

        if window_type != 0 {
            return Err(DecodeError::UnsupportedWindowType(window_type));
        }
        if transform_type != 0 {
            return Err(DecodeError::UnsupportedTransformType(transform_type));
        }
        if mapping >= mapping_count {
            return Err(DecodeError::InvalidMapping(mapping as u8));
        }

        Ok(Self {
            block_flag,
            block_size: if block_flag { block1_size } else { block0_size },
            mapping,
            windows: build_windows(block_flag, block0_size, block1_size),
        })
    }

    /// The window for this block given its neighbors' block flags.
    pub fn window(&self, prev: bool, next: bool) -> &[f32] {
        if self.block_flag {
            if next {
                if prev {
                    return &self.windows[3];
                }
                return &self.windows[2];
            } else if prev {
                return &self.windows[1];
            }
        }
        &self.windows[0]
    }
}
