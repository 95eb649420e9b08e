//! Channel mapping setup.
//!
//! A mapping ties the packet machinery together: which floor and residue
//! each channel uses, and which channel pairs are square-polar coupled.
//! Only mapping type 0 exists in the format.

use crate::structs::packet::{BitCursor, ByteSource};
use crate::utils::bits::ilog;
use crate::utils::errors::MappingError;

#[derive(Debug, Clone, Copy)]
pub struct CouplingStep {
    pub magnitude: usize,
    pub angle: usize,
}

/// Floor and residue indices for one submap.
#[derive(Debug, Clone, Copy)]
pub struct Submap {
    pub floor: usize,
    pub residue: usize,
}

#[derive(Debug, Clone)]
pub struct Mapping {
    pub submaps: Vec<Submap>,
    /// Submap index per channel.
    pub channel_submap: Vec<usize>,
    pub coupling_steps: Vec<CouplingStep>,
}

impl Mapping {
    pub fn read<S: ByteSource>(
        reader: &mut BitCursor<S>,
        channels: usize,
        floor_count: usize,
        residue_count: usize,
    ) -> Result<Self, MappingError> {
        let mapping_type = reader.read_bits(16) as u16;
        if mapping_type != 0 {
            return Err(MappingError::UnsupportedType(mapping_type));
        }

        let mut submap_count = 1usize;
        if reader.read_bit() {
            submap_count += reader.read_bits(4) as usize;
        }

        let mut coupling_count = 0usize;
        if reader.read_bit() {
            coupling_count = reader.read_bits(8) as usize + 1;
        }

        let coupling_bits = ilog(channels as u32 - 1);
        let mut coupling_steps = Vec::with_capacity(coupling_count);
        for _ in 0..coupling_count {
            let magnitude = reader.read_bits(coupling_bits) as usize;
            let angle = reader.read_bits(coupling_bits) as usize;
            if magnitude == angle || magnitude > channels - 1 || angle > channels - 1 {
                return Err(MappingError::InvalidCouplingChannel {
                    magnitude: magnitude as u32,
                    angle: angle as u32,
                });
            }
            coupling_steps.push(CouplingStep { magnitude, angle });
        }

        if reader.read_bits(2) != 0 {
            return Err(MappingError::ReservedBitsNonZero);
        }

        let mut mux = vec![0usize; channels];
        if submap_count > 1 {
            for (channel, slot) in mux.iter_mut().enumerate() {
                let value = reader.read_bits(4) as usize;
                if value >= submap_count {
                    return Err(MappingError::InvalidMux {
                        channel,
                        mux: value as u8,
                    });
                }
                *slot = value;
            }
        }

        let mut submaps = Vec::with_capacity(submap_count);
        for _ in 0..submap_count {
            reader.read_bits(8); // unused time configuration placeholder
            let floor = reader.read_bits(8) as usize;
            if floor >= floor_count {
                return Err(MappingError::InvalidSubmapFloor(floor as u8));
            }
            let residue = reader.read_bits(8) as usize;
            if residue >= residue_count {
                return Err(MappingError::InvalidSubmapResidue(residue as u8));
            }
            submaps.push(Submap { floor, residue });
        }

        Ok(Self {
            submaps,
            channel_submap: mux,
            coupling_steps,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structs::packet::{BitWriter, SliceSource};

    #[test]
    fn parses_stereo_coupled_mapping() {
        let mut w = BitWriter::new();
        w.write(0, 16); // type 0
        w.write(0, 1); // single submap
        w.write(1, 1); // coupling present
        w.write(0, 8); // one step
        w.write(0, 1); // magnitude channel 0
        w.write(1, 1); // angle channel 1
        w.write(0, 2); // reserved
        w.write(0, 8); // time placeholder
        w.write(0, 8); // floor 0
        w.write(1, 8); // residue 1
        let data = w.finish();

        let mut reader = BitCursor::new(SliceSource::new(&data));
        let mapping = Mapping::read(&mut reader, 2, 1, 2).unwrap();

        assert_eq!(mapping.submaps.len(), 1);
        assert_eq!(mapping.submaps[0].floor, 0);
        assert_eq!(mapping.submaps[0].residue, 1);
        assert_eq!(mapping.channel_submap, vec![0, 0]);
        assert_eq!(mapping.coupling_steps.len(), 1);
        assert_eq!(mapping.coupling_steps[0].magnitude, 0);
        assert_eq!(mapping.coupling_steps[0].angle, 1);
    }

    #[test]
    fn self_coupled_channel_is_rejected() {
        let mut w = BitWriter::new();
        w.write(0, 16);
        w.write(0, 1);
        w.write(1, 1);
        w.write(0, 8);
        w.write(1, 1); // magnitude == angle
        w.write(1, 1);
        let data = w.finish();

        let mut reader = BitCursor::new(SliceSource::new(&data));
        assert!(matches!(
            Mapping::read(&mut reader, 2, 1, 1),
            Err(MappingError::InvalidCouplingChannel {
                magnitude: 1,
                angle: 1
            })
        ));
    }

    #[test]
    fn reserved_bits_must_be_zero() {
        let mut w = BitWriter::new();
        w.write(0, 16);
        w.write(0, 1);
        w.write(0, 1);
        w.write(3, 2); // reserved
        let data = w.finish();

        let mut reader = BitCursor::new(SliceSource::new(&data));
        assert!(matches!(
            Mapping::read(&mut reader, 2, 1, 1),
            Err(MappingError::ReservedBitsNonZero)
        ));
    }

    #[test]
    fn multiplexed_submaps_validate_bounds() {
        let mut w = BitWriter::new();
        w.write(0, 16);
        w.write(1, 1); // extra submaps
        w.write(1, 4); // 2 submaps total
        w.write(0, 1); // no coupling
        w.write(0, 2); // reserved
        w.write(0, 4); // channel 0 -> submap 0
        w.write(2, 4); // channel 1 -> submap 2 (invalid)
        let data = w.finish();

        let mut reader = BitCursor::new(SliceSource::new(&data));
        assert!(matches!(
            Mapping::read(&mut reader, 2, 1, 1),
            Err(MappingError::InvalidMux {
                channel: 1,
                mux: 2
            })
        ));
    }

    #[test]
    fn unknown_mapping_type_is_rejected() {
        let mut w = BitWriter::new();
        w.write(1, 16);
        let data = w.finish();

        let mut reader = BitCursor::new(SliceSource::new(&data));
        assert!(matches!(
            Mapping::read(&mut reader, 2, 1, 1),
            Err(MappingError::UnsupportedType(1))
        ));
    }
}
