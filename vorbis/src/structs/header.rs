//! Identification and comments header parsing.
//!
//! A Vorbis stream opens with three header packets: identification,
//! comments, then setup. Each begins with a one-byte packet type (1, 3, 5)
//! followed by the six-byte `vorbis` signature.

use crate::structs::packet::{BitCursor, ByteSource};
use crate::utils::errors::HeaderError;

pub const HEADER_TYPE_IDENTIFICATION: u8 = 1;
pub const HEADER_TYPE_COMMENTS: u8 = 3;
pub const HEADER_TYPE_SETUP: u8 = 5;

pub const SIGNATURE: [u8; 6] = *b"vorbis";

/// Consumes and validates the packet type byte and codec signature.
pub fn read_signature<S: ByteSource>(
    reader: &mut BitCursor<S>,
    expected_type: u8,
) -> Result<(), HeaderError> {
    let packet_type = reader.read_u8();
    if packet_type != expected_type {
        return Err(HeaderError::BadPacketType {
            expected: expected_type,
            read: packet_type,
        });
    }

    for expected in SIGNATURE {
        if reader.read_u8() != expected || reader.is_short() {
            return Err(HeaderError::MissingSignature);
        }
    }

    Ok(())
}

/// Stream parameters from the identification header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentificationHeader {
    pub channels: u8,
    pub sample_rate: u32,
    pub bitrate_upper: i32,
    pub bitrate_nominal: i32,
    pub bitrate_lower: i32,
    pub block0_size: usize,
    pub block1_size: usize,
}

impl IdentificationHeader {
    /// Parses the body following the type byte and signature.
    pub fn read<S: ByteSource>(reader: &mut BitCursor<S>) -> Result<Self, HeaderError> {
        let version = reader.read_u32();
        if version != 0 {
            return Err(HeaderError::UnsupportedStreamVersion(version));
        }

        let channels = reader.read_u8();
        if channels == 0 {
            return Err(HeaderError::InvalidChannelCount);
        }

        let sample_rate = reader.read_u32();
        if sample_rate == 0 {
            return Err(HeaderError::InvalidSampleRate);
        }

        let bitrate_upper = reader.read_u32() as i32;
        let mut bitrate_nominal = reader.read_u32() as i32;
        let bitrate_lower = reader.read_u32() as i32;

        let block0_exp = reader.read_bits(4) as u32;
        let block1_exp = reader.read_bits(4) as u32;
        let block0_size = 1usize << block0_exp;
        let block1_size = 1usize << block1_exp;

        // legal sizes are 64 through 8192, short no larger than long
        if !(6..=13).contains(&block0_exp)
            || !(6..=13).contains(&block1_exp)
            || block0_size > block1_size
        {
            return Err(HeaderError::InvalidBlockSize {
                block0: block0_size as u32,
                block1: block1_size as u32,
            });
        }

        if !reader.read_bit() || reader.is_short() {
            return Err(HeaderError::MissingFramingBit);
        }

        if bitrate_nominal == 0 && bitrate_upper > 0 && bitrate_lower > 0 {
            bitrate_nominal = (bitrate_upper + bitrate_lower) / 2;
        }

        Ok(Self {
            channels,
            sample_rate,
            bitrate_upper,
            bitrate_nominal,
            bitrate_lower,
            block0_size,
            block1_size,
        })
    }
}

/// Vendor string and user tag list from the comments header.
#[derive(Debug, Clone, Default)]
pub struct CommentsHeader {
    pub vendor: String,
    pub comments: Vec<String>,
}

impl CommentsHeader {
    pub fn read<S: ByteSource>(reader: &mut BitCursor<S>) -> Result<Self, HeaderError> {
        let vendor = read_string(reader)?;

        let count = reader.read_u32() as usize;
        let mut comments = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            comments.push(read_string(reader)?);
        }

        Ok(Self { vendor, comments })
    }
}

fn read_string<S: ByteSource>(reader: &mut BitCursor<S>) -> Result<String, HeaderError> {
    let len = reader.read_u32() as usize;
    let mut bytes = Vec::with_capacity(len.min(65536));
    for _ in 0..len {
        bytes.push(reader.read_u8());
        if reader.is_short() {
            return Err(HeaderError::TruncatedComments);
        }
    }
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}
