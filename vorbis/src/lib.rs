#![doc = include_str!("../README.md")]
//!
//! ## Technical Overview
//!
//! Decoder for Vorbis I audio encapsulated in Ogg containers.
//!
//! ### Bitstream Organization
//!
//! **External structure**: Ogg pages carrying lacing-segmented packets for one
//! or more logical streams, identified by serial number.
//! **Internal structure**: three header packets (identification, comments,
//! setup) followed by audio packets decoded through codebooks, floor curves,
//! residue vectors, channel coupling and an inverse MDCT.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use vorbis::process::reader::OggVorbisReader;
//!
//! let mut reader = OggVorbisReader::open("music.ogg")?;
//!
//! let mut buf = vec![0f32; 4096];
//! loop {
//!     let n = reader.read_samples(&mut buf)?;
//!     if n == 0 {
//!         break;
//!     }
//!     // buf[..n] holds channel-interleaved float samples
//! }
//! # Ok::<(), anyhow::Error>(())
//! ```

/// Processing functionality for Ogg Vorbis streams.
///
/// 1. **Caching** ([`process::cache`]): Windowed byte cache over the source.
/// 2. **Demuxing** ([`process::demux`]): Page capture and packet chains.
/// 3. **Decoding** ([`process::decode`]): Per-stream packet decode to PCM.
/// 4. **Reading** ([`process::reader`]): File-level facade.
pub mod process;

/// Data structures representing Ogg and Vorbis format components.
///
/// - **Pages** ([`structs::page`]): Ogg page capture
/// - **Packets** ([`structs::packet`]): Packet arena and bit-level reading
/// - **Headers** ([`structs::header`]): Identification and comments
/// - **Codebooks** ([`structs::codebook`]): Huffman and VQ decode
/// - **Floors** ([`structs::floor`]): Spectral envelope curves
/// - **Residues** ([`structs::residue`]): Spectral fine structure
/// - **Mappings** ([`structs::mapping`]): Submap routing and coupling
/// - **Modes** ([`structs::mode`]): Block size and window selection
pub mod structs;

/// Utility functions and supporting infrastructure.
///
/// - **CRC Validation** ([`utils::crc`]): Page integrity
/// - **Bit Helpers** ([`utils::bits`]): ilog, bit reversal, float unpacking
/// - **Error Handling** ([`utils::errors`]): Error types
/// - **MDCT** ([`utils::mdct`]): Inverse transform
/// - **Ring Buffer** ([`utils::ring`]): Overlap-add sample assembly
/// - **Windows** ([`utils::window`]): Raised-cosine block windows
/// - **Buffer Management** ([`utils::buffer_pool`]): Memory reuse
pub mod utils;
