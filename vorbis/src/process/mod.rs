//! Decoding pipeline: source caching, Ogg demultiplexing, per-stream
//! decode, and the top-level file reader.

pub mod cache;
pub mod decode;
pub mod demux;
pub mod reader;
