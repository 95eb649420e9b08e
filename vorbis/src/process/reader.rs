//! Top-level file reader.
//!
//! [`OggVorbisReader`] ties the demuxer and one decoder per audio stream
//! together behind a single sample-oriented interface. Most files carry a
//! single stream; multiplexed and chained files expose the rest through
//! [`OggVorbisReader::stream_count`] and [`OggVorbisReader::switch_streams`].

use std::fs::File;
use std::io::{Read, Seek};
use std::path::Path;

use log::Level;

use crate::utils::bits::clip_sample;
use crate::utils::errors::{SeekError, VorbisError};

use super::cache::StreamCache;
use super::decode::{StreamDecoder, StreamStats};
use super::demux::Demuxer;

pub struct OggVorbisReader {
    demuxer: Demuxer,
    decoders: Vec<StreamDecoder>,
    stream_idx: usize,
    probed: usize,
    clip_samples: bool,
}

impl OggVorbisReader {
    /// Opens a file from disk with seeking enabled.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, VorbisError> {
        Self::new(File::open(path)?)
    }

    /// Wraps a seekable source.
    pub fn new(source: impl Read + Seek + Send + 'static) -> Result<Self, VorbisError> {
        let cache = StreamCache::new_seekable(source).map_err(|e| match e {
            crate::utils::errors::CacheError::Io(io) => VorbisError::Io(io),
            other => VorbisError::Packet(other.into()),
        })?;
        Self::from_cache(cache)
    }

    /// Wraps a forward-only source. Seeking and total-length queries are
    /// unavailable in this mode.
    pub fn new_streaming(source: impl Read + Send + 'static) -> Result<Self, VorbisError> {
        Self::from_cache(StreamCache::new_streaming(source))
    }

    fn from_cache(cache: StreamCache) -> Result<Self, VorbisError> {
        let mut reader = Self {
            demuxer: Demuxer::new(cache),
            decoders: Vec::new(),
            stream_idx: 0,
            probed: 0,
            clip_samples: true,
        };

        if !reader.demuxer.init()? {
            return Err(VorbisError::InvalidContainer);
        }
        reader.discover_streams()?;
        if reader.decoders.is_empty() {
            return Err(VorbisError::NoStreamsFound);
        }
        Ok(reader)
    }

    /// Probes container streams found since the last call, keeping the
    /// ones that complete a Vorbis header handshake.
    fn discover_streams(&mut self) -> Result<bool, VorbisError> {
        let mut added = false;
        while self.probed < self.demuxer.stream_count() {
            let stream = self.probed;
            self.probed += 1;
            match StreamDecoder::try_init(&mut self.demuxer, stream)? {
                Some(decoder) => {
                    self.decoders.push(decoder);
                    added = true;
                }
                None => self.demuxer.ignore_stream(stream),
            }
        }
        Ok(added)
    }

    fn active(&self) -> &StreamDecoder {
        &self.decoders[self.stream_idx]
    }

    // ---- stream properties ----

    pub fn channels(&self) -> usize {
        self.active().channels()
    }

    pub fn sample_rate(&self) -> u32 {
        self.active().sample_rate()
    }

    pub fn upper_bitrate(&self) -> i32 {
        self.active().upper_bitrate()
    }

    pub fn nominal_bitrate(&self) -> i32 {
        self.active().nominal_bitrate()
    }

    pub fn lower_bitrate(&self) -> i32 {
        self.active().lower_bitrate()
    }

    pub fn vendor(&self) -> &str {
        self.active().vendor()
    }

    pub fn comments(&self) -> &[String] {
        self.active().comments()
    }

    /// Whether samples are clamped to [-1, 1] on the way out. On by
    /// default.
    pub fn clip_samples(&self) -> bool {
        self.clip_samples
    }

    pub fn set_clip_samples(&mut self, clip: bool) {
        self.clip_samples = clip;
    }

    pub fn stream_count(&self) -> usize {
        self.decoders.len()
    }

    pub fn stream_index(&self) -> usize {
        self.stream_idx
    }

    pub fn stats(&self) -> &StreamStats {
        &self.active().stats
    }

    /// Log level at or below which recoverable decode problems become
    /// hard errors. Applies to every stream.
    pub fn set_fail_level(&mut self, level: Level) {
        for decoder in &mut self.decoders {
            decoder.fail_level = level;
        }
    }

    pub fn reset_stats(&mut self) {
        self.decoders[self.stream_idx].stats.reset();
    }

    pub fn effective_bit_rate(&self) -> u64 {
        self.active().effective_bit_rate()
    }

    pub fn instant_bit_rate(&self) -> Option<u64> {
        self.active().instant_bit_rate()
    }

    /// Container framing bits charged to the active stream.
    pub fn container_overhead_bits(&self) -> u64 {
        self.demuxer.container_bits(self.active().stream())
    }

    pub fn pages_read(&self) -> usize {
        self.active().pages_read()
    }

    pub fn total_pages(&mut self) -> Result<u64, VorbisError> {
        let stream = self.active().stream();
        Ok(self.demuxer.get_total_page_count(stream)?)
    }

    // ---- parameter changes ----

    pub fn is_parameter_change(&self) -> bool {
        self.active().is_parameter_change()
    }

    /// Acknowledges a pending parameter change so reads may continue.
    pub fn clear_parameter_change(&mut self) {
        self.decoders[self.stream_idx].clear_parameter_change();
    }

    // ---- multiple streams ----

    /// Scans forward for another logical stream, returning whether a new
    /// decodable one appeared.
    pub fn find_next_stream(&mut self) -> Result<bool, VorbisError> {
        self.demuxer.find_next_stream()?;
        self.discover_streams()
    }

    /// Switches decoding to another stream. Returns `true` when the new
    /// stream's channel count or sample rate differs, in which case the
    /// caller must reconfigure its output path.
    pub fn switch_streams(&mut self, index: usize) -> Result<bool, VorbisError> {
        if index >= self.decoders.len() {
            return Err(VorbisError::InvalidStreamIndex(index));
        }
        if index == self.stream_idx {
            return Ok(false);
        }

        let old = &self.decoders[self.stream_idx];
        let new = &self.decoders[index];
        let format_changed =
            old.channels() != new.channels() || old.sample_rate() != new.sample_rate();
        self.stream_idx = index;
        Ok(format_changed)
    }

    // ---- samples ----

    /// Fills `buffer` with interleaved samples from the active stream.
    ///
    /// A short count means end of stream or a pending parameter change.
    pub fn read_samples(&mut self, buffer: &mut [f32]) -> Result<usize, VorbisError> {
        let decoder = &mut self.decoders[self.stream_idx];
        let count = decoder.read_samples(&mut self.demuxer, buffer)?;

        if self.clip_samples {
            for sample in &mut buffer[..count] {
                *sample = clip_sample(*sample, &mut decoder.stats.clipped);
            }
        }
        Ok(count)
    }

    /// Sample position of the next sample [`read_samples`] will return.
    ///
    /// [`read_samples`]: OggVorbisReader::read_samples
    pub fn position(&self) -> i64 {
        self.active().position()
    }

    pub fn position_seconds(&self) -> f64 {
        self.position() as f64 / self.sample_rate() as f64
    }

    /// Seeks the active stream to an absolute sample position.
    pub fn seek(&mut self, sample: i64) -> Result<(), VorbisError> {
        let decoder = &mut self.decoders[self.stream_idx];
        decoder.seek_to(&mut self.demuxer, sample)?;
        Ok(())
    }

    pub fn seek_seconds(&mut self, seconds: f64) -> Result<(), VorbisError> {
        let sample = (seconds * self.sample_rate() as f64) as i64;
        self.seek(sample)
    }

    /// Total length of the active stream in samples.
    pub fn total_samples(&mut self) -> Result<i64, VorbisError> {
        if !self.demuxer.can_seek() {
            return Err(VorbisError::Seek(SeekError::Unseekable));
        }
        let decoder = &mut self.decoders[self.stream_idx];
        Ok(decoder.last_granule_position(&mut self.demuxer)?)
    }

    pub fn total_seconds(&mut self) -> Result<f64, VorbisError> {
        Ok(self.total_samples()? as f64 / self.sample_rate() as f64)
    }
}
