//! Per-stream decoder: header handshake, packet decode, and sample
//! assembly.
//!
//! A [`StreamDecoder`] owns everything learned from the three header
//! packets plus the lapping state for audio decode. It does not own the
//! demuxer; every operation that needs more packets borrows it, so any
//! number of decoders can share one container.
//!
//! Granule bookkeeping runs two ways: decoded sample counts are written
//! back onto packet entries as they are learned, and after a resync the
//! decoder queues packets until a page granule anchors them again.

use std::collections::VecDeque;

use log::Level;

use crate::log_or_err;
use crate::structs::codebook::Codebook;
use crate::structs::floor::{Floor, FloorData};
use crate::structs::header::{
    self, CommentsHeader, HEADER_TYPE_COMMENTS, HEADER_TYPE_IDENTIFICATION, HEADER_TYPE_SETUP,
    IdentificationHeader, SIGNATURE,
};
use crate::structs::mapping::Mapping;
use crate::structs::mode::Mode;
use crate::structs::packet::PacketHandle;
use crate::structs::residue::Residue;
use crate::utils::bits::ilog;
use crate::utils::errors::{DecodeError, HeaderError, SeekError};
use crate::utils::mdct::Mdct;
use crate::utils::ring::RingBuffer;

use super::demux::{Demuxer, Packet};

/// Bit accounting across the life of a stream.
#[derive(Debug, Default, Clone)]
pub struct StreamStats {
    pub glue_bits: u64,
    pub meta_bits: u64,
    pub book_bits: u64,
    pub time_hdr_bits: u64,
    pub floor_hdr_bits: u64,
    pub res_hdr_bits: u64,
    pub map_hdr_bits: u64,
    pub mode_hdr_bits: u64,
    pub waste_hdr_bits: u64,

    pub mode_bits: u64,
    pub floor_bits: u64,
    pub res_bits: u64,
    pub waste_bits: u64,

    pub samples: i64,
    pub packet_count: u64,
    pub clipped: bool,
}

impl StreamStats {
    /// Bits spent on actual audio payload.
    pub fn audio_bits(&self) -> u64 {
        self.book_bits
            + self.floor_hdr_bits
            + self.res_hdr_bits
            + self.map_hdr_bits
            + self.mode_hdr_bits
            + self.mode_bits
            + self.floor_bits
            + self.res_bits
    }

    /// Bits spent on framing and metadata, given the container's share.
    pub fn overhead_bits(&self, container_bits: u64) -> u64 {
        self.glue_bits
            + self.meta_bits
            + self.time_hdr_bits
            + self.waste_hdr_bits
            + self.waste_bits
            + container_bits
    }

    /// Clears the per-session counters, keeping header accounting.
    pub fn reset(&mut self) {
        self.clipped = false;
        self.packet_count = 0;
        self.glue_bits = 0;
        self.mode_bits = 0;
        self.floor_bits = 0;
        self.res_bits = 0;
        self.waste_bits = 0;
        self.samples = 0;
    }
}

/// What an audio packet header said about itself.
struct AudioInfo {
    mode_idx: usize,
    prev_flag: bool,
    next_flag: bool,
    bits_read: u64,
}

pub struct StreamDecoder {
    stream: usize,

    channels: usize,
    sample_rate: u32,
    bitrate_upper: i32,
    bitrate_nominal: i32,
    bitrate_lower: i32,
    block0_size: usize,
    block1_size: usize,
    vendor: String,
    comments: Vec<String>,

    books: Vec<Codebook>,
    floors: Vec<Floor>,
    residues: Vec<Residue>,
    maps: Vec<Mapping>,
    modes: Vec<Mode>,
    mode_field_bits: u32,

    mdct_short: Mdct,
    mdct_long: Mdct,
    mdct_scratch: Vec<f32>,

    floor_datas: Vec<FloorData>,
    no_execute: Vec<bool>,
    residue_out: Vec<Vec<f32>>,

    prev_buffer: Option<Vec<f32>>,
    output: RingBuffer,
    prepared_length: usize,
    bits_per_packet_history: VecDeque<u64>,
    sample_count_history: VecDeque<i64>,

    resync_queue: Vec<PacketHandle>,
    current_position: i64,
    reported_position: i64,
    eos_found: bool,
    is_parameter_change: bool,

    pages_seen: Vec<u32>,
    last_page_seen: Option<u32>,

    pub stats: StreamStats,
    /// Messages at or below this level become hard errors.
    pub fail_level: Level,
}

impl StreamDecoder {
    /// Attempts the three-packet header handshake on a freshly discovered
    /// stream.
    ///
    /// `Ok(None)` means the first packet is not an identification header,
    /// so the stream belongs to some other codec. A stream that starts
    /// correctly but breaks off mid-handshake is an error.
    pub fn try_init(demuxer: &mut Demuxer, stream: usize) -> Result<Option<Self>, DecodeError> {
        let Some(first) = demuxer.peek_next_packet(stream).map_err(DecodeError::Packet)? else {
            return Ok(None);
        };

        let mut decoder = Self::empty(stream);
        if !decoder.process_stream_header(&first)? {
            return Ok(None);
        }
        drop(first);
        if let Some(consumed) = demuxer.get_next_packet(stream).map_err(DecodeError::Packet)? {
            demuxer.finish_packet(consumed);
        }

        let packet = demuxer
            .get_next_packet(stream)
            .map_err(DecodeError::Packet)?
            .ok_or(DecodeError::HeadersNotComplete)?;
        if !decoder.load_comments(&packet)? {
            return Err(DecodeError::HeadersNotComplete);
        }
        demuxer.finish_packet(packet);

        let packet = demuxer
            .get_next_packet(stream)
            .map_err(DecodeError::Packet)?
            .ok_or(DecodeError::HeadersNotComplete)?;
        if !decoder.load_books(&packet)? {
            return Err(DecodeError::HeadersNotComplete);
        }
        demuxer.finish_packet(packet);

        decoder.init_decoder();
        Ok(Some(decoder))
    }

    fn empty(stream: usize) -> Self {
        Self {
            stream,
            channels: 0,
            sample_rate: 0,
            bitrate_upper: 0,
            bitrate_nominal: 0,
            bitrate_lower: 0,
            block0_size: 0,
            block1_size: 0,
            vendor: String::new(),
            comments: Vec::new(),
            books: Vec::new(),
            floors: Vec::new(),
            residues: Vec::new(),
            maps: Vec::new(),
            modes: Vec::new(),
            mode_field_bits: 0,
            mdct_short: Mdct::new(64),
            mdct_long: Mdct::new(64),
            mdct_scratch: Vec::new(),
            floor_datas: Vec::new(),
            no_execute: Vec::new(),
            residue_out: Vec::new(),
            prev_buffer: None,
            output: RingBuffer::new(2, 1),
            prepared_length: 0,
            bits_per_packet_history: VecDeque::new(),
            sample_count_history: VecDeque::new(),
            resync_queue: Vec::new(),
            current_position: 0,
            reported_position: 0,
            eos_found: false,
            is_parameter_change: false,
            pages_seen: Vec::new(),
            last_page_seen: None,
            stats: StreamStats::default(),
            fail_level: Level::Error,
        }
    }

    pub fn stream(&self) -> usize {
        self.stream
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn upper_bitrate(&self) -> i32 {
        self.bitrate_upper
    }

    pub fn nominal_bitrate(&self) -> i32 {
        self.bitrate_nominal
    }

    pub fn lower_bitrate(&self) -> i32 {
        self.bitrate_lower
    }

    pub fn vendor(&self) -> &str {
        &self.vendor
    }

    pub fn comments(&self) -> &[String] {
        &self.comments
    }

    /// Sample position of the next sample to be returned.
    pub fn position(&self) -> i64 {
        self.reported_position
    }

    pub fn is_parameter_change(&self) -> bool {
        self.is_parameter_change
    }

    /// Acknowledges a parameter change so reads may continue.
    pub fn clear_parameter_change(&mut self) {
        self.is_parameter_change = false;
    }

    /// Distinct pages visited so far.
    pub fn pages_read(&self) -> usize {
        match self.last_page_seen {
            Some(seq) => self
                .pages_seen
                .iter()
                .position(|&s| s == seq)
                .map_or(0, |i| i + 1),
            None => 0,
        }
    }

    /// Average payload bitrate over everything decoded so far.
    pub fn effective_bit_rate(&self) -> u64 {
        if self.stats.samples == 0 {
            return 0;
        }
        let decoded_seconds =
            (self.current_position - self.prepared_length as i64) as f64 / self.sample_rate as f64;
        if decoded_seconds <= 0.0 {
            return 0;
        }
        (self.stats.audio_bits() as f64 / decoded_seconds) as u64
    }

    /// Payload bitrate over roughly the last second of decoded audio.
    pub fn instant_bit_rate(&self) -> Option<u64> {
        let samples: i64 = self.sample_count_history.iter().sum();
        if samples > 0 {
            let bits: u64 = self.bits_per_packet_history.iter().sum();
            Some(bits * self.sample_rate as u64 / samples as u64)
        } else {
            None
        }
    }

    /// Granule position of the stream's last page.
    pub fn last_granule_position(&self, demuxer: &mut Demuxer) -> Result<i64, DecodeError> {
        demuxer
            .get_granule_count(self.stream)
            .map_err(DecodeError::Packet)
    }

    // ---- header decode ----

    fn note_page(&mut self, sequence: u32) {
        if !self.pages_seen.contains(&sequence) {
            self.pages_seen.push(sequence);
        }
        self.last_page_seen = Some(sequence);
    }

    fn process_stream_header(&mut self, packet: &Packet) -> Result<bool, DecodeError> {
        let mut reader = packet.reader();
        if header::read_signature(&mut reader, HEADER_TYPE_IDENTIFICATION).is_err() {
            // not ours; bill the whole packet to glue
            self.stats.glue_bits += 8 * packet.len() as u64;
            return Ok(false);
        }

        self.note_page(packet.page_sequence_number);
        self.stats.glue_bits += 56;
        let start = reader.bits_read();

        let ident = IdentificationHeader::read(&mut reader).map_err(DecodeError::Header)?;
        self.channels = ident.channels as usize;
        self.sample_rate = ident.sample_rate;
        self.bitrate_upper = ident.bitrate_upper;
        self.bitrate_nominal = ident.bitrate_nominal;
        self.bitrate_lower = ident.bitrate_lower;
        self.block0_size = ident.block0_size;
        self.block1_size = ident.block1_size;

        self.stats.meta_bits += reader.bits_read() - start + 8;
        self.stats.waste_hdr_bits += (8 * packet.len() as u64).saturating_sub(reader.bits_read());
        Ok(true)
    }

    fn load_comments(&mut self, packet: &Packet) -> Result<bool, DecodeError> {
        let mut reader = packet.reader();
        if header::read_signature(&mut reader, HEADER_TYPE_COMMENTS).is_err() {
            return Ok(false);
        }

        self.note_page(packet.page_sequence_number);
        self.stats.glue_bits += 56;

        let comments = CommentsHeader::read(&mut reader).map_err(DecodeError::Header)?;
        self.vendor = comments.vendor;
        self.comments = comments.comments;

        self.stats.meta_bits += reader.bits_read() - 56;
        self.stats.waste_hdr_bits += (8 * packet.len() as u64).saturating_sub(reader.bits_read());
        Ok(true)
    }

    fn load_books(&mut self, packet: &Packet) -> Result<bool, DecodeError> {
        let mut reader = packet.reader();
        if header::read_signature(&mut reader, HEADER_TYPE_SETUP).is_err() {
            return Ok(false);
        }

        self.note_page(packet.page_sequence_number);
        let mut bits = reader.bits_read();
        self.stats.glue_bits += bits;

        let book_count = reader.read_u8() as usize + 1;
        let mut books = Vec::with_capacity(book_count);
        for _ in 0..book_count {
            books.push(Codebook::read(&mut reader).map_err(DecodeError::Codebook)?);
        }
        self.books = books;
        self.stats.book_bits += reader.bits_read() - bits;
        bits = reader.bits_read();

        // time backends were never specified beyond the zero placeholder
        let time_count = reader.read_bits(6) as usize + 1;
        for index in 0..time_count {
            let value = reader.read_bits(16) as u16;
            if value != 0 {
                return Err(HeaderError::TimePlaceholderNonZero { index, value }.into());
            }
        }
        self.stats.time_hdr_bits += reader.bits_read() - bits;
        bits = reader.bits_read();

        let floor_count = reader.read_bits(6) as usize + 1;
        let mut floors = Vec::with_capacity(floor_count);
        for _ in 0..floor_count {
            floors.push(
                Floor::read(&mut reader, self.block0_size, self.block1_size, &self.books)
                    .map_err(DecodeError::Floor)?,
            );
        }
        self.floors = floors;
        self.stats.floor_hdr_bits += reader.bits_read() - bits;
        bits = reader.bits_read();

        let residue_count = reader.read_bits(6) as usize + 1;
        let mut residues = Vec::with_capacity(residue_count);
        for _ in 0..residue_count {
            residues.push(
                Residue::read(&mut reader, self.channels, self.block1_size, &self.books)
                    .map_err(DecodeError::Residue)?,
            );
        }
        self.residues = residues;
        self.stats.res_hdr_bits += reader.bits_read() - bits;
        bits = reader.bits_read();

        let map_count = reader.read_bits(6) as usize + 1;
        let mut maps = Vec::with_capacity(map_count);
        for _ in 0..map_count {
            maps.push(
                Mapping::read(
                    &mut reader,
                    self.channels,
                    self.floors.len(),
                    self.residues.len(),
                )
                .map_err(DecodeError::Mapping)?,
            );
        }
        self.maps = maps;
        self.stats.map_hdr_bits += reader.bits_read() - bits;
        bits = reader.bits_read();

        let mode_count = reader.read_bits(6) as usize + 1;
        let mut modes = Vec::with_capacity(mode_count);
        for _ in 0..mode_count {
            modes.push(Mode::read(
                &mut reader,
                self.block0_size,
                self.block1_size,
                self.maps.len(),
            )?);
        }
        self.modes = modes;
        self.stats.mode_hdr_bits += reader.bits_read() - bits;

        if !reader.read_bit() || reader.is_short() {
            return Err(HeaderError::MissingFramingBit.into());
        }
        self.stats.glue_bits += 1;
        self.stats.waste_hdr_bits += (8 * packet.len() as u64).saturating_sub(reader.bits_read());

        self.mode_field_bits = ilog(self.modes.len() as u32 - 1);
        Ok(true)
    }

    fn init_decoder(&mut self) {
        self.current_position = 0;
        self.reported_position = 0;
        self.resync_queue.clear();
        self.bits_per_packet_history.clear();
        self.sample_count_history.clear();
        self.reset_decoder(true);
    }

    /// Full reset rebuilds the channel buffers for new parameters; a light
    /// reset only drops lapping state after a seek or data hiccup.
    fn reset_decoder(&mut self, full_reset: bool) {
        if self.prepared_length > 0 {
            self.save_buffer();
        }
        if full_reset {
            self.no_execute = vec![false; self.channels];
            self.floor_datas = Vec::with_capacity(self.channels);
            self.residue_out = vec![vec![0.0; self.block1_size]; self.channels];
            self.output = RingBuffer::new(self.block1_size * 2 * self.channels, self.channels);
            self.mdct_short = Mdct::new(self.block0_size);
            self.mdct_long = Mdct::new(self.block1_size);
        } else {
            self.output.clear();
        }
        self.prepared_length = 0;
    }

    /// Parks finished samples aside so a reset does not lose them.
    fn save_buffer(&mut self) {
        let mut buf = vec![0f32; self.prepared_length * self.channels];
        self.output.copy_to(&mut buf);
        self.prepared_length = 0;
        self.reported_position = self.current_position;
        self.prev_buffer = Some(buf);
    }

    // ---- data decode ----

    /// Header packets showing up mid-stream announce a parameter change.
    fn is_header_packet(packet: &Packet) -> bool {
        let data = packet.data();
        data.len() >= 7
            && matches!(
                data[0],
                HEADER_TYPE_IDENTIFICATION | HEADER_TYPE_COMMENTS | HEADER_TYPE_SETUP
            )
            && data[1..7] == SIGNATURE
    }

    /// Re-runs whichever header packets the stream supplies, then resets.
    fn process_parameter_change(
        &mut self,
        demuxer: &mut Demuxer,
        packet: Packet,
    ) -> Result<(), DecodeError> {
        let mut full_reset = false;
        let mut was_peek = false;

        let mut current = packet;
        if self.process_stream_header(&current)? {
            full_reset = true;
            was_peek = true;
            demuxer.finish_packet(current);
            current = demuxer
                .peek_next_packet(self.stream)
                .map_err(DecodeError::Packet)?
                .ok_or(DecodeError::HeadersNotComplete)?;
        }

        if self.load_comments(&current)? {
            if was_peek {
                if let Some(consumed) =
                    demuxer.get_next_packet(self.stream).map_err(DecodeError::Packet)?
                {
                    demuxer.finish_packet(consumed);
                }
            } else {
                demuxer.finish_packet(current);
            }
            was_peek = true;
            current = demuxer
                .peek_next_packet(self.stream)
                .map_err(DecodeError::Packet)?
                .ok_or(DecodeError::HeadersNotComplete)?;
        }

        if self.load_books(&current)? {
            if was_peek {
                if let Some(consumed) =
                    demuxer.get_next_packet(self.stream).map_err(DecodeError::Packet)?
                {
                    demuxer.finish_packet(consumed);
                }
            } else {
                demuxer.finish_packet(current);
            }
        }

        self.reset_decoder(full_reset);
        Ok(())
    }

    /// Parses the packet header, floor curves, and residue vectors.
    ///
    /// `Ok(None)` marks the packet as undecodable; its bits count as waste.
    fn unpack_packet(&mut self, packet: &Packet) -> Result<Option<AudioInfo>, DecodeError> {
        let mut reader = packet.reader();
        if reader.read_bit() {
            return Ok(None);
        }

        let mut mode_bits = self.mode_field_bits as u64 + 1;
        let mode_idx = reader.read_bits(self.mode_field_bits) as usize;
        if mode_idx >= self.modes.len() {
            log_or_err!(
                self,
                Level::Warn,
                DecodeError::InvalidMode(mode_idx)
            );
            return Ok(None);
        }
        let (prev_flag, next_flag) = if self.modes[mode_idx].block_flag {
            mode_bits += 2;
            (reader.read_bit(), reader.read_bit())
        } else {
            (false, false)
        };

        if reader.is_short() {
            return Ok(None);
        }

        let block_size = self.modes[mode_idx].block_size;
        let half = block_size / 2;
        let map_idx = self.modes[mode_idx].mapping;
        let channels = self.channels;
        let start_bits = reader.bits_read();

        let Self {
            maps,
            floors,
            residues,
            books,
            floor_datas,
            no_execute,
            residue_out,
            ..
        } = &mut *self;
        let mapping = &maps[map_idx];

        // floor curves first; residue buffers cleared alongside
        floor_datas.clear();
        for ch in 0..channels {
            let floor = &floors[mapping.submaps[mapping.channel_submap[ch]].floor];
            let mut data = floor.create_data();
            floor.unpack(&mut reader, block_size, &mut data, books);
            no_execute[ch] = !data.execute_channel();
            floor_datas.push(data);
            residue_out[ch][..half].fill(0.0);
        }

        // a coupled pair decodes if either half carries energy
        for step in &mapping.coupling_steps {
            if floor_datas[step.angle].execute_channel()
                || floor_datas[step.magnitude].execute_channel()
            {
                floor_datas[step.angle].force_energy = true;
                floor_datas[step.magnitude].force_energy = true;
            }
        }

        let floor_bits = reader.bits_read() - start_bits;
        let res_start = reader.bits_read();

        for (submap_idx, submap) in mapping.submaps.iter().enumerate() {
            for ch in 0..channels {
                if mapping.channel_submap[ch] != submap_idx {
                    floor_datas[ch].force_no_energy = true;
                }
            }

            let decoded =
                residues[submap.residue].decode(&mut reader, no_execute, channels, block_size, books);
            for ch in 0..channels {
                let out = &mut residue_out[ch];
                for (slot, value) in out[..half].iter_mut().zip(&decoded[ch][..half]) {
                    *slot += value;
                }
            }
        }

        self.stats.glue_bits += 1;
        self.stats.mode_bits += mode_bits - 1;
        self.stats.floor_bits += floor_bits;
        self.stats.res_bits += reader.bits_read() - res_start;
        self.stats.waste_bits += (8 * packet.len() as u64).saturating_sub(reader.bits_read());
        self.stats.packet_count += 1;

        Ok(Some(AudioInfo {
            mode_idx,
            prev_flag,
            next_flag,
            bits_read: reader.bits_read(),
        }))
    }

    /// Inverse coupling, floor application, and the inverse transform.
    fn decode_packet(&mut self, info: &AudioInfo) {
        let block_size = self.modes[info.mode_idx].block_size;
        let half = block_size / 2;
        let map_idx = self.modes[info.mode_idx].mapping;
        let channels = self.channels;

        let Self {
            maps,
            floors,
            floor_datas,
            residue_out,
            mdct_short,
            mdct_long,
            mdct_scratch,
            ..
        } = &mut *self;
        let mapping = &maps[map_idx];

        // undo square-polar coupling, last step first
        for step in mapping.coupling_steps.iter().rev() {
            if floor_datas[step.angle].execute_channel()
                || floor_datas[step.magnitude].execute_channel()
            {
                for j in 0..half {
                    let m = residue_out[step.magnitude][j];
                    let a = residue_out[step.angle][j];
                    let (new_m, new_a) = if m > 0.0 {
                        if a > 0.0 { (m, m - a) } else { (m + a, m) }
                    } else if a > 0.0 {
                        (m, m + a)
                    } else {
                        (m - a, m)
                    };
                    residue_out[step.magnitude][j] = new_m;
                    residue_out[step.angle][j] = new_a;
                }
            }
        }

        for ch in 0..channels {
            let data = &mut floor_datas[ch];
            let res = &mut residue_out[ch];
            if data.execute_channel() {
                floors[mapping.submaps[mapping.channel_submap[ch]].floor].apply(data, res);
                let mdct = if block_size == mdct_long.block_size() {
                    &*mdct_long
                } else {
                    &*mdct_short
                };
                mdct.reverse(&mut res[..block_size], mdct_scratch);
            } else {
                // no transform ran, so the lapped tail must be silenced by hand
                res[half..block_size].fill(0.0);
            }
        }
    }

    /// Laps the decoded block onto the output and reports net new samples.
    fn overlap_samples(&mut self, info: &AudioInfo) -> i64 {
        let mode = &self.modes[info.mode_idx];
        let window = mode.window(info.prev_flag, info.next_flag);

        let size = mode.block_size as isize;
        let mut right = size;
        let mut center = right >> 1;
        let mut left = 0isize;
        let mut begin = -center;
        let mut end = center;

        if mode.block_flag {
            let short_quarter = (self.block0_size / 4) as isize;
            if !info.prev_flag {
                // previous block was short; the lap starts inset
                left = (self.block1_size / 4) as isize - short_quarter;
                center = left + (self.block0_size / 2) as isize;
                begin = -((self.block0_size / 2) as isize) - left;
            }
            if !info.next_flag {
                // next block is short; hold back the tail for it
                right -= size / 4 - short_quarter;
                end = size / 4 + short_quarter;
            }
        }

        let idx = (self.output.len() / self.channels) as isize + begin;
        for ch in 0..self.channels {
            self.output
                .write(ch, idx, left, center, right, &self.residue_out[ch], window);
        }

        let new_prepared = ((self.output.len() / self.channels) as isize - end).max(0);
        let decoded = new_prepared - self.prepared_length as isize;
        self.prepared_length = new_prepared as usize;
        decoded as i64
    }

    /// Tracks the decode position and anchors packets that followed a
    /// resync once a page granule confirms where they sit.
    fn update_position(&mut self, demuxer: &mut Demuxer, samples_decoded: i64, packet: &Packet) {
        self.stats.samples += samples_decoded;

        if packet.is_resync {
            // position is provisional until the page granule is reached
            self.current_position = -packet.page_granule_position;
            self.resync_queue.push(packet.handle);
            return;
        }

        if samples_decoded <= 0 {
            return;
        }

        self.current_position += samples_decoded;
        demuxer.entry_mut(self.stream, packet.handle).granule_position =
            Some(self.current_position);

        if self.current_position < 0 {
            if packet.page_granule_position > -self.current_position {
                // anchored; walk the queue backward assigning real positions
                let mut gp = self.current_position - samples_decoded;
                while let Some(handle) = self.resync_queue.pop() {
                    let entry = demuxer.entry_mut(self.stream, handle);
                    let temp = entry.granule_position.unwrap_or(0) + gp;
                    entry.granule_position = Some(gp);
                    gp = temp;
                }
            } else {
                demuxer.entry_mut(self.stream, packet.handle).granule_position =
                    Some(-samples_decoded);
                self.resync_queue.push(packet.handle);
            }
        } else if packet.is_end_of_stream && self.current_position > packet.page_granule_position {
            // the final page granule trims the lapped tail
            let diff = self.current_position - packet.page_granule_position;
            self.prepared_length = self
                .prepared_length
                .saturating_sub(diff.max(0) as usize);
            self.current_position -= diff;
            demuxer.entry_mut(self.stream, packet.handle).granule_position =
                Some(packet.page_granule_position);
            self.eos_found = true;
        }
    }

    fn decode_next_packet(&mut self, demuxer: &mut Demuxer) -> Result<(), DecodeError> {
        let Some(packet) = demuxer
            .get_next_packet(self.stream)
            .map_err(DecodeError::Packet)?
        else {
            self.eos_found = true;
            return Ok(());
        };

        self.note_page(packet.page_sequence_number);

        if packet.is_resync {
            // lapping state from before the gap is useless now
            self.reset_decoder(false);
        }

        if Self::is_header_packet(&packet) {
            self.is_parameter_change = true;
            return self.process_parameter_change(demuxer, packet);
        }

        let info = match self.unpack_packet(&packet)? {
            Some(info) => info,
            None => {
                self.stats.waste_bits += 8 * packet.len() as u64;
                demuxer.finish_packet(packet);
                return Ok(());
            }
        };

        self.decode_packet(&info);
        let samples_decoded = self.overlap_samples(&info);

        {
            let entry = demuxer.entry_mut(self.stream, packet.handle);
            if entry.granule_count.is_none() {
                entry.granule_count = Some(samples_decoded);
            }
        }
        self.update_position(demuxer, samples_decoded, &packet);

        // keep about one second of history for the instant bitrate
        let mut window: i64 = self.sample_count_history.iter().sum::<i64>() + samples_decoded;
        self.bits_per_packet_history.push_back(info.bits_read);
        self.sample_count_history.push_back(samples_decoded);
        while window > self.sample_rate as i64 {
            self.bits_per_packet_history.pop_front();
            if let Some(n) = self.sample_count_history.pop_front() {
                window -= n;
            }
        }

        demuxer.finish_packet(packet);
        Ok(())
    }

    /// Fills `buffer` with interleaved samples, decoding as needed.
    ///
    /// Returns fewer samples than requested only at end of stream or when a
    /// parameter change interrupts; a pending change must be cleared before
    /// the next call.
    pub fn read_samples(
        &mut self,
        demuxer: &mut Demuxer,
        buffer: &mut [f32],
    ) -> Result<usize, DecodeError> {
        let mut samples_read = 0usize;
        let mut count = buffer.len();
        let mut offset = 0usize;

        if let Some(prev) = self.prev_buffer.take() {
            // drain samples saved across a reset first
            let cnt = count.min(prev.len());
            buffer[..cnt].copy_from_slice(&prev[..cnt]);
            if cnt < prev.len() {
                self.prev_buffer = Some(prev[cnt..].to_vec());
            }
            count -= cnt;
            offset += cnt;
            samples_read = cnt;
        } else if self.is_parameter_change {
            return Err(DecodeError::ParameterChangePending);
        }

        self.output
            .ensure_size(count + self.block1_size * self.channels);

        while self.prepared_length * self.channels < count
            && !self.eos_found
            && !self.is_parameter_change
        {
            self.decode_next_packet(demuxer)?;

            if self.prev_buffer.is_some() {
                // a reset mid-read saved off good samples; surface them now
                let n = self
                    .prev_buffer
                    .as_ref()
                    .map_or(0, |b| b.len())
                    .min(count);
                let more = self.read_samples(demuxer, &mut buffer[offset..offset + n])?;
                return Ok(samples_read + more);
            }
        }

        if self.prepared_length * self.channels < count {
            count = self.prepared_length * self.channels;
        }

        self.output.copy_to(&mut buffer[offset..offset + count]);
        self.prepared_length -= count / self.channels;
        self.reported_position = self.current_position - self.prepared_length as i64;

        Ok(samples_read + count)
    }

    /// Positions the decoder so the next sample returned is `granule_pos`.
    pub fn seek_to(&mut self, demuxer: &mut Demuxer, granule_pos: i64) -> Result<(), SeekError> {
        if !demuxer.can_seek() {
            return Err(SeekError::Unseekable);
        }
        if granule_pos < 0 {
            return Err(SeekError::TargetOutOfRange(granule_pos));
        }

        let handle = if granule_pos > 0 {
            let this = &*self;
            demuxer
                .find_packet(this.stream, granule_pos, &mut |cur, prev| {
                    this.packet_sample_count(cur, prev)
                })?
                .ok_or(SeekError::TargetOutOfRange(granule_pos))?
        } else {
            // the three headers plus the priming packet sit before sample 0
            demuxer.get_packet(self.stream, 4)?.handle
        };

        // re-decode one packet ahead of the target to rebuild the lap
        demuxer.seek_to_packet(self.stream, handle, 1)?;

        let next = demuxer
            .peek_next_packet(self.stream)
            .map_err(SeekError::Packet)?
            .ok_or(SeekError::PacketNotFound(granule_pos as u64))?;
        self.set_position(next.granule_position.unwrap_or(0));

        let discard = (granule_pos - self.current_position) * self.channels as i64;
        if discard > 0 {
            let mut remaining = discard as usize;
            let mut scratch = vec![0f32; remaining];
            while remaining > 0 {
                let read = self
                    .read_samples(demuxer, &mut scratch[..remaining])
                    .map_err(SeekError::Decode)?;
                if read == 0 {
                    break;
                }
                remaining -= read;
            }
        }
        Ok(())
    }

    fn set_position(&mut self, position: i64) {
        self.reported_position = position;
        self.current_position = position;
        self.prepared_length = 0;
        self.eos_found = false;
        self.reset_decoder(false);
        self.prev_buffer = None;
    }

    /// Samples a packet contributes, judged from its own and its
    /// predecessor's block sizes. Packets that are not clean audio count
    /// for nothing.
    fn packet_sample_count(&self, packet: &Packet, previous: &Packet) -> i64 {
        if packet.is_resync {
            return 0;
        }

        let mut cur = packet.reader();
        if cur.read_bit() {
            return 0;
        }
        let mut prev = previous.reader();
        if prev.read_bit() {
            return 0;
        }

        let cur_mode = cur.read_bits(self.mode_field_bits) as usize;
        let prev_mode = prev.read_bits(self.mode_field_bits) as usize;
        if cur_mode >= self.modes.len() || prev_mode >= self.modes.len() {
            return 0;
        }

        (self.modes[cur_mode].block_size / 4 + self.modes[prev_mode].block_size / 4) as i64
    }
}

/// Builds a complete mono stream decoding to silence: identification,
/// comments, and setup headers followed by `audio_packets` short-block
/// packets whose floors carry no energy. Block size is 64, so every packet
/// after the first contributes 32 samples; the final page granule is
/// `32 * (audio_packets - 1) - trim`.
#[cfg(test)]
pub(crate) fn build_silence_stream(audio_packets: usize, trim: i64) -> Vec<u8> {
    use crate::structs::packet::BitWriter;
    use crate::structs::page::{FLAG_BOS, FLAG_EOS, build_page};

    let mut w = BitWriter::new();
    w.write_bytes(&[HEADER_TYPE_IDENTIFICATION]);
    w.write_bytes(&SIGNATURE);
    w.write(0, 32); // version
    w.write(1, 8); // channels
    w.write(8000, 32); // sample rate
    w.write(0, 32); // upper bitrate
    w.write(0, 32); // nominal bitrate
    w.write(0, 32); // lower bitrate
    w.write(6, 4); // block 0 exponent
    w.write(6, 4); // block 1 exponent
    w.write(1, 1); // framing
    let ident = w.finish();

    let mut w = BitWriter::new();
    w.write_bytes(&[HEADER_TYPE_COMMENTS]);
    w.write_bytes(&SIGNATURE);
    w.write(5, 32); // vendor length
    w.write_bytes(b"synth");
    w.write(1, 32); // one comment
    w.write(9, 32);
    w.write_bytes(b"title=hum");
    w.write(1, 1); // framing
    let comments = w.finish();

    let mut w = BitWriter::new();
    w.write_bytes(&[HEADER_TYPE_SETUP]);
    w.write_bytes(&SIGNATURE);
    // one codebook: two 1-bit entries, no lookup
    w.write(0, 8);
    w.write(0x56_4342, 24);
    w.write(1, 16); // dimensions
    w.write(2, 24); // entries
    w.write(0, 1); // not ordered
    w.write(0, 1); // not sparse
    w.write(0, 5);
    w.write(0, 5);
    w.write(0, 4); // no lookup
    // one time placeholder
    w.write(0, 6);
    w.write(0, 16);
    // one floor, type 1, no partitions
    w.write(0, 6);
    w.write(1, 16);
    w.write(0, 5); // partitions
    w.write(0, 2); // multiplier selector
    w.write(0, 4); // range bits
    // one residue, type 0, no stage books
    w.write(0, 6);
    w.write(0, 16); // type
    w.write(0, 24); // begin
    w.write(4, 24); // end
    w.write(3, 24); // partition size - 1
    w.write(0, 6); // classifications - 1
    w.write(0, 8); // classbook
    w.write(0, 3); // cascade low bits
    w.write(0, 1); // no cascade high bits
    // one mapping: single submap, no coupling
    w.write(0, 6);
    w.write(0, 16); // type
    w.write(0, 1); // submap count flag
    w.write(0, 1); // coupling flag
    w.write(0, 2); // reserved
    w.write(0, 8); // time placeholder
    w.write(0, 8); // floor 0
    w.write(0, 8); // residue 0
    // one mode: short blocks
    w.write(0, 6);
    w.write(0, 1); // block flag
    w.write(0, 16); // window type
    w.write(0, 16); // transform type
    w.write(0, 8); // mapping
    w.write(1, 1); // framing
    let setup = w.finish();

    // audio bit 0 (audio), floor nonzero bit 0 (silence)
    let audio = vec![0u8];

    let mut bytes = build_page(77, 0, 0, FLAG_BOS, &[&ident], false);
    bytes.extend(build_page(77, 1, 0, 0, &[&comments, &setup], false));

    let granule = 32 * (audio_packets as i64 - 1) - trim;
    let packets: Vec<&[u8]> = (0..audio_packets).map(|_| audio.as_slice()).collect();
    bytes.extend(build_page(77, 2, granule, FLAG_EOS, &packets, false));
    bytes
}

/// Like [`build_silence_stream`], but every audio packet carries a fully
/// open floor and a residue spectrum of `[2, 1, 1, 2, 2, 2, 1, 1]` in the
/// first eight bins, so the whole synthesis path runs on real data. Floor
/// posts sit at 255, the top of the dB table, making the floor curve an
/// identity multiply.
#[cfg(test)]
pub(crate) fn build_tone_stream(audio_packets: usize) -> Vec<u8> {
    use crate::structs::codebook::CODEBOOK_SYNC;
    use crate::structs::packet::BitWriter;
    use crate::structs::page::{FLAG_BOS, FLAG_EOS, build_page};

    let mut w = BitWriter::new();
    w.write_bytes(&[HEADER_TYPE_IDENTIFICATION]);
    w.write_bytes(&SIGNATURE);
    w.write(0, 32); // version
    w.write(1, 8); // channels
    w.write(8000, 32); // sample rate
    w.write(0, 32); // upper bitrate
    w.write(0, 32); // nominal bitrate
    w.write(0, 32); // lower bitrate
    w.write(6, 4); // block 0 exponent
    w.write(6, 4); // block 1 exponent
    w.write(1, 1); // framing
    let ident = w.finish();

    let mut w = BitWriter::new();
    w.write_bytes(&[HEADER_TYPE_COMMENTS]);
    w.write_bytes(&SIGNATURE);
    w.write(5, 32);
    w.write_bytes(b"synth");
    w.write(0, 32); // no comments
    w.write(1, 1); // framing
    let comments = w.finish();

    let mut w = BitWriter::new();
    w.write_bytes(&[HEADER_TYPE_SETUP]);
    w.write_bytes(&SIGNATURE);
    w.write(1, 8); // two codebooks
    // book 0: two 1-bit entries, no lookup; classifies residue partitions
    w.write(CODEBOOK_SYNC as u64, 24);
    w.write(1, 16); // dimensions
    w.write(2, 24); // entries
    w.write(0, 1); // not ordered
    w.write(0, 1); // not sparse
    w.write(0, 5);
    w.write(0, 5);
    w.write(0, 4); // no lookup
    // book 1: dims 2, four 2-bit entries, lattice lookup over {1.0, 2.0}
    w.write(CODEBOOK_SYNC as u64, 24);
    w.write(2, 16); // dimensions
    w.write(4, 24); // entries
    w.write(0, 1); // not ordered
    w.write(0, 1); // not sparse
    for _ in 0..4 {
        w.write(1, 5); // code length 2
    }
    w.write(1, 4); // lookup type 1
    w.write(0, 32); // minimum 0.0
    w.write(1 | (788u64 << 21), 32); // delta 1.0
    w.write(1, 4); // 2-bit multiplicands
    w.write(0, 1); // not sequential
    w.write(1, 2);
    w.write(2, 2);
    // one time placeholder
    w.write(0, 6);
    w.write(0, 16);
    // one floor, type 1, no partitions, 8-bit posts over the full dB range
    w.write(0, 6);
    w.write(1, 16);
    w.write(0, 5); // partitions
    w.write(0, 2); // multiplier selector
    w.write(0, 4); // range bits
    // one residue, type 1: class 0 silent, class 1 decodes through book 1
    w.write(0, 6);
    w.write(1, 16); // type
    w.write(0, 24); // begin
    w.write(8, 24); // end
    w.write(3, 24); // partition size - 1
    w.write(1, 6); // classifications - 1
    w.write(0, 8); // classbook
    w.write(0, 3); // class 0: no cascade stages
    w.write(0, 1);
    w.write(1, 3); // class 1: stage 0 only
    w.write(0, 1);
    w.write(1, 8); // stage 0 value book
    // one mapping: single submap, no coupling
    w.write(0, 6);
    w.write(0, 16); // type
    w.write(0, 1); // submap count flag
    w.write(0, 1); // coupling flag
    w.write(0, 2); // reserved
    w.write(0, 8); // time placeholder
    w.write(0, 8); // floor 0
    w.write(0, 8); // residue 0
    // one mode: short blocks
    w.write(0, 6);
    w.write(0, 1); // block flag
    w.write(0, 16); // window type
    w.write(0, 16); // transform type
    w.write(0, 8); // mapping
    w.write(1, 1); // framing
    let setup = w.finish();

    let mut w = BitWriter::new();
    w.write(0, 1); // audio packet
    w.write(1, 1); // floor carries energy
    w.write(255, 8); // post 0
    w.write(255, 8); // post 1
    w.write(1, 1); // partition 0 -> class 1
    w.write(0b10, 2); // entry 1 -> [2, 1]
    w.write(0b01, 2); // entry 2 -> [1, 2]
    w.write(1, 1); // partition 1 -> class 1
    w.write(0b11, 2); // entry 3 -> [2, 2]
    w.write(0b00, 2); // entry 0 -> [1, 1]
    let audio = w.finish();

    let mut bytes = build_page(77, 0, 0, FLAG_BOS, &[&ident], false);
    bytes.extend(build_page(77, 1, 0, 0, &[&comments, &setup], false));

    let granule = 32 * (audio_packets as i64 - 1);
    let packets: Vec<&[u8]> = (0..audio_packets).map(|_| audio.as_slice()).collect();
    bytes.extend(build_page(77, 2, granule, FLAG_EOS, &packets, false));
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::cache::StreamCache;
    use std::io::Cursor;

    fn open(bytes: Vec<u8>) -> (Demuxer, StreamDecoder) {
        let mut demux = Demuxer::new(StreamCache::new_seekable(Cursor::new(bytes)).unwrap());
        assert!(demux.init().unwrap());
        let decoder = StreamDecoder::try_init(&mut demux, 0).unwrap().unwrap();
        (demux, decoder)
    }

    #[test]
    fn handshake_parses_all_headers() {
        let (_, decoder) = open(build_silence_stream(4, 0));

        assert_eq!(decoder.channels(), 1);
        assert_eq!(decoder.sample_rate(), 8000);
        assert_eq!(decoder.vendor(), "synth");
        assert_eq!(decoder.comments(), &["title=hum".to_string()]);
        assert_eq!(decoder.modes.len(), 1);
        assert_eq!(decoder.mode_field_bits, 0);
        assert!(decoder.stats.book_bits > 0);
        assert!(decoder.stats.meta_bits > 0);
    }

    #[test]
    fn foreign_stream_is_declined() {
        use crate::structs::page::{FLAG_BOS, build_page};

        let bytes = build_page(5, 0, -1, FLAG_BOS, &[b"OpusHead not here"], false);
        let mut demux = Demuxer::new(StreamCache::new_seekable(Cursor::new(bytes)).unwrap());
        demux.init().unwrap();

        assert!(StreamDecoder::try_init(&mut demux, 0).unwrap().is_none());
    }

    #[test]
    fn decodes_packets_to_silence() {
        let (mut demux, mut decoder) = open(build_silence_stream(6, 0));

        let mut buf = vec![1f32; 1024];
        let n = decoder.read_samples(&mut demux, &mut buf).unwrap();

        // six packets: one primer plus five carrying 32 samples each
        assert_eq!(n, 160);
        assert!(buf[..n].iter().all(|&s| s == 0.0));
        assert_eq!(decoder.position(), 160);

        assert_eq!(decoder.read_samples(&mut demux, &mut buf).unwrap(), 0);
    }

    #[test]
    fn decodes_synthesized_tone() {
        let (mut demux, mut decoder) = open(build_tone_stream(4));

        let mut buf = vec![0f32; 1024];
        let n = decoder.read_samples(&mut demux, &mut buf).unwrap();
        assert_eq!(n, 96);

        // every packet carries the same spectrum, so each 32-sample hop laps
        // two identical transformed blocks: out[t] = v[t] w[t] + v[32+t] w[32+t]
        let mut spec = [0f64; 32];
        spec[..8].copy_from_slice(&[2.0, 1.0, 1.0, 2.0, 2.0, 2.0, 1.0, 1.0]);

        let mut v = [0f64; 64];
        for (i, o) in v.iter_mut().enumerate() {
            for (k, &x) in spec.iter().enumerate() {
                *o += x
                    * (std::f64::consts::PI / 128.0
                        * ((2 * i + 1) as f64 + 32.0)
                        * (2 * k + 1) as f64)
                        .cos();
            }
        }

        let window: Vec<f64> = (0..64)
            .map(|i| {
                let d = if i < 32 {
                    i as f64 + 0.5
                } else {
                    64.0 - i as f64 - 0.5
                };
                let x = (d / 32.0 * std::f64::consts::FRAC_PI_2).sin();
                (x * x * std::f64::consts::FRAC_PI_2).sin()
            })
            .collect();

        let mut peak = 0f32;
        for (t, &sample) in buf[..n].iter().enumerate() {
            let h = t % 32;
            let want = v[h] * window[h] + v[32 + h] * window[32 + h];
            assert!(
                (sample as f64 - want).abs() < 1e-3,
                "sample {t}: got {sample}, want {want}"
            );
            peak = peak.max(sample.abs());
        }
        assert!(peak > 1.0);
    }

    #[test]
    fn sample_counts_are_written_back() {
        let (mut demux, mut decoder) = open(build_silence_stream(4, 0));
        let mut buf = vec![0f32; 1024];
        decoder.read_samples(&mut demux, &mut buf).unwrap();

        // packet 3 is the primer, the rest carry a half block each
        assert_eq!(demux.entry(0, 3).granule_count, Some(0));
        assert_eq!(demux.entry(0, 4).granule_count, Some(32));
        assert_eq!(demux.entry(0, 4).granule_position, Some(32));
        assert_eq!(demux.entry(0, 6).granule_position, Some(96));
    }

    #[test]
    fn final_page_granule_trims_the_tail() {
        let (mut demux, mut decoder) = open(build_silence_stream(6, 10));

        let mut buf = vec![0f32; 1024];
        let n = decoder.read_samples(&mut demux, &mut buf).unwrap();
        assert_eq!(n, 150);
        assert_eq!(decoder.position(), 150);
    }

    #[test]
    fn seek_restores_exact_position() {
        let (mut demux, mut decoder) = open(build_silence_stream(6, 0));

        decoder.seek_to(&mut demux, 32).unwrap();
        assert_eq!(decoder.position(), 32);

        let mut buf = vec![0f32; 1024];
        let n = decoder.read_samples(&mut demux, &mut buf).unwrap();
        assert_eq!(n, 128);
        assert_eq!(decoder.position(), 160);
    }

    #[test]
    fn seek_to_start_replays_the_stream() {
        let (mut demux, mut decoder) = open(build_silence_stream(6, 0));

        let mut buf = vec![0f32; 1024];
        decoder.read_samples(&mut demux, &mut buf).unwrap();

        decoder.seek_to(&mut demux, 0).unwrap();
        assert_eq!(decoder.position(), 0);
        let n = decoder.read_samples(&mut demux, &mut buf).unwrap();
        assert_eq!(n, 160);

        assert!(matches!(
            decoder.seek_to(&mut demux, -5),
            Err(SeekError::TargetOutOfRange(-5))
        ));
    }

    #[test]
    fn mid_stream_headers_raise_parameter_change() {
        use crate::structs::page::{FLAG_EOS, build_page};

        // first half: headers plus three audio packets ending at granule 64,
        // with the EOS page rebuilt as a middle page
        let mut bytes = build_silence_stream(3, 0);
        let tail = build_page(77, 2, 64, FLAG_EOS, &[&[0u8], &[0u8], &[0u8]], false);
        bytes.truncate(bytes.len() - tail.len());
        bytes.extend(build_page(77, 2, 64, 0, &[&[0u8], &[0u8], &[0u8]], false));

        // mid-stream header page: pull the three header packets back out of
        // a pristine stream and repackage them
        let pristine = build_silence_stream(1, 0);
        let mut demux = Demuxer::new(StreamCache::new_seekable(Cursor::new(pristine)).unwrap());
        demux.init().unwrap();
        let ident = demux.get_next_packet(0).unwrap().unwrap();
        let comments = demux.get_next_packet(0).unwrap().unwrap();
        let setup = demux.get_next_packet(0).unwrap().unwrap();
        bytes.extend(build_page(
            77,
            3,
            64,
            0,
            &[ident.data(), comments.data(), setup.data()],
            false,
        ));

        // second half: three more audio packets
        bytes.extend(build_page(77, 4, 128, FLAG_EOS, &[&[0u8], &[0u8], &[0u8]], false));

        let (mut demux, mut decoder) = open(bytes);

        let mut buf = vec![0f32; 1024];
        let n = decoder.read_samples(&mut demux, &mut buf).unwrap();
        assert_eq!(n, 64);
        assert!(decoder.is_parameter_change());

        assert!(matches!(
            decoder.read_samples(&mut demux, &mut buf),
            Err(DecodeError::ParameterChangePending)
        ));

        decoder.clear_parameter_change();
        let n = decoder.read_samples(&mut demux, &mut buf).unwrap();
        assert_eq!(n, 64);
        assert_eq!(decoder.position(), 128);
    }

    #[test]
    fn strict_mode_rejects_bad_mode_numbers() {
        let (mut demux, mut decoder) = open(build_silence_stream(3, 0));
        decoder.fail_level = Level::Warn;

        // empty the mode table so any mode number is out of range
        decoder.modes.clear();
        let mut buf = vec![0f32; 64];
        assert!(matches!(
            decoder.read_samples(&mut demux, &mut buf),
            Err(DecodeError::InvalidMode(0))
        ));
    }
}
