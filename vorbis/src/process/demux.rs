//! Ogg physical stream demultiplexer.
//!
//! Pulls pages out of the byte cache, validates them, and sorts their
//! packets into per-serial chains. Lost sync is recovered by scanning
//! forward for the next capture pattern; everything skipped is billed to
//! the waste counter. Pages are only read forward, so chains buffer packet
//! locations until their consumer catches up.

use crate::structs::packet::{BitCursor, PacketEntry, PacketHandle, SliceSource};
use crate::structs::page::PageHeader;
use crate::utils::buffer_pool::BufferPool;
use crate::utils::errors::{PacketError, PageError, SeekError};

use super::cache::StreamCache;

/// Resync gives up after scanning this many bytes without a capture.
const RESYNC_LIMIT: usize = 65536;

/// A fully assembled packet handed out for decoding.
///
/// The payload is copied out of the cache so the demuxer can keep pumping
/// pages while the packet is being parsed. Granule annotations reflect what
/// was known at materialization time; updates go back through the demuxer
/// using the handle.
#[derive(Debug)]
pub struct Packet {
    data: Vec<u8>,

    pub handle: PacketHandle,
    pub is_resync: bool,
    pub is_end_of_stream: bool,
    pub page_granule_position: i64,
    pub page_sequence_number: u32,
    pub granule_position: Option<i64>,
    pub granule_count: Option<i64>,

    end_offset: u64,
}

impl Packet {
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Cache offset just past the packet's last byte.
    pub fn end_offset(&self) -> u64 {
        self.end_offset
    }

    /// Fresh bit-level reader over the payload.
    pub fn reader(&self) -> BitCursor<SliceSource<'_>> {
        BitCursor::new(SliceSource::new(&self.data))
    }
}

/// Packet chain for one logical stream.
struct StreamChain {
    serial: u32,
    packets: Vec<PacketEntry>,
    /// Index of the last packet handed to the consumer.
    current: Option<usize>,
    eos_found: bool,
    container_bits: u64,
}

impl StreamChain {
    fn new(serial: u32) -> Self {
        Self {
            serial,
            packets: Vec::new(),
            current: None,
            eos_found: false,
            container_bits: 0,
        }
    }

    fn add_packet(&mut self, mut entry: PacketEntry) -> Result<(), PacketError> {
        if self.eos_found {
            // the stream already ended; anything else is stray data
            return Ok(());
        }

        if entry.is_resync {
            // pages were lost; a dangling partial packet can never complete
            entry.is_continuation = false;
            if let Some(last) = self.packets.last_mut() {
                last.is_continued = false;
            }
        }

        let is_eos = entry.is_end_of_stream;

        if entry.is_continuation {
            let Some(last) = self.packets.last_mut() else {
                return Err(PacketError::OrphanContinuation);
            };
            if !last.is_continued {
                return Err(PacketError::OrphanContinuation);
            }
            last.fragments.extend(entry.fragments);
            last.is_continued = entry.is_continued;
            if is_eos {
                last.is_end_of_stream = true;
            }
        } else {
            self.packets.push(entry);
        }

        if is_eos {
            self.set_end_of_stream();
        }
        Ok(())
    }

    fn set_end_of_stream(&mut self) {
        self.eos_found = true;
        if self.packets.last().is_some_and(|last| last.is_continued) {
            // the final fragment never arrived
            self.packets.pop();
        }
    }
}

/// Page-level reader over a [`StreamCache`], one instance per container.
pub struct Demuxer {
    cache: StreamCache,
    chains: Vec<StreamChain>,
    ignored_serials: Vec<u32>,
    pool: BufferPool,

    next_page_offset: u64,
    page_count: u64,
    /// Framing bits seen since the last page was credited to a chain.
    pending_container_bits: u64,
    waste_bits: u64,
}

impl Demuxer {
    pub fn new(cache: StreamCache) -> Self {
        Self {
            cache,
            chains: Vec::new(),
            ignored_serials: Vec::new(),
            pool: BufferPool::new(8, 4096),
            next_page_offset: 0,
            page_count: 0,
            pending_container_bits: 0,
            waste_bits: 0,
        }
    }

    /// Reads the first page; `false` means the source is not an Ogg stream.
    pub fn init(&mut self) -> Result<bool, PacketError> {
        Ok(self.gather_next_page()?.is_some())
    }

    pub fn can_seek(&self) -> bool {
        self.cache.can_seek()
    }

    pub fn stream_count(&self) -> usize {
        self.chains.len()
    }

    pub fn serial(&self, stream: usize) -> u32 {
        self.chains[stream].serial
    }

    /// Total pages captured across all streams.
    pub fn pages_read(&self) -> u64 {
        self.page_count
    }

    /// Bits lost to resync scans.
    pub fn waste_bits(&self) -> u64 {
        self.waste_bits
    }

    /// Page framing overhead credited to one stream.
    pub fn container_bits(&self, stream: usize) -> u64 {
        self.chains[stream].container_bits
    }

    /// Stops tracking a stream; its pages are skipped from here on.
    pub fn ignore_stream(&mut self, stream: usize) {
        let chain = &mut self.chains[stream];
        self.ignored_serials.push(chain.serial);
        chain.packets.clear();
        chain.current = None;
        chain.eos_found = true;
    }

    /// Pumps pages until a new serial shows up or the container ends.
    pub fn find_next_stream(&mut self) -> Result<bool, PacketError> {
        let before = self.chains.len();
        while self.chains.len() == before {
            if self.gather_next_page()?.is_none() {
                break;
            }
        }
        Ok(self.chains.len() > before)
    }

    /// Releases a consumed packet: payload bytes up to its end may be
    /// discarded from a forward-only source.
    pub fn finish_packet(&mut self, packet: Packet) {
        self.cache.discard_through(packet.end_offset);
        self.pool.release(packet.data);
    }

    /// Returns the next complete packet without consuming it.
    pub fn peek_next_packet(&mut self, stream: usize) -> Result<Option<Packet>, PacketError> {
        match self.next_index(stream)? {
            Some(idx) => Ok(Some(self.materialize(stream, idx)?)),
            None => Ok(None),
        }
    }

    /// Returns the next complete packet and advances the chain cursor.
    pub fn get_next_packet(&mut self, stream: usize) -> Result<Option<Packet>, PacketError> {
        match self.next_index(stream)? {
            Some(idx) => {
                self.chains[stream].current = Some(idx);
                Ok(Some(self.materialize(stream, idx)?))
            }
            None => Ok(None),
        }
    }

    /// Returns packet `index` without moving the chain cursor, pumping pages
    /// as needed.
    pub fn get_packet(&mut self, stream: usize, index: usize) -> Result<Packet, SeekError> {
        loop {
            let chain = &self.chains[stream];
            if let Some(entry) = chain.packets.get(index) {
                if !entry.is_continued {
                    return Ok(self.materialize(stream, index)?);
                }
            }
            if chain.eos_found {
                return Err(SeekError::PacketIndexOutOfRange(index));
            }
            self.gather_for(stream)?;
        }
    }

    /// Rewinds the chain cursor so that packet `index - pre_roll` is
    /// delivered next.
    pub fn seek_to_packet(
        &mut self,
        stream: usize,
        index: usize,
        pre_roll: usize,
    ) -> Result<(), SeekError> {
        if !self.cache.can_seek() {
            return Err(SeekError::Unseekable);
        }
        if pre_roll > index {
            return Err(SeekError::PacketIndexOutOfRange(index));
        }
        self.chains[stream].current = (index - pre_roll).checked_sub(1);
        Ok(())
    }

    /// Granule position of the stream's final page, reading to the end.
    pub fn get_granule_count(&mut self, stream: usize) -> Result<i64, PacketError> {
        self.read_all_pages(stream)?;
        Ok(self.chains[stream]
            .packets
            .last()
            .map_or(0, |last| last.page_granule_position))
    }

    /// Number of pages seen for the stream, reading to the end.
    pub fn get_total_page_count(&mut self, stream: usize) -> Result<u64, PacketError> {
        self.read_all_pages(stream)?;
        let mut count = 0u64;
        let mut last_seq = None;
        for entry in &self.chains[stream].packets {
            if last_seq != Some(entry.page_sequence_number) {
                last_seq = Some(entry.page_sequence_number);
                count += 1;
            }
        }
        Ok(count)
    }

    pub(crate) fn entry(&self, stream: usize, handle: PacketHandle) -> &PacketEntry {
        &self.chains[stream].packets[handle]
    }

    pub(crate) fn entry_mut(&mut self, stream: usize, handle: PacketHandle) -> &mut PacketEntry {
        &mut self.chains[stream].packets[handle]
    }

    /// Locates the packet whose decoded span contains `target`.
    ///
    /// `packet_length` reports how many samples a packet contributes given
    /// its predecessor, and is only consulted where page granule positions
    /// do not already pin the answer down.
    pub fn find_packet(
        &mut self,
        stream: usize,
        target: i64,
        packet_length: &mut dyn FnMut(&Packet, &Packet) -> i64,
    ) -> Result<Option<PacketHandle>, PacketError> {
        if target < 0 {
            return Ok(None);
        }

        if self.chains[stream].packets.is_empty() {
            if self.chains[stream].eos_found {
                return Ok(None);
            }
            self.gather_for(stream)?;
            if self.chains[stream].packets.is_empty() {
                return Ok(None);
            }
        }

        let mut idx = self.chains[stream].current.unwrap_or(0);

        if target > self.chains[stream].packets[idx].page_granule_position {
            // walk forward by page granule until the page containing the target
            loop {
                let chain = &self.chains[stream];
                if target <= chain.packets[idx].page_granule_position {
                    break;
                }
                if idx + 1 >= chain.packets.len() || chain.packets[idx].is_continued {
                    if chain.eos_found {
                        return Ok(None);
                    }
                    self.gather_for(stream)?;
                    continue;
                }
                idx += 1;
            }
        } else {
            // walk backward; -1 marks a page no packet ends on
            while idx > 0 {
                let prev = &self.chains[stream].packets[idx - 1];
                if target < prev.page_granule_position || prev.page_granule_position == -1 {
                    idx -= 1;
                } else {
                    break;
                }
            }
        }

        self.find_packet_in_page(stream, idx, target, packet_length)
    }

    /// Pins down granule positions within one page and picks the packet
    /// containing `target`.
    fn find_packet_in_page(
        &mut self,
        stream: usize,
        page_idx: usize,
        target: i64,
        packet_length: &mut dyn FnMut(&Packet, &Packet) -> i64,
    ) -> Result<Option<PacketHandle>, PacketError> {
        let last_in_page = {
            let chain = &self.chains[stream];
            let page_seq = chain.packets[page_idx].page_sequence_number;
            let mut i = page_idx;
            while i + 1 < chain.packets.len()
                && chain.packets[i + 1].page_sequence_number == page_seq
            {
                i += 1;
            }
            if chain.packets[i].is_continued {
                if i == 0 {
                    return Ok(None);
                }
                i -= 1;
            }
            i
        };

        let page_seq = self.chains[stream].packets[last_in_page].page_sequence_number;
        let mut idx = last_in_page;

        loop {
            if self.chains[stream].packets[idx].granule_count.is_none() {
                // the last packet of a page ends exactly at the page granule;
                // everything before it is pinned by its successor
                let gp = if idx == last_in_page {
                    self.chains[stream].packets[idx].page_granule_position
                } else {
                    let next = &self.chains[stream].packets[idx + 1];
                    match (next.granule_position, next.granule_count) {
                        (Some(p), Some(c)) => p - c,
                        _ => return Ok(None),
                    }
                };
                self.chains[stream].packets[idx].granule_position = Some(gp);

                let (on_final_page, prev_page_granule) = {
                    let chain = &self.chains[stream];
                    let is_stream_last = idx + 1 == chain.packets.len() && chain.eos_found;
                    let alone = idx > 0
                        && chain.packets[idx - 1].page_sequence_number
                            < chain.packets[idx].page_sequence_number;
                    (
                        is_stream_last && alone,
                        idx.checked_sub(1)
                            .map(|p| chain.packets[p].page_granule_position),
                    )
                };

                let count = if on_final_page {
                    // sole data packet on the final page
                    gp - prev_page_granule.unwrap_or(0)
                } else if idx > 0 {
                    let cur = self.materialize(stream, idx)?;
                    let prev = self.materialize(stream, idx - 1)?;
                    let count = packet_length(&cur, &prev);
                    self.pool.release(cur.data);
                    self.pool.release(prev.data);
                    count
                } else {
                    // first data packet of the stream decodes in full
                    if let Some(next) = self.chains[stream].packets.get(idx + 1) {
                        if let (Some(p), Some(c)) = (next.granule_position, next.granule_count) {
                            if gp > p - c {
                                return Ok(None);
                            }
                        }
                    }
                    gp
                };
                self.chains[stream].packets[idx].granule_count = Some(count);
            }

            {
                let entry = &self.chains[stream].packets[idx];
                let gp = entry.granule_position.unwrap_or(0);
                let count = entry.granule_count.unwrap_or(0);
                if target <= gp && target > gp - count {
                    let first_sample = gp - count;
                    if idx > 0 {
                        let prev = &mut self.chains[stream].packets[idx - 1];
                        if prev.granule_position.is_none() {
                            prev.granule_position = Some(first_sample);
                        }
                    }
                    return Ok(Some(idx));
                }
            }

            if idx == 0 {
                return Ok(None);
            }
            idx -= 1;

            if self.chains[stream].packets[idx].page_sequence_number != page_seq {
                // walked off the front of the page; the previous page's
                // granule tells us where this page starts
                let entry = &mut self.chains[stream].packets[idx];
                if entry.page_granule_position < target {
                    entry.granule_position = Some(entry.page_granule_position);
                    return Ok(Some(idx + 1));
                }
                return Ok(None);
            }
        }
    }

    /// Index of the next complete packet, pumping pages as needed.
    fn next_index(&mut self, stream: usize) -> Result<Option<usize>, PacketError> {
        loop {
            let chain = &self.chains[stream];
            let candidate = chain.current.map_or(0, |c| c + 1);
            if let Some(entry) = chain.packets.get(candidate) {
                if !entry.is_continued {
                    return Ok(Some(candidate));
                }
                if chain.eos_found {
                    return Err(PacketError::Incomplete);
                }
            } else if chain.eos_found {
                return Ok(None);
            }
            self.gather_for(stream)?;
        }
    }

    /// Copies a packet's payload out of the cache.
    fn materialize(&mut self, stream: usize, idx: usize) -> Result<Packet, PacketError> {
        let entry = &self.chains[stream].packets[idx];
        let fragments = entry.fragments.clone();

        let mut data = self.pool.acquire();
        for &(offset, len) in &fragments {
            let at = data.len();
            data.resize(at + len, 0);
            self.cache.seek(offset).map_err(PacketError::Cache)?;
            if self.cache.read(&mut data[at..]).map_err(PacketError::Cache)? != len {
                return Err(PacketError::Incomplete);
            }
        }

        let entry = &self.chains[stream].packets[idx];
        Ok(Packet {
            data,
            handle: idx,
            is_resync: entry.is_resync,
            is_end_of_stream: entry.is_end_of_stream,
            page_granule_position: entry.page_granule_position,
            page_sequence_number: entry.page_sequence_number,
            granule_position: entry.granule_position,
            granule_count: entry.granule_count,
            end_offset: entry.end_offset(),
        })
    }

    /// Pumps pages until one lands on `stream` or the container ends. A
    /// container that runs out ends every stream still open.
    fn gather_for(&mut self, stream: usize) -> Result<(), PacketError> {
        loop {
            if self.chains[stream].eos_found {
                return Ok(());
            }
            match self.gather_next_page()? {
                None => {
                    for chain in &mut self.chains {
                        if !chain.eos_found {
                            chain.set_end_of_stream();
                        }
                    }
                    return Ok(());
                }
                Some(serial) if serial == self.chains[stream].serial => return Ok(()),
                Some(_) => {}
            }
        }
    }

    fn read_all_pages(&mut self, stream: usize) -> Result<(), PacketError> {
        while !self.chains[stream].eos_found {
            self.gather_for(stream)?;
        }
        Ok(())
    }

    /// Reads one page and files its packets, skipping ignored serials.
    /// Returns the serial the page belonged to, or `None` at end of
    /// container.
    fn gather_next_page(&mut self) -> Result<Option<u32>, PacketError> {
        loop {
            let Some(header) = self.find_next_page_header()? else {
                return Ok(None);
            };
            if self.ignored_serials.contains(&header.serial) {
                continue;
            }
            let serial = header.serial;
            self.add_page(&header)?;
            return Ok(Some(serial));
        }
    }

    /// Captures the next page, scanning past garbage after a failed read.
    fn find_next_page_header(&mut self) -> Result<Option<PageHeader>, PacketError> {
        let mut start = self.next_page_offset;
        let mut is_resync = false;

        loop {
            match PageHeader::read(&mut self.cache, start) {
                Ok(mut header) => {
                    header.is_resync = is_resync;
                    self.next_page_offset = header.next_page_offset();
                    self.pending_container_bits += 8 * (header.data_offset - start);
                    self.page_count += 1;
                    return Ok(Some(header));
                }
                Err(PageError::Cache(err)) => return Err(PacketError::Cache(err)),
                Err(_) => {}
            }

            // bad capture, version, or checksum: hunt for the next "OggS"
            is_resync = true;
            self.waste_bits += 8;
            start += 1;

            self.cache.seek(start).map_err(PacketError::Cache)?;
            let mut count = 0usize;
            loop {
                match self.cache.read_byte().map_err(PacketError::Cache)? {
                    None => return Ok(None),
                    Some(b'O') => {
                        let mut tail = [0u8; 3];
                        let got = self.cache.read(&mut tail).map_err(PacketError::Cache)?;
                        if got == 3 && tail == *b"ggS" {
                            start += count as u64;
                            break;
                        }
                        // false alarm; rewind to just past the 'O'
                        self.cache
                            .seek(start + count as u64 + 1)
                            .map_err(PacketError::Cache)?;
                    }
                    Some(_) => {}
                }
                self.waste_bits += 8;
                count += 1;
                if count >= RESYNC_LIMIT {
                    return Err(PacketError::Page(PageError::ResyncLimitExceeded(
                        RESYNC_LIMIT,
                    )));
                }
            }
        }
    }

    /// Splits a page into packet entries and files them on its chain.
    fn add_page(&mut self, header: &PageHeader) -> Result<(), PacketError> {
        let chain_idx = match self
            .chains
            .iter()
            .position(|chain| chain.serial == header.serial)
        {
            Some(idx) => idx,
            None => {
                self.chains.push(StreamChain::new(header.serial));
                self.chains.len() - 1
            }
        };

        let chain = &mut self.chains[chain_idx];
        chain.container_bits += std::mem::take(&mut self.pending_container_bits);

        let count = header.packet_sizes.len();
        let mut data_offset = header.data_offset;
        for (i, &size) in header.packet_sizes.iter().enumerate() {
            let first = i == 0;
            let last = i + 1 == count;
            let entry = PacketEntry {
                fragments: vec![(data_offset, size)],
                page_granule_position: header.granule_position,
                page_sequence_number: header.sequence_number,
                is_resync: header.is_resync && first,
                is_continuation: header.is_continuation() && first,
                is_continued: last && header.last_packet_continues,
                is_end_of_stream: last && header.is_eos(),
                granule_position: None,
                granule_count: None,
            };
            data_offset += size as u64;
            chain.add_packet(entry)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structs::page::{FLAG_BOS, FLAG_CONTINUATION, FLAG_EOS, build_page};
    use std::io::Cursor;

    fn demuxer_over(bytes: Vec<u8>) -> Demuxer {
        Demuxer::new(StreamCache::new_seekable(Cursor::new(bytes)).unwrap())
    }

    #[test]
    fn delivers_packets_in_order() {
        let mut bytes = build_page(9, 0, -1, FLAG_BOS, &[b"first", b"second"], false);
        bytes.extend(build_page(9, 1, 100, FLAG_EOS, &[b"third"], false));
        let mut demux = demuxer_over(bytes);

        assert!(demux.init().unwrap());
        assert_eq!(demux.stream_count(), 1);
        assert_eq!(demux.serial(0), 9);

        // peeking does not advance
        let peeked = demux.peek_next_packet(0).unwrap().unwrap();
        assert_eq!(peeked.data(), b"first");

        for expected in [&b"first"[..], b"second", b"third"] {
            let packet = demux.get_next_packet(0).unwrap().unwrap();
            assert_eq!(packet.data(), expected);
            demux.finish_packet(packet);
        }
        assert!(demux.get_next_packet(0).unwrap().is_none());
    }

    #[test]
    fn continued_packet_merges_across_pages() {
        let opening = vec![0x5A; 510];
        let mut bytes = build_page(1, 0, -1, FLAG_BOS, &[&opening], true);
        bytes.extend(build_page(
            1,
            1,
            64,
            FLAG_CONTINUATION,
            &[&[0x5A; 30], b"next"],
            false,
        ));
        let mut demux = demuxer_over(bytes);
        demux.init().unwrap();

        let packet = demux.get_next_packet(0).unwrap().unwrap();
        assert_eq!(packet.len(), 540);
        assert!(packet.data().iter().all(|&b| b == 0x5A));
        assert_eq!(packet.page_granule_position, -1);

        let packet = demux.get_next_packet(0).unwrap().unwrap();
        assert_eq!(packet.data(), b"next");
    }

    #[test]
    fn garbage_between_pages_triggers_resync() {
        let mut bytes = build_page(1, 0, -1, FLAG_BOS, &[b"ok"], false);
        bytes.extend_from_slice(b"junkjunk");
        bytes.extend(build_page(1, 1, 32, 0, &[b"after"], false));
        let mut demux = demuxer_over(bytes);
        demux.init().unwrap();

        let first = demux.get_next_packet(0).unwrap().unwrap();
        assert!(!first.is_resync);

        let second = demux.get_next_packet(0).unwrap().unwrap();
        assert_eq!(second.data(), b"after");
        assert!(second.is_resync);
        assert_eq!(demux.waste_bits(), 8 * 8);
    }

    #[test]
    fn corrupt_page_is_skipped() {
        let mut bytes = build_page(1, 0, -1, FLAG_BOS, &[b"good"], false);
        let mut bad = build_page(1, 1, 32, 0, &[b"lost!"], false);
        bad[30] ^= 0x01; // break the checksum
        bytes.extend(bad);
        bytes.extend(build_page(1, 2, 64, 0, &[b"recovered"], false));
        let mut demux = demuxer_over(bytes);
        demux.init().unwrap();

        let first = demux.get_next_packet(0).unwrap().unwrap();
        assert_eq!(first.data(), b"good");

        let second = demux.get_next_packet(0).unwrap().unwrap();
        assert_eq!(second.data(), b"recovered");
        assert!(second.is_resync);
    }

    #[test]
    fn end_of_stream_drops_unfinished_packet() {
        let partial = vec![0u8; 255];
        let mut bytes = build_page(1, 0, -1, FLAG_BOS, &[b"whole"], false);
        bytes.extend(build_page(1, 1, 32, FLAG_EOS, &[&partial], true));
        let mut demux = demuxer_over(bytes);
        demux.init().unwrap();

        let packet = demux.get_next_packet(0).unwrap().unwrap();
        assert_eq!(packet.data(), b"whole");
        assert!(demux.get_next_packet(0).unwrap().is_none());
    }

    #[test]
    fn orphan_continuation_is_rejected() {
        let bytes = build_page(1, 0, -1, FLAG_CONTINUATION, &[b"tail"], false);
        let mut demux = demuxer_over(bytes);
        assert!(matches!(
            demux.init(),
            Err(PacketError::OrphanContinuation)
        ));
    }

    #[test]
    fn multiplexed_streams_stay_separate() {
        let mut bytes = build_page(10, 0, -1, FLAG_BOS, &[b"a0"], false);
        bytes.extend(build_page(20, 0, -1, FLAG_BOS, &[b"b0"], false));
        bytes.extend(build_page(10, 1, 32, FLAG_EOS, &[b"a1"], false));
        bytes.extend(build_page(20, 1, 32, FLAG_EOS, &[b"b1"], false));
        let mut demux = demuxer_over(bytes);
        demux.init().unwrap();

        // pull stream 20 first; its pages arrive while pumping for it
        assert!(demux.find_next_stream().unwrap());
        assert_eq!(demux.stream_count(), 2);
        assert_eq!(demux.serial(1), 20);

        assert_eq!(demux.get_next_packet(1).unwrap().unwrap().data(), b"b0");
        assert_eq!(demux.get_next_packet(1).unwrap().unwrap().data(), b"b1");

        assert_eq!(demux.get_next_packet(0).unwrap().unwrap().data(), b"a0");
        assert_eq!(demux.get_next_packet(0).unwrap().unwrap().data(), b"a1");
    }

    #[test]
    fn ignored_stream_pages_are_skipped() {
        let mut bytes = build_page(10, 0, -1, FLAG_BOS, &[b"keep0"], false);
        bytes.extend(build_page(20, 0, -1, FLAG_BOS, &[b"drop0"], false));
        bytes.extend(build_page(20, 1, 32, 0, &[b"drop1"], false));
        bytes.extend(build_page(10, 1, 32, FLAG_EOS, &[b"keep1"], false));
        let mut demux = demuxer_over(bytes);
        demux.init().unwrap();
        demux.find_next_stream().unwrap();

        demux.ignore_stream(1);

        assert_eq!(demux.get_next_packet(0).unwrap().unwrap().data(), b"keep0");
        assert_eq!(demux.get_next_packet(0).unwrap().unwrap().data(), b"keep1");
        assert!(demux.get_next_packet(1).unwrap().is_none());
    }

    /// Four packets across three pages, 128 samples each:
    /// page 0 holds the first, page 1 the middle two, page 2 the last.
    fn granule_stream() -> Demuxer {
        let mut bytes = build_page(1, 0, 128, FLAG_BOS, &[b"p0"], false);
        bytes.extend(build_page(1, 1, 384, 0, &[b"p1", b"p2"], false));
        bytes.extend(build_page(1, 2, 512, FLAG_EOS, &[b"p3"], false));
        let mut demux = demuxer_over(bytes);
        demux.init().unwrap();
        demux
    }

    #[test]
    fn find_packet_locates_by_granule() {
        let mut demux = granule_stream();
        let mut fixed = |_: &Packet, _: &Packet| 128i64;

        // inside the final page; the page granules alone pin it down
        let idx = demux.find_packet(0, 400, &mut fixed).unwrap().unwrap();
        assert_eq!(idx, 3);
        assert_eq!(demux.entry(0, 3).granule_position, Some(512));
        assert_eq!(demux.entry(0, 3).granule_count, Some(128));

        // middle of a multi-packet page needs the length callback
        let idx = demux.find_packet(0, 200, &mut fixed).unwrap().unwrap();
        assert_eq!(idx, 1);
        assert_eq!(demux.entry(0, 1).granule_position, Some(256));

        // backfilled neighbor positions survive for later lookups
        assert_eq!(demux.entry(0, 0).granule_position, Some(128));
    }

    #[test]
    fn find_packet_walks_backward_from_cursor() {
        let mut demux = granule_stream();
        let mut fixed = |_: &Packet, _: &Packet| 128i64;

        // park the cursor at the end of the stream
        while demux.get_next_packet(0).unwrap().is_some() {}
        demux.seek_to_packet(0, 3, 0).unwrap();

        let idx = demux.find_packet(0, 100, &mut fixed).unwrap().unwrap();
        assert_eq!(idx, 0);
    }

    #[test]
    fn seek_to_packet_applies_pre_roll() {
        let mut demux = granule_stream();
        while demux.get_next_packet(0).unwrap().is_some() {}

        demux.seek_to_packet(0, 3, 1).unwrap();
        let packet = demux.get_next_packet(0).unwrap().unwrap();
        assert_eq!(packet.data(), b"p2");

        assert!(matches!(
            demux.seek_to_packet(0, 1, 2),
            Err(SeekError::PacketIndexOutOfRange(1))
        ));
    }

    #[test]
    fn get_packet_pumps_to_index() {
        let mut demux = granule_stream();
        let packet = demux.get_packet(0, 2).unwrap();
        assert_eq!(packet.data(), b"p2");

        // the chain cursor did not move
        assert_eq!(demux.get_next_packet(0).unwrap().unwrap().data(), b"p0");

        assert!(matches!(
            demux.get_packet(0, 9),
            Err(SeekError::PacketIndexOutOfRange(9))
        ));
    }

    #[test]
    fn granule_count_reads_to_stream_end() {
        let mut demux = granule_stream();
        assert_eq!(demux.get_granule_count(0).unwrap(), 512);
        assert_eq!(demux.get_total_page_count(0).unwrap(), 3);
    }
}
