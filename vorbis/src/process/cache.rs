//! Caching byte window over the physical source.
//!
//! The demuxer walks pages through a resizable window so that packet data can
//! be re-read lazily without the source needing to support seeking. The
//! window grows in powers of two up to a configurable cap; displaced windows
//! are parked for a few generations so short backward hops (page retries,
//! header re-parses) avoid re-reading the source. Once packet bytes are
//! consumed the decoder discards through them and the window compacts.
//!
//! The cache has exactly one owner at a time. Multi-step operations bracket
//! themselves with [`StreamCache::take_lock`]/[`StreamCache::release_lock`];
//! access off the owning thread fails fast instead of corrupting the window.

use std::io::{Read, Seek, SeekFrom};
use std::thread::{self, ThreadId};

use log::debug;

use crate::utils::buffer_pool::BufferPool;
use crate::utils::errors::CacheError;

const DEFAULT_INITIAL_SIZE: usize = 32768; // half a full page
const DEFAULT_MAX_SIZE: usize = 262144; // four full pages

/// Generations a displaced window survives before its buffer is recycled.
const SAVED_BUFFER_TTL: u64 = 25;

pub trait ReadSeek: Read + Seek {}
impl<T: Read + Seek> ReadSeek for T {}

enum Source {
    Seekable(Box<dyn ReadSeek + Send>),
    Streaming(Box<dyn Read + Send>),
}

struct SavedBuffer {
    data: Vec<u8>,
    base_offset: u64,
    end: usize,
    discard_count: usize,
    version_saved: u64,
}

pub struct StreamCache {
    source: Source,
    source_pos: u64,
    eof_offset: u64,

    data: Vec<u8>,
    base_offset: u64,
    end: usize,
    discard_count: usize,

    minimal_read: bool,
    max_size: usize,

    version_counter: u64,
    saved_buffers: Vec<SavedBuffer>,
    pool: BufferPool,

    position: u64,

    owner: Option<ThreadId>,
    lock_count: u32,
}

impl StreamCache {
    pub fn new_seekable(mut source: impl Read + Seek + Send + 'static) -> Result<Self, CacheError> {
        let len = source.seek(SeekFrom::End(0))?;
        source.seek(SeekFrom::Start(0))?;
        Ok(Self::build(Source::Seekable(Box::new(source)), len))
    }

    pub fn new_streaming(source: impl Read + Send + 'static) -> Self {
        Self::build(Source::Streaming(Box::new(source)), u64::MAX)
    }

    fn build(source: Source, eof_offset: u64) -> Self {
        Self {
            source,
            source_pos: 0,
            eof_offset,
            data: vec![0; DEFAULT_INITIAL_SIZE.next_power_of_two()],
            base_offset: 0,
            end: 0,
            discard_count: 0,
            minimal_read: false,
            max_size: DEFAULT_MAX_SIZE.next_power_of_two(),
            version_counter: 0,
            saved_buffers: Vec::new(),
            pool: BufferPool::default(),
            position: 0,
            owner: None,
            lock_count: 0,
        }
    }

    pub fn can_seek(&self) -> bool {
        matches!(self.source, Source::Seekable(_))
    }

    /// Total source length, known only for seekable sources.
    pub fn source_len(&self) -> Option<u64> {
        if self.can_seek() {
            Some(self.eof_offset)
        } else {
            None
        }
    }

    /// When set, backing reads stop at the requested byte count instead of
    /// opportunistically filling the whole window.
    pub fn set_minimal_read(&mut self, minimal: bool) {
        self.minimal_read = minimal;
    }

    // ---- ownership ----

    pub fn take_lock(&mut self) {
        let me = thread::current().id();
        if self.lock_count == 0 {
            self.owner = Some(me);
        }
        self.lock_count += 1;
    }

    pub fn release_lock(&mut self) {
        debug_assert!(self.lock_count > 0);
        self.lock_count -= 1;
        if self.lock_count == 0 {
            self.owner = None;
        }
    }

    fn check_lock(&self) -> Result<(), CacheError> {
        match self.owner {
            Some(owner) if owner != thread::current().id() => Err(CacheError::LockHeldElsewhere),
            _ => Ok(()),
        }
    }

    // ---- cursor ----

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn seek(&mut self, offset: u64) -> Result<u64, CacheError> {
        self.check_lock()?;

        if !self.can_seek() {
            if offset < self.window_base() {
                return Err(CacheError::RewindPastDiscard {
                    requested: offset,
                    discard: self.window_base(),
                });
            }
            if offset >= self.window_end_offset() {
                return Err(CacheError::WindowCapacityExceeded {
                    needed: (offset - self.window_base()) as usize,
                    cap: self.max_size,
                });
            }
        }

        self.position = offset;
        Ok(offset)
    }

    /// Start of retained data; reads before this may need a source seek.
    pub fn window_base(&self) -> u64 {
        self.base_offset + self.discard_count as u64
    }

    pub fn bytes_filled(&self) -> usize {
        self.end - self.discard_count
    }

    fn window_end_offset(&self) -> u64 {
        if self.end > self.discard_count {
            self.base_offset + self.discard_count as u64 + self.max_size as u64
        } else {
            self.eof_offset
        }
    }

    // ---- reading ----

    pub fn read_byte(&mut self) -> Result<Option<u8>, CacheError> {
        self.check_lock()?;
        let offset = self.position;
        if offset >= self.eof_offset {
            return Ok(None);
        }

        let (idx, count) = self.ensure_available(offset, 1, false)?;
        if count == 1 {
            self.position += 1;
            Ok(Some(self.data[idx]))
        } else {
            Ok(None)
        }
    }

    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, CacheError> {
        self.check_lock()?;
        let offset = self.position;
        if offset >= self.eof_offset || buf.is_empty() {
            return Ok(0);
        }

        let (idx, count) = self.ensure_available(offset, buf.len(), false)?;
        buf[..count].copy_from_slice(&self.data[idx..idx + count]);
        self.position += count as u64;
        Ok(count)
    }

    /// Reads one byte at an absolute offset without moving the cursor.
    pub fn read_byte_at(&mut self, offset: u64) -> Result<Option<u8>, CacheError> {
        self.check_lock()?;
        if offset >= self.eof_offset {
            return Ok(None);
        }

        let (idx, count) = self.ensure_available(offset, 1, false)?;
        if count == 1 {
            Ok(Some(self.data[idx]))
        } else {
            Ok(None)
        }
    }

    /// Releases all bytes before `offset`; compaction is deferred until the
    /// discarded run covers the whole window.
    pub fn discard_through(&mut self, offset: u64) {
        let count = (offset as i64 - self.base_offset as i64).max(0) as usize;
        self.discard_count = count.max(self.discard_count);

        if self.discard_count >= self.data.len() {
            self.commit_discard();
        }
    }

    fn commit_discard(&mut self) {
        if self.discard_count >= self.data.len() || self.discard_count >= self.end {
            self.base_offset += self.discard_count as u64;
            self.end = 0;
        } else {
            self.data.copy_within(self.discard_count..self.end, 0);
            self.base_offset += self.discard_count as u64;
            self.end -= self.discard_count;
        }
        self.discard_count = 0;
    }

    // ---- window management ----

    fn ensure_available(
        &mut self,
        offset: u64,
        mut count: usize,
        is_recursion: bool,
    ) -> Result<(usize, usize), CacheError> {
        // fast path: fully inside the live window
        if offset >= self.base_offset
            && offset + (count as u64) < self.base_offset + self.end as u64
        {
            return Ok(((offset - self.base_offset) as usize, count));
        }

        if count > self.max_size {
            return Err(CacheError::WindowCapacityExceeded {
                needed: count,
                cap: self.max_size,
            });
        }

        self.version_counter += 1;

        // can a parked window satisfy the request?
        if !is_recursion {
            for i in 0..self.saved_buffers.len() {
                let delta = self.saved_buffers[i].base_offset as i64 - offset as i64;
                if (delta < 0 && self.saved_buffers[i].end as i64 + delta > 0)
                    || (delta > 0 && count as i64 - delta > 0)
                {
                    self.swap_buffers(i);
                    return self.ensure_available(offset, count, true);
                }
            }
        }

        // age out parked windows
        while let Some(first) = self.saved_buffers.first() {
            if first.version_saved + SAVED_BUFFER_TTL < self.version_counter {
                let stale = self.saved_buffers.remove(0);
                self.pool.release(stale.data);
            } else {
                break;
            }
        }

        if offset < self.base_offset && !self.can_seek() {
            return Err(CacheError::RewindPastDiscard {
                requested: offset,
                discard: self.base_offset,
            });
        }

        let (read_start, read_end) = self.calc_buffer(offset, count)?;
        count = self.fill_buffer(offset, count, read_start, read_end)?;

        Ok(((offset - self.base_offset) as usize, count))
    }

    fn save_buffer(&mut self) {
        let mut data = self.pool.acquire();
        std::mem::swap(&mut data, &mut self.data);

        self.saved_buffers.push(SavedBuffer {
            data,
            base_offset: self.base_offset,
            end: self.end,
            discard_count: self.discard_count,
            version_saved: self.version_counter,
        });

        self.end = 0;
        self.discard_count = 0;
    }

    fn create_new_buffer(&mut self, offset: u64, count: usize) {
        debug!(
            "cache window jump to offset {offset} ({count} bytes requested), parking current window"
        );
        self.save_buffer();

        let size = count.next_power_of_two().min(self.max_size);
        self.data.resize(size, 0);
        self.base_offset = offset;
    }

    fn swap_buffers(&mut self, index: usize) {
        let saved = self.saved_buffers.remove(index);
        self.save_buffer();
        self.pool.release(std::mem::replace(&mut self.data, saved.data));
        self.base_offset = saved.base_offset;
        self.end = saved.end;
        self.discard_count = saved.discard_count;
    }

    fn calc_buffer(&mut self, offset: u64, count: usize) -> Result<(usize, usize), CacheError> {
        let mut read_start = 0usize;
        let read_end;

        if offset < self.base_offset {
            if offset + self.max_size as u64 <= self.base_offset {
                // no overlap with the live window at all
                if self.base_offset - (offset + self.max_size as u64) > self.max_size as u64 {
                    self.create_new_buffer(offset, count);
                } else {
                    self.ensure_buffer_size(count, false, 0)?;
                }
                self.base_offset = offset;
                read_end = count;
            } else {
                // partial overlap; shift the window down
                let shift = offset as i64 - self.base_offset as i64;
                let keep = ((offset + self.max_size as u64 - self.base_offset) as i64)
                    .min(self.end as i64)
                    - shift;
                self.ensure_buffer_size(keep as usize, true, shift as isize)?;
                read_end = ((offset as i64 - self.base_offset as i64) - shift) as usize;
            }
        } else if offset >= self.base_offset + self.max_size as u64 {
            // no overlap ahead of the live window
            if offset - (self.base_offset + self.max_size as u64) > self.max_size as u64 {
                self.create_new_buffer(offset, count);
            } else {
                self.ensure_buffer_size(count, false, 0)?;
            }
            self.base_offset = offset;
            read_end = count;
        } else {
            // overlap at the front; extend (and slide if the cap forces it)
            let want = (offset + count as u64 - self.base_offset) as usize;
            let ofs = want.saturating_sub(self.max_size);
            self.ensure_buffer_size(want - ofs, true, ofs as isize)?;
            read_start = self.end;
            read_end = (offset + count as u64 - self.base_offset) as usize;
        }

        Ok((read_start, read_end))
    }

    fn ensure_buffer_size(
        &mut self,
        mut req_size: usize,
        copy_contents: bool,
        mut copy_offset: isize,
    ) -> Result<(), CacheError> {
        let mut new_buf: Option<Vec<u8>> = None;

        if req_size > self.data.len() {
            if req_size > self.max_size {
                if self.can_seek() || req_size - self.discard_count <= self.max_size {
                    // slide the window forward, losing the oldest bytes
                    let ofs = req_size - self.max_size;
                    copy_offset += ofs as isize;
                    req_size = self.max_size;
                } else {
                    return Err(CacheError::WindowCapacityExceeded {
                        needed: req_size,
                        cap: self.max_size,
                    });
                }
            } else {
                let mut size = self.data.len();
                while size < req_size {
                    size *= 2;
                }
                req_size = size;
            }

            if req_size > self.data.len() {
                let mut buf = self.pool.acquire();
                buf.resize(req_size, 0);
                new_buf = Some(buf);
            }
        }

        let fresh = new_buf.is_some();
        let mut end = self.end as isize;

        if copy_contents {
            if copy_offset == 0 && !fresh {
                // window stays put; the caller fills in from the current end
            } else if (copy_offset > 0 && copy_offset < end) || (copy_offset == 0 && fresh) {
                let co = copy_offset as usize;
                let n = self.end - co;
                match new_buf.as_mut() {
                    Some(nb) => nb[..n].copy_from_slice(&self.data[co..self.end]),
                    None => self.data.copy_within(co..self.end, 0),
                }
                self.discard_count = self.discard_count.saturating_sub(co);
            } else if copy_offset < 0 && -copy_offset < end {
                let co = (-copy_offset) as usize;
                if fresh || end <= co as isize {
                    let n = self.end;
                    match new_buf.as_mut() {
                        Some(nb) => nb[co..co + n].copy_from_slice(&self.data[..n]),
                        None => self.data.copy_within(0..n, co),
                    }
                } else {
                    // overlapping backward move in place; cheaper to refill
                    end = copy_offset;
                }
                self.discard_count = 0;
            } else {
                end = copy_offset;
                self.discard_count = 0;
            }

            self.base_offset = (self.base_offset as i64 + copy_offset as i64) as u64;
            end -= copy_offset;
            let cap = new_buf.as_ref().map_or(self.data.len(), Vec::len) as isize;
            if end > cap {
                end = cap;
            }
        } else {
            self.discard_count = 0;
            end = 0;
        }

        self.end = end.max(0) as usize;
        if let Some(nb) = new_buf {
            self.pool.release(std::mem::replace(&mut self.data, nb));
        }

        Ok(())
    }

    fn fill_buffer(
        &mut self,
        offset: u64,
        mut count: usize,
        read_start: usize,
        read_end: usize,
    ) -> Result<usize, CacheError> {
        let read_offset = self.base_offset + read_start as u64;
        let read_count = read_end.saturating_sub(read_start);

        let read_count = self.prepare_stream_for_read(read_count, read_offset)?;
        self.read_stream(read_start, read_count, read_offset)?;

        if self.end < read_start + read_count {
            // short read at end of source
            count = ((self.base_offset + self.end as u64) as i64 - offset as i64).max(0) as usize;
        } else if !self.minimal_read && self.end < self.data.len() {
            // opportunistically finish filling the window
            let extra = self.data.len() - self.end;
            let extra = self.prepare_stream_for_read(extra, self.base_offset + self.end as u64)?;
            if extra > 0 {
                let end = self.end;
                let n = self.source_read(end, extra)?;
                self.end += n;
            }
        }

        Ok(count)
    }

    fn prepare_stream_for_read(
        &mut self,
        mut read_count: usize,
        read_offset: u64,
    ) -> Result<usize, CacheError> {
        if read_count > 0 && self.source_pos != read_offset {
            if read_offset < self.eof_offset {
                match &mut self.source {
                    Source::Seekable(inner) => {
                        inner.seek(SeekFrom::Start(read_offset))?;
                        self.source_pos = read_offset;
                    }
                    Source::Streaming(inner) => {
                        if read_offset < self.source_pos {
                            // cannot rewind a forward-only source
                            read_count = 0;
                        } else {
                            let mut skip = read_offset - self.source_pos;
                            let mut sink = [0u8; 512];
                            while skip > 0 {
                                let chunk = skip.min(sink.len() as u64) as usize;
                                let n = inner.read(&mut sink[..chunk])?;
                                if n == 0 {
                                    self.eof_offset = self.source_pos;
                                    read_count = 0;
                                    break;
                                }
                                self.source_pos += n as u64;
                                skip -= n as u64;
                            }
                        }
                    }
                }
            } else {
                read_count = 0;
            }
        }
        Ok(read_count)
    }

    fn read_stream(
        &mut self,
        mut read_start: usize,
        mut read_count: usize,
        mut read_offset: u64,
    ) -> Result<(), CacheError> {
        while read_count > 0 && read_offset < self.eof_offset {
            let n = self.source_read(read_start, read_count)?;
            if n == 0 {
                break;
            }
            read_start += n;
            read_offset += n as u64;
            read_count -= n;
        }

        if read_start > self.end {
            self.end = read_start;
        }
        Ok(())
    }

    fn source_read(&mut self, start: usize, count: usize) -> Result<usize, CacheError> {
        let buf = &mut self.data[start..start + count];
        let n = match &mut self.source {
            Source::Seekable(inner) => inner.read(buf)?,
            Source::Streaming(inner) => inner.read(buf)?,
        };
        self.source_pos += n as u64;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    struct ForwardOnly(Cursor<Vec<u8>>);

    impl Read for ForwardOnly {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.0.read(buf)
        }
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn sequential_reads_match_source() -> anyhow::Result<()> {
        let data = pattern(100_000);
        let mut cache = StreamCache::new_seekable(Cursor::new(data.clone()))?;

        let mut out = Vec::new();
        let mut buf = [0u8; 1733];
        loop {
            let n = cache.read(&mut buf)?;
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }

        assert_eq!(out, data);
        Ok(())
    }

    #[test]
    fn read_byte_advances_cursor() -> anyhow::Result<()> {
        let mut cache = StreamCache::new_seekable(Cursor::new(vec![10, 20, 30]))?;

        assert_eq!(cache.read_byte()?, Some(10));
        assert_eq!(cache.read_byte()?, Some(20));
        assert_eq!(cache.read_byte()?, Some(30));
        assert_eq!(cache.read_byte()?, None);
        assert_eq!(cache.position(), 3);
        Ok(())
    }

    #[test]
    fn seekable_source_allows_rewind() -> anyhow::Result<()> {
        let data = pattern(500_000);
        let mut cache = StreamCache::new_seekable(Cursor::new(data.clone()))?;

        // read deep into the source, past the window cap
        cache.seek(400_000)?;
        let mut buf = [0u8; 64];
        cache.read(&mut buf)?;
        assert_eq!(buf[..], data[400_000..400_064]);

        // then rewind to the very start
        cache.seek(0)?;
        cache.read(&mut buf)?;
        assert_eq!(buf[..], data[..64]);
        Ok(())
    }

    #[test]
    fn forward_only_rejects_rewind_past_discard() {
        let mut cache = StreamCache::new_streaming(ForwardOnly(Cursor::new(pattern(600_000))));

        let mut buf = [0u8; 4096];
        for _ in 0..100 {
            cache.read(&mut buf).unwrap();
            let pos = cache.position();
            cache.discard_through(pos);
        }

        assert!(matches!(
            cache.seek(0),
            Err(CacheError::RewindPastDiscard { .. })
        ));
    }

    #[test]
    fn forward_only_reads_within_window() {
        let data = pattern(10_000);
        let mut cache = StreamCache::new_streaming(ForwardOnly(Cursor::new(data.clone())));

        let mut buf = [0u8; 100];
        cache.read(&mut buf).unwrap();
        assert_eq!(buf[..], data[..100]);

        // short backward hop inside the retained window is fine
        cache.seek(50).unwrap();
        cache.read(&mut buf).unwrap();
        assert_eq!(buf[..], data[50..150]);
    }

    #[test]
    fn read_byte_at_leaves_cursor_alone() -> anyhow::Result<()> {
        let mut cache = StreamCache::new_seekable(Cursor::new(pattern(1000)))?;

        assert_eq!(cache.read_byte_at(123)?, Some((123 % 251) as u8));
        assert_eq!(cache.position(), 0);
        assert_eq!(cache.read_byte()?, Some(0));
        Ok(())
    }

    #[test]
    fn discard_compacts_once_window_is_consumed() -> anyhow::Result<()> {
        let mut cache = StreamCache::new_seekable(Cursor::new(pattern(200_000)))?;

        let mut buf = [0u8; 8192];
        while cache.read(&mut buf)? > 0 {
            let pos = cache.position();
            cache.discard_through(pos);
            assert!(cache.bytes_filled() <= 262_144);
        }
        Ok(())
    }

    #[test]
    fn lock_is_reentrant_for_owner() -> anyhow::Result<()> {
        let mut cache = StreamCache::new_seekable(Cursor::new(pattern(64)))?;

        cache.take_lock();
        cache.take_lock();
        assert_eq!(cache.read_byte()?, Some(0));
        cache.release_lock();
        assert_eq!(cache.read_byte()?, Some(1));
        cache.release_lock();
        Ok(())
    }
}
