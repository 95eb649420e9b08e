//! Channel-interleaved ring buffer for overlap-add output assembly.
//!
//! Each decoded block is windowed and merged in: the leading flank is summed
//! onto the lapped tail of the previous block, the remainder is written
//! fresh. Finished samples are drained from the front in interleaved order.

pub struct RingBuffer {
    buffer: Vec<f32>,
    start: usize,
    end: usize,
    channels: usize,
}

impl RingBuffer {
    pub fn new(size: usize, channels: usize) -> Self {
        Self {
            buffer: vec![0f32; size],
            start: 0,
            end: 0,
            channels,
        }
    }

    /// Number of interleaved samples currently held.
    pub fn len(&self) -> usize {
        (self.end + self.buffer.len() - self.start) % self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn clear(&mut self) {
        self.start = 0;
        self.end = 0;
    }

    /// Grows the backing store to at least `size` slots, keeping unread data.
    ///
    /// One extra slot per channel stays reserved so a completely full buffer
    /// is distinguishable from an empty one.
    pub fn ensure_size(&mut self, mut size: usize) {
        size += self.channels;
        if self.buffer.len() < size {
            let mut temp = vec![0f32; size];

            let tail = self.buffer.len() - self.start;
            temp[..tail].copy_from_slice(&self.buffer[self.start..]);
            if self.end < self.start {
                temp[tail..tail + self.end].copy_from_slice(&self.buffer[..self.end]);
            }

            let len = self.len();
            self.start = 0;
            self.end = len;
            self.buffer = temp;
        }
    }

    /// Merges one channel of a windowed block into the buffer.
    ///
    /// `index` is the channel-frame offset of `pcm[start]` relative to the
    /// unread region; it may be negative for the very first block, whose
    /// lapped lead-in has nothing to blend against. Samples before
    /// `switch_point` are summed onto existing content, samples from there to
    /// `end` overwrite.
    #[allow(clippy::too_many_arguments)]
    pub fn write(
        &mut self,
        channel: usize,
        index: isize,
        start: isize,
        switch_point: isize,
        end: isize,
        pcm: &[f32],
        window: &[f32],
    ) {
        let buf_len = self.buffer.len() as isize;
        let mut start = start;

        let mut idx = (index + start) * self.channels as isize + channel as isize + self.start as isize;
        while idx >= buf_len {
            idx -= buf_len;
        }
        if idx < 0 {
            start -= index;
            idx = channel as isize;
        }

        // Blend the lapped region.
        while idx < buf_len && start < switch_point {
            self.buffer[idx as usize] += pcm[start as usize] * window[start as usize];
            idx += self.channels as isize;
            start += 1;
        }
        if idx >= buf_len {
            idx -= buf_len;
            while start < switch_point {
                self.buffer[idx as usize] += pcm[start as usize] * window[start as usize];
                idx += self.channels as isize;
                start += 1;
            }
        }

        // Write the rest fresh.
        while idx < buf_len && start < end {
            self.buffer[idx as usize] = pcm[start as usize] * window[start as usize];
            idx += self.channels as isize;
            start += 1;
        }
        if idx >= buf_len {
            idx -= buf_len;
            while start < end {
                self.buffer[idx as usize] = pcm[start as usize] * window[start as usize];
                idx += self.channels as isize;
                start += 1;
            }
        }

        self.end = idx as usize;
    }

    /// Copies `dst.len()` interleaved samples out and releases them.
    pub fn copy_to(&mut self, dst: &mut [f32]) {
        let count = dst.len();
        let start = self.start;
        self.remove_items(count);

        let avail = (self.end + self.buffer.len() - start) % self.buffer.len();
        debug_assert!(count <= avail);

        let cnt = count.min(self.buffer.len() - start);
        dst[..cnt].copy_from_slice(&self.buffer[start..start + cnt]);
        if cnt < count {
            dst[cnt..].copy_from_slice(&self.buffer[..count - cnt]);
        }
    }

    /// Releases `count` interleaved samples from the front.
    pub fn remove_items(&mut self, count: usize) {
        let cnt = (count + self.start) % self.buffer.len();
        debug_assert!(if self.end > self.start {
            cnt <= self.end && cnt >= self.start
        } else {
            cnt >= self.start || cnt <= self.end
        });

        self.start = cnt;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat_window(len: usize) -> Vec<f32> {
        vec![1.0; len]
    }

    #[test]
    fn write_then_copy_round_trips() {
        let mut ring = RingBuffer::new(64, 1);
        let pcm: Vec<f32> = (0..8).map(|i| i as f32).collect();
        let window = flat_window(8);

        // No previous block, nothing to blend against.
        ring.write(0, 0, 0, 0, 8, &pcm, &window);
        assert_eq!(ring.len(), 8);

        let mut out = vec![0f32; 8];
        ring.copy_to(&mut out);
        assert_eq!(out, pcm);
        assert!(ring.is_empty());
    }

    #[test]
    fn lapped_region_sums_fresh_region_overwrites() {
        let mut ring = RingBuffer::new(64, 1);
        let window = flat_window(4);

        ring.write(0, 0, 0, 0, 4, &[1.0, 1.0, 1.0, 1.0], &window);
        // Second write laps its first two samples over the previous tail.
        ring.write(0, 2, 0, 2, 4, &[0.5, 0.5, 2.0, 2.0], &window);

        let mut out = vec![0f32; 6];
        ring.copy_to(&mut out);
        assert_eq!(out, [1.0, 1.0, 1.5, 1.5, 2.0, 2.0]);
    }

    #[test]
    fn interleaves_channels() {
        let mut ring = RingBuffer::new(64, 2);
        let window = flat_window(4);

        ring.write(0, 0, 0, 0, 4, &[1.0, 2.0, 3.0, 4.0], &window);
        ring.write(1, 0, 0, 0, 4, &[-1.0, -2.0, -3.0, -4.0], &window);

        let mut out = vec![0f32; 8];
        ring.copy_to(&mut out);
        assert_eq!(out, [1.0, -1.0, 2.0, -2.0, 3.0, -3.0, 4.0, -4.0]);
    }

    #[test]
    fn ensure_size_preserves_unread_data() {
        let mut ring = RingBuffer::new(8, 1);
        let window = flat_window(4);
        ring.write(0, 0, 0, 0, 4, &[1.0, 2.0, 3.0, 4.0], &window);

        ring.ensure_size(128);
        assert_eq!(ring.len(), 4);

        let mut out = vec![0f32; 4];
        ring.copy_to(&mut out);
        assert_eq!(out, [1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn wraps_around_capacity() {
        let mut ring = RingBuffer::new(9, 1);
        let window = flat_window(4);

        for round in 0..5 {
            let base = round as f32 * 4.0;
            let pcm = [base, base + 1.0, base + 2.0, base + 3.0];
            ring.write(0, 0, 0, 0, 4, &pcm, &window);

            let mut out = vec![0f32; 4];
            ring.copy_to(&mut out);
            assert_eq!(out, pcm);
        }
    }
}
