use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// A thread-safe pool of reusable byte buffers.
///
/// The stream cache saves displaced window contents here and the demuxer
/// reuses them for merged packet assembly, keeping page-sized allocations
/// off the steady-state decode path.
#[derive(Debug)]
pub struct BufferPool {
    pool: Arc<Mutex<VecDeque<Vec<u8>>>>,
    max_size: usize,
    buffer_capacity: usize,
}

impl BufferPool {
    /// Creates a new buffer pool with the specified parameters.
    ///
    /// # Arguments
    ///
    /// * `max_size` - Maximum number of buffers to keep in the pool
    /// * `buffer_capacity` - Initial capacity for each buffer
    pub fn new(max_size: usize, buffer_capacity: usize) -> Self {
        Self {
            pool: Arc::new(Mutex::new(VecDeque::with_capacity(max_size))),
            max_size,
            buffer_capacity,
        }
    }

    /// Acquires a buffer from the pool or creates a new one if none available.
    pub fn acquire(&self) -> Vec<u8> {
        let mut pool = self.pool.lock().unwrap();
        pool.pop_front()
            .unwrap_or_else(|| Vec::with_capacity(self.buffer_capacity))
    }

    /// Returns a buffer to the pool for reuse.
    pub fn release(&self, mut buffer: Vec<u8>) {
        buffer.clear();

        let mut pool = self.pool.lock().unwrap();
        if pool.len() < self.max_size {
            pool.push_back(buffer);
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        // A maximal Ogg page is 65307 bytes; round up to keep refills rare.
        Self::new(8, 64 * 1024)
    }
}

#[test]
fn pool_recycles_buffers() {
    let pool = BufferPool::new(2, 128);

    let mut a = pool.acquire();
    a.extend_from_slice(b"stale");
    pool.release(a);

    let b = pool.acquire();
    assert!(b.is_empty());
    assert!(b.capacity() >= 5);
}

#[test]
fn pool_caps_retained_buffers() {
    let pool = BufferPool::new(1, 16);
    pool.release(Vec::with_capacity(16));
    pool.release(Vec::with_capacity(16));

    // Only one buffer may be retained; both acquires still succeed.
    let _ = pool.acquire();
    let _ = pool.acquire();
}
