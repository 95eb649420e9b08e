pub mod bits;
pub mod buffer_pool;
pub mod crc;
pub mod errors;
pub mod mdct;
pub mod ring;
pub mod window;
