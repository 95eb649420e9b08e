use std::io;
use std::path::{Path, PathBuf};

use anyhow::Result;
use vorbis::process::reader::OggVorbisReader;

/// Unified input handling for file and pipe sources.
///
/// Files open seekable, which enables duration queries and seeking; stdin
/// (given as "-") opens in forward-only streaming mode.
pub struct Input {
    path: PathBuf,
    is_pipe: bool,
}

impl Input {
    pub fn new<P: AsRef<Path>>(input_path: P) -> Self {
        let path = input_path.as_ref().to_path_buf();
        let is_pipe = path.to_string_lossy() == "-";
        Self { path, is_pipe }
    }

    /// Check if this is pipe input
    pub fn is_pipe(&self) -> bool {
        self.is_pipe
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open a decoder over this input.
    pub fn open(&self) -> Result<OggVorbisReader> {
        let reader = if self.is_pipe {
            OggVorbisReader::new_streaming(io::stdin())?
        } else {
            OggVorbisReader::open(&self.path)?
        };
        Ok(reader)
    }
}
