use std::io::{self, BufWriter, Seek, SeekFrom, Write};

/// Output sample encodings supported by the writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleFormat {
    /// IEEE float, 32 bits per sample.
    Float32,
    /// Signed integer, 16 bits per sample.
    Pcm16,
}

impl SampleFormat {
    fn format_tag(self) -> u16 {
        match self {
            SampleFormat::Float32 => 3,
            SampleFormat::Pcm16 => 1,
        }
    }

    fn bits_per_sample(self) -> u32 {
        match self {
            SampleFormat::Float32 => 32,
            SampleFormat::Pcm16 => 16,
        }
    }
}

/// RIFF WAVE file writer for decoded audio (.wav extension)
pub struct WavWriter<W: Write + Seek> {
    writer: BufWriter<W>,
    riff_size_position: u64,
    data_size_position: u64,
    data_written: u64,
    sample_rate: u32,
    channels: u32,
    format: SampleFormat,
}

impl<W: Write + Seek> WavWriter<W> {
    /// Create a new WAV writer
    pub fn new(writer: W) -> Self {
        Self {
            writer: BufWriter::new(writer),
            riff_size_position: 0,
            data_size_position: 0,
            data_written: 0,
            sample_rate: 48000,
            channels: 2,
            format: SampleFormat::Float32,
        }
    }

    /// Configure audio format parameters
    pub fn configure_audio_format(
        &mut self,
        sample_rate: u32,
        channels: u32,
        format: SampleFormat,
    ) -> io::Result<()> {
        if self.data_written > 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "Cannot change format after writing data",
            ));
        }

        self.sample_rate = sample_rate;
        self.channels = channels;
        self.format = format;
        Ok(())
    }

    /// Write the RIFF/fmt/data headers
    pub fn write_header(&mut self) -> io::Result<()> {
        self.writer.write_all(b"RIFF")?;
        self.riff_size_position = self.writer.stream_position()?;
        self.writer.write_all(&0u32.to_le_bytes())?; // File size (to be updated later)
        self.writer.write_all(b"WAVE")?;

        self.writer.write_all(b"fmt ")?;
        self.writer.write_all(&16u32.to_le_bytes())?;
        self.writer
            .write_all(&self.format.format_tag().to_le_bytes())?;
        self.writer
            .write_all(&(self.channels as u16).to_le_bytes())?;
        self.writer.write_all(&self.sample_rate.to_le_bytes())?;

        let bytes_per_sample = self.format.bits_per_sample() / 8;
        let byte_rate = self.sample_rate * self.channels * bytes_per_sample;
        self.writer.write_all(&byte_rate.to_le_bytes())?;

        let block_align = self.channels * bytes_per_sample;
        self.writer.write_all(&(block_align as u16).to_le_bytes())?;
        self.writer
            .write_all(&(self.format.bits_per_sample() as u16).to_le_bytes())?;

        self.writer.write_all(b"data")?;
        self.data_size_position = self.writer.stream_position()?;
        self.writer.write_all(&0u32.to_le_bytes())?; // Data size (to be updated later)

        Ok(())
    }

    /// Write interleaved samples in the configured encoding
    pub fn write_samples(&mut self, samples: &[f32]) -> io::Result<()> {
        match self.format {
            SampleFormat::Float32 => {
                for &sample in samples {
                    self.writer.write_all(&sample.to_le_bytes())?;
                    self.data_written += 4;
                }
            }
            SampleFormat::Pcm16 => {
                for &sample in samples {
                    let scaled = (sample.clamp(-1.0, 1.0) * 32767.0).round() as i16;
                    self.writer.write_all(&scaled.to_le_bytes())?;
                    self.data_written += 2;
                }
            }
        }
        Ok(())
    }

    /// Finish writing and update file size headers
    pub fn finish(&mut self) -> io::Result<()> {
        self.writer.flush()?;

        let current_pos = self.writer.stream_position()?;

        self.writer.seek(SeekFrom::Start(self.data_size_position))?;
        self.writer
            .write_all(&(self.data_written as u32).to_le_bytes())?;

        // RIFF size excludes the tag and the size field itself
        self.writer.seek(SeekFrom::Start(self.riff_size_position))?;
        self.writer
            .write_all(&((current_pos - 8) as u32).to_le_bytes())?;

        self.writer.seek(SeekFrom::Start(current_pos))?;
        self.writer.flush()?;

        Ok(())
    }

    /// Get the underlying writer
    pub fn into_inner(self) -> io::Result<W> {
        self.writer.into_inner().map_err(|e| e.into_error())
    }

    /// Get statistics about written data
    pub fn stats(&self) -> WavStats {
        WavStats {
            data_written: self.data_written,
            sample_rate: self.sample_rate,
            channels: self.channels,
            format: self.format,
        }
    }
}

/// Statistics about WAV file writing
#[derive(Debug, Clone)]
pub struct WavStats {
    pub data_written: u64,
    pub sample_rate: u32,
    pub channels: u32,
    pub format: SampleFormat,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_wav_header_write() -> io::Result<()> {
        let cursor = Cursor::new(Vec::new());
        let mut writer = WavWriter::new(cursor);

        writer.configure_audio_format(44100, 2, SampleFormat::Float32)?;
        writer.write_header()?;

        let cursor = writer.into_inner()?;
        let buffer = cursor.into_inner();

        assert_eq!(&buffer[0..4], b"RIFF");
        assert_eq!(&buffer[8..12], b"WAVE");
        assert_eq!(&buffer[12..16], b"fmt ");
        // IEEE float format tag
        assert_eq!(u16::from_le_bytes([buffer[20], buffer[21]]), 3);
        assert_eq!(&buffer[36..40], b"data");

        Ok(())
    }

    #[test]
    fn test_wav_sample_write() -> io::Result<()> {
        let cursor = Cursor::new(Vec::new());
        let mut writer = WavWriter::new(cursor);

        writer.configure_audio_format(44100, 2, SampleFormat::Float32)?;
        writer.write_header()?;
        writer.write_samples(&[0.5, -0.5])?;

        let stats = writer.stats();
        assert_eq!(stats.data_written, 8); // 2 samples x 4 bytes each

        writer.finish()?;

        let cursor = writer.into_inner()?;
        let buffer = cursor.into_inner();
        let data_size = u32::from_le_bytes(buffer[40..44].try_into().unwrap());
        assert_eq!(data_size, 8);

        Ok(())
    }

    #[test]
    fn test_pcm16_conversion_clamps() -> io::Result<()> {
        let cursor = Cursor::new(Vec::new());
        let mut writer = WavWriter::new(cursor);

        writer.configure_audio_format(8000, 1, SampleFormat::Pcm16)?;
        writer.write_header()?;
        writer.write_samples(&[2.0, -2.0, 0.0])?;
        writer.finish()?;

        let cursor = writer.into_inner()?;
        let buffer = cursor.into_inner();
        let data = &buffer[44..];
        assert_eq!(i16::from_le_bytes([data[0], data[1]]), 32767);
        assert_eq!(i16::from_le_bytes([data[2], data[3]]), -32767);
        assert_eq!(i16::from_le_bytes([data[4], data[5]]), 0);

        Ok(())
    }
}
