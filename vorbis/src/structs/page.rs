//! Ogg page capture.
//!
//! A page is a 27-byte header, a lacing table of up to 255 segment lengths,
//! and the segment bytes. Lacing values of 255 chain into the next segment,
//! so a packet ends at the first value below 255; a page whose final lacing
//! value is 255 leaves its last packet continued on the next page.

use crate::process::cache::StreamCache;
use crate::utils::crc::{CRC_OGG_PAGE_ALG, Crc32};
use crate::utils::errors::PageError;

pub const CAPTURE_PATTERN: [u8; 4] = *b"OggS";

pub const FLAG_CONTINUATION: u8 = 0x01;
pub const FLAG_BOS: u8 = 0x02;
pub const FLAG_EOS: u8 = 0x04;

pub const CRC_OGG_PAGE: Crc32 = Crc32::new(&CRC_OGG_PAGE_ALG);

/// Parsed page header plus the layout of its packet payloads.
#[derive(Debug, Clone)]
pub struct PageHeader {
    pub serial: u32,
    pub flags: u8,
    pub granule_position: i64,
    pub sequence_number: u32,
    pub data_offset: u64,
    pub packet_sizes: Vec<usize>,
    pub last_packet_continues: bool,
    pub is_resync: bool,
}

impl PageHeader {
    pub fn is_continuation(&self) -> bool {
        self.flags & FLAG_CONTINUATION != 0
    }

    pub fn is_bos(&self) -> bool {
        self.flags & FLAG_BOS != 0
    }

    pub fn is_eos(&self) -> bool {
        self.flags & FLAG_EOS != 0
    }

    /// Offset of the first byte after this page.
    pub fn next_page_offset(&self) -> u64 {
        let body: usize = self.packet_sizes.iter().sum();
        self.data_offset + body as u64
    }

    /// Reads and validates one page at `position`.
    ///
    /// The CRC covers the entire page with the checksum field zeroed. Any
    /// mismatch, short read, or wrong capture pattern is a page-level error
    /// the caller recovers from by resyncing.
    pub fn read(cache: &mut StreamCache, position: u64) -> Result<Self, PageError> {
        cache.seek(position)?;

        let mut header = [0u8; 27];
        if cache.read(&mut header)? != 27 {
            return Err(PageError::TruncatedPage);
        }

        if header[..4] != CAPTURE_PATTERN {
            return Err(PageError::MissingCapture(u32::from_be_bytes(
                header[..4].try_into().unwrap(),
            )));
        }

        if header[4] != 0 {
            return Err(PageError::UnsupportedVersion(header[4]));
        }

        let flags = header[5];
        let granule_position = i64::from_le_bytes(header[6..14].try_into().unwrap());
        let serial = u32::from_le_bytes(header[14..18].try_into().unwrap());
        let sequence_number = u32::from_le_bytes(header[18..22].try_into().unwrap());
        let crc_read = u32::from_le_bytes(header[22..26].try_into().unwrap());

        // checksum runs with the CRC field zeroed
        let mut crc = CRC_OGG_PAGE.update(CRC_OGG_PAGE.init, &header[..22]);
        crc = CRC_OGG_PAGE.update(crc, &[0, 0, 0, 0]);
        crc = CRC_OGG_PAGE.update(crc, &header[26..27]);

        let seg_count = header[26] as usize;
        let mut lacing = [0u8; 255];
        if cache.read(&mut lacing[..seg_count])? != seg_count {
            return Err(PageError::TruncatedPage);
        }
        crc = CRC_OGG_PAGE.update(crc, &lacing[..seg_count]);

        let mut packet_sizes = Vec::new();
        let mut last_packet_continues = false;
        let mut body_len = 0usize;
        let mut open = false;
        for &lace in &lacing[..seg_count] {
            if !open {
                packet_sizes.push(0);
                open = true;
            }
            *packet_sizes.last_mut().unwrap() += lace as usize;
            if lace < 255 {
                open = false;
                last_packet_continues = false;
            } else {
                last_packet_continues = true;
            }
            body_len += lace as usize;
        }

        let data_offset = position + 27 + seg_count as u64;

        let mut body = vec![0u8; body_len];
        if cache.read(&mut body)? != body_len {
            return Err(PageError::TruncatedPage);
        }
        crc = CRC_OGG_PAGE.update(crc, &body);

        if crc != crc_read {
            return Err(PageError::CrcMismatch {
                calculated: crc,
                read: crc_read,
            });
        }

        Ok(Self {
            serial,
            flags,
            granule_position,
            sequence_number,
            data_offset,
            packet_sizes,
            last_packet_continues,
            is_resync: false,
        })
    }
}

/// Builds a valid page image for synthetic test streams.
#[cfg(test)]
pub(crate) fn build_page(
    serial: u32,
    sequence: u32,
    granule: i64,
    flags: u8,
    packets: &[&[u8]],
    last_continues: bool,
) -> Vec<u8> {
    let mut lacing = Vec::new();
    for (i, packet) in packets.iter().enumerate() {
        let mut remaining = packet.len();
        loop {
            if remaining >= 255 {
                lacing.push(255u8);
                remaining -= 255;
            } else {
                // a continued packet's run stays open (no terminating lace)
                if !(last_continues && i == packets.len() - 1 && remaining == 0) {
                    lacing.push(remaining as u8);
                }
                break;
            }
        }
    }
    assert!(lacing.len() <= 255);

    let mut page = Vec::new();
    page.extend_from_slice(&CAPTURE_PATTERN);
    page.push(0);
    page.push(flags);
    page.extend_from_slice(&granule.to_le_bytes());
    page.extend_from_slice(&serial.to_le_bytes());
    page.extend_from_slice(&sequence.to_le_bytes());
    page.extend_from_slice(&[0, 0, 0, 0]);
    page.push(lacing.len() as u8);
    page.extend_from_slice(&lacing);
    for packet in packets {
        page.extend_from_slice(packet);
    }

    let crc = CRC_OGG_PAGE.update(CRC_OGG_PAGE.init, &page);
    page[22..26].copy_from_slice(&crc.to_le_bytes());
    page
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn cache_over(bytes: Vec<u8>) -> StreamCache {
        StreamCache::new_seekable(Cursor::new(bytes)).unwrap()
    }

    #[test]
    fn parses_simple_page() {
        let page = build_page(0x1234, 7, 4096, FLAG_BOS, &[b"hello", b"world!!"], false);
        let mut cache = cache_over(page);

        let hdr = PageHeader::read(&mut cache, 0).unwrap();
        assert_eq!(hdr.serial, 0x1234);
        assert_eq!(hdr.sequence_number, 7);
        assert_eq!(hdr.granule_position, 4096);
        assert!(hdr.is_bos());
        assert!(!hdr.is_eos());
        assert_eq!(hdr.packet_sizes, vec![5, 7]);
        assert!(!hdr.last_packet_continues);
        assert_eq!(hdr.data_offset, 27 + 2);
    }

    #[test]
    fn long_packet_spans_lacing_values() {
        let long = vec![0xAB; 700];
        let page = build_page(1, 0, -1, 0, &[&long], false);
        let mut cache = cache_over(page);

        let hdr = PageHeader::read(&mut cache, 0).unwrap();
        // 255 + 255 + 190 chain into one packet
        assert_eq!(hdr.packet_sizes, vec![700]);
        assert_eq!(hdr.granule_position, -1);
    }

    #[test]
    fn continued_packet_is_flagged() {
        let exactly = vec![1u8; 510];
        let page = build_page(1, 0, -1, 0, &[&exactly], true);
        let mut cache = cache_over(page);

        let hdr = PageHeader::read(&mut cache, 0).unwrap();
        assert_eq!(hdr.packet_sizes, vec![510]);
        assert!(hdr.last_packet_continues);
    }

    #[test]
    fn crc_corruption_is_detected() {
        let mut page = build_page(1, 0, 0, 0, &[b"payload"], false);
        let body_at = page.len() - 3;
        page[body_at] ^= 0x40;
        let mut cache = cache_over(page);

        assert!(matches!(
            PageHeader::read(&mut cache, 0),
            Err(PageError::CrcMismatch { .. })
        ));
    }

    #[test]
    fn wrong_capture_pattern_rejected() {
        let mut page = build_page(1, 0, 0, 0, &[b"payload"], false);
        page[0] = b'X';
        let mut cache = cache_over(page);

        assert!(matches!(
            PageHeader::read(&mut cache, 0),
            Err(PageError::MissingCapture(_))
        ));
    }

    #[test]
    fn truncated_page_rejected() {
        let page = build_page(1, 0, 0, 0, &[b"payload"], false);
        let mut cache = cache_over(page[..20].to_vec());

        assert!(matches!(
            PageHeader::read(&mut cache, 0),
            Err(PageError::TruncatedPage)
        ));
    }
}
