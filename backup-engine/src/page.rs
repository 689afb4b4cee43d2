//! On-disk page layout: header parsing, validity checks and page checksums.
//!
//! Pages are `BLOCK_SIZE` bytes with a 24 byte little-endian header:
//!
//! | offset | field              |
//! |--------|--------------------|
//! | 0      | lsn (u64)          |
//! | 8      | checksum (u16)     |
//! | 10     | flags (u16)        |
//! | 12     | lower (u16)        |
//! | 14     | upper (u16)        |
//! | 16     | special (u16)      |
//! | 18     | size and version   |
//! | 20     | prune xid (u32)    |

use std::fmt;

use crate::catalog::Lsn;

pub const BLOCK_SIZE: usize = 8192;
/// Blocks per relation segment file.
pub const RELSEG_SIZE: u32 = 131_072;
pub const PAGE_HEADER_SIZE: usize = 24;
pub const PAGE_LAYOUT_VERSION: u16 = 4;

const VALID_FLAG_BITS: u16 = 0x0007;
const MAX_ALIGN: u16 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageHeader {
    pub lsn: Lsn,
    pub checksum: u16,
    pub flags: u16,
    pub lower: u16,
    pub upper: u16,
    pub special: u16,
    pub pagesize_version: u16,
    pub prune_xid: u32,
}

impl PageHeader {
    pub fn parse(page: &[u8]) -> Option<Self> {
        if page.len() < PAGE_HEADER_SIZE {
            return None;
        }
        let u16_at = |off: usize| u16::from_le_bytes([page[off], page[off + 1]]);
        let mut lsn = [0u8; 8];
        lsn.copy_from_slice(&page[0..8]);
        let mut xid = [0u8; 4];
        xid.copy_from_slice(&page[20..24]);

        Some(Self {
            lsn: Lsn(u64::from_le_bytes(lsn)),
            checksum: u16_at(8),
            flags: u16_at(10),
            lower: u16_at(12),
            upper: u16_at(14),
            special: u16_at(16),
            pagesize_version: u16_at(18),
            prune_xid: u32::from_le_bytes(xid),
        })
    }

    fn page_size(&self) -> usize {
        (self.pagesize_version & 0xFF00) as usize
    }

    fn is_sane(&self) -> bool {
        self.page_size() == BLOCK_SIZE
            && self.flags & !VALID_FLAG_BITS == 0
            && self.lower as usize >= PAGE_HEADER_SIZE
            && self.lower <= self.upper
            && self.upper <= self.special
            && self.special as usize <= BLOCK_SIZE
            && self.special % MAX_ALIGN == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageDefect {
    ShortRead(usize),
    Header,
    Checksum { stored: u16, computed: u16 },
}

impl fmt::Display for PageDefect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PageDefect::ShortRead(n) => write!(f, "read {} of {} bytes", n, BLOCK_SIZE),
            PageDefect::Header => write!(f, "page header is invalid"),
            PageDefect::Checksum { stored, computed } => write!(
                f,
                "page checksum mismatch: stored {:#06x}, computed {:#06x}",
                stored, computed
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageState {
    /// A never-initialized page; legal anywhere in a relation.
    Zeroed,
    Valid { lsn: Lsn },
    Invalid(PageDefect),
}

impl PageState {
    pub fn is_usable(&self) -> bool {
        !matches!(self, PageState::Invalid(_))
    }
}

/// Block number counted from the start of the relation.
pub fn absolute_block(segno: u32, blkno: u32) -> u32 {
    segno.wrapping_mul(RELSEG_SIZE).wrapping_add(blkno)
}

/// Page checksum: CRC-32 of the page with its checksum field zeroed, salted
/// with the absolute block number and folded into a non-zero 16 bit value.
pub fn checksum(page: &[u8], abs_block: u32) -> u16 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&page[..8]);
    hasher.update(&[0, 0]);
    hasher.update(&page[10..BLOCK_SIZE]);
    hasher.update(&abs_block.to_le_bytes());
    let crc = hasher.finalize();
    (((crc ^ (crc >> 16)) % 65535) + 1) as u16
}

pub fn set_checksum(page: &mut [u8], abs_block: u32) {
    let sum = checksum(page, abs_block);
    page[8..10].copy_from_slice(&sum.to_le_bytes());
}

/// Classify a page read from disk.
pub fn inspect(page: &[u8], abs_block: u32, checksums_enabled: bool) -> PageState {
    if page.len() < BLOCK_SIZE {
        return PageState::Invalid(PageDefect::ShortRead(page.len()));
    }

    let Some(header) = PageHeader::parse(page) else {
        return PageState::Invalid(PageDefect::Header);
    };

    if header.upper == 0 && page.iter().all(|b| *b == 0) {
        return PageState::Zeroed;
    }

    if !header.is_sane() {
        return PageState::Invalid(PageDefect::Header);
    }

    if checksums_enabled {
        let computed = checksum(page, abs_block);
        if computed != header.checksum {
            return PageState::Invalid(PageDefect::Checksum {
                stored: header.checksum,
                computed,
            });
        }
    }

    PageState::Valid { lsn: header.lsn }
}

/// Build an initialized page with the given LSN whose free space is filled
/// with `fill`. Used by tooling and tests that need realistic relation files.
pub fn new_page(lsn: Lsn, abs_block: u32, fill: u8) -> Vec<u8> {
    let mut page = vec![0u8; BLOCK_SIZE];
    let lower = PAGE_HEADER_SIZE as u16;
    let upper = (BLOCK_SIZE / 2) as u16;
    let special = BLOCK_SIZE as u16;

    page[0..8].copy_from_slice(&lsn.0.to_le_bytes());
    page[12..14].copy_from_slice(&lower.to_le_bytes());
    page[14..16].copy_from_slice(&upper.to_le_bytes());
    page[16..18].copy_from_slice(&special.to_le_bytes());
    page[18..20].copy_from_slice(&(BLOCK_SIZE as u16 | PAGE_LAYOUT_VERSION).to_le_bytes());
    for byte in &mut page[upper as usize..] {
        *byte = fill;
    }
    set_checksum(&mut page, abs_block);
    page
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_page_is_valid() {
        let page = new_page(Lsn(0x1000), 7, 0xAB);
        assert_eq!(inspect(&page, 7, true), PageState::Valid { lsn: Lsn(0x1000) });
        assert_eq!(PageHeader::parse(&page).map(|h| h.lsn), Some(Lsn(0x1000)));
    }

    #[test]
    fn test_zeroed_page_is_valid() {
        let page = vec![0u8; BLOCK_SIZE];
        assert_eq!(inspect(&page, 0, true), PageState::Zeroed);
        assert!(inspect(&page, 0, true).is_usable());
    }

    #[test]
    fn test_checksum_depends_on_block_number() {
        let page = new_page(Lsn(1), 3, 1);
        assert!(matches!(
            inspect(&page, 4, true),
            PageState::Invalid(PageDefect::Checksum { .. })
        ));
        // Without checksums only the header is checked.
        assert!(inspect(&page, 4, false).is_usable());
    }

    #[test]
    fn test_flipped_byte_fails_checksum() {
        let mut page = new_page(Lsn(1), 0, 0x11);
        page[6000] ^= 0xFF;
        assert!(!inspect(&page, 0, true).is_usable());
    }

    #[test]
    fn test_bad_header_is_invalid() {
        let mut page = new_page(Lsn(1), 0, 0x11);
        // upper below lower
        page[14..16].copy_from_slice(&8u16.to_le_bytes());
        assert_eq!(
            inspect(&page, 0, false),
            PageState::Invalid(PageDefect::Header)
        );
    }

    #[test]
    fn test_short_read_is_invalid() {
        let page = vec![0u8; 100];
        assert_eq!(
            inspect(&page, 0, false),
            PageState::Invalid(PageDefect::ShortRead(100))
        );
    }

    #[test]
    fn test_checksum_never_zero() {
        for blk in 0..64 {
            let page = new_page(Lsn(blk as u64), blk, blk as u8);
            assert_ne!(checksum(&page, blk), 0);
        }
    }

    #[test]
    fn test_absolute_block() {
        assert_eq!(absolute_block(0, 5), 5);
        assert_eq!(absolute_block(2, 1), 2 * RELSEG_SIZE + 1);
    }
}
