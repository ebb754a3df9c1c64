//! Page format
//!
//! Every node page starts with a 24-byte header:
//!
//! ```text
//! +------------------+ 0
//! | Magic 0x5450     | 2 bytes (u16 LE)
//! | Page type        | 1 byte
//! | Key type         | 1 byte
//! | Entry count      | 4 bytes (u32 LE)
//! | Free offset      | 4 bytes (u32 LE, end of the used body)
//! | Next page        | 8 bytes (u64 LE, 0 = none)
//! | CRC32            | 4 bytes (u32 LE)
//! +------------------+ 24
//! | Body             | free_offset - 24 bytes
//! | Zero padding     | up to the page size
//! +------------------+
//! ```
//!
//! The checksum covers the whole page except the checksum field itself.
//! Pages are always rewritten whole.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{Result, StorageError};

/// Page number within a page file; page 0 is the meta page
pub type PageId = u64;

/// Page magic: "TP"
pub const PAGE_MAGIC: u16 = 0x5450;

/// Size of the page header
pub const PAGE_HEADER_SIZE: usize = 24;

/// Smallest allowed page size; page sizes are multiples of it
pub const MIN_PAGE_SIZE: usize = 512;

const CRC_OFFSET: usize = 20;

/// Kind of page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PageType {
    /// Sorted entries
    Leaf = 1,
    /// Separator keys and child pointers
    Internal = 2,
    /// Member of the free list
    Free = 3,
}

impl PageType {
    /// Parse a page type byte
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(PageType::Leaf),
            2 => Some(PageType::Internal),
            3 => Some(PageType::Free),
            _ => None,
        }
    }
}

/// Decoded page header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageHeader {
    /// Kind of page
    pub page_type: PageType,
    /// Key type tag of the owning index
    pub key_type: u8,
    /// Entries (leaf) or keys (internal)
    pub count: u32,
    /// Next page in a chain, 0 for none
    pub next: PageId,
}

/// Check a configured page size
pub fn validate_page_size(page_size: usize) -> Result<()> {
    if page_size < MIN_PAGE_SIZE || page_size % MIN_PAGE_SIZE != 0 || page_size > u32::MAX as usize
    {
        return Err(StorageError::InvalidConfig(format!(
            "page size {} must be a multiple of {} and at least {}",
            page_size, MIN_PAGE_SIZE, MIN_PAGE_SIZE
        )));
    }
    Ok(())
}

fn checksum(page: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&page[..CRC_OFFSET]);
    hasher.update(&page[PAGE_HEADER_SIZE..]);
    hasher.finalize()
}

/// Build a full page image from a header and body
pub fn encode_page(header: &PageHeader, body: &[u8], page_size: usize) -> Result<Vec<u8>> {
    let used = PAGE_HEADER_SIZE + body.len();
    if used > page_size {
        return Err(StorageError::Corruption(format!(
            "page body of {} bytes overflows a {} byte page",
            body.len(),
            page_size
        )));
    }
    let mut page = vec![0u8; page_size];
    LittleEndian::write_u16(&mut page[0..2], PAGE_MAGIC);
    page[2] = header.page_type as u8;
    page[3] = header.key_type;
    LittleEndian::write_u32(&mut page[4..8], header.count);
    LittleEndian::write_u32(&mut page[8..12], used as u32);
    LittleEndian::write_u64(&mut page[12..20], header.next);
    page[PAGE_HEADER_SIZE..used].copy_from_slice(body);
    let crc = checksum(&page);
    LittleEndian::write_u32(&mut page[CRC_OFFSET..PAGE_HEADER_SIZE], crc);
    Ok(page)
}

/// Verify a page image and split it into header and body
pub fn decode_page(page: &[u8]) -> Result<(PageHeader, &[u8])> {
    if page.len() < PAGE_HEADER_SIZE {
        return Err(StorageError::Corruption("page too short".to_string()));
    }
    if LittleEndian::read_u16(&page[0..2]) != PAGE_MAGIC {
        return Err(StorageError::Corruption("invalid page magic".to_string()));
    }
    let stored = LittleEndian::read_u32(&page[CRC_OFFSET..PAGE_HEADER_SIZE]);
    let computed = checksum(page);
    if stored != computed {
        return Err(StorageError::Corruption(format!(
            "page checksum mismatch: expected {:08x}, computed {:08x}",
            stored, computed
        )));
    }
    let page_type = PageType::from_u8(page[2])
        .ok_or_else(|| StorageError::Corruption(format!("unknown page type {}", page[2])))?;
    let used = LittleEndian::read_u32(&page[8..12]) as usize;
    if used < PAGE_HEADER_SIZE || used > page.len() {
        return Err(StorageError::Corruption(format!(
            "free offset {} outside the page",
            used
        )));
    }
    let header = PageHeader {
        page_type,
        key_type: page[3],
        count: LittleEndian::read_u32(&page[4..8]),
        next: LittleEndian::read_u64(&page[12..20]),
    };
    Ok((header, &page[PAGE_HEADER_SIZE..used]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> PageHeader {
        PageHeader {
            page_type: PageType::Leaf,
            key_type: 2,
            count: 3,
            next: 9,
        }
    }

    #[test]
    fn test_page_roundtrip() {
        let page = encode_page(&header(), b"body bytes", 512).unwrap();
        assert_eq!(page.len(), 512);
        let (decoded, body) = decode_page(&page).unwrap();
        assert_eq!(decoded, header());
        assert_eq!(body, b"body bytes");
    }

    #[test]
    fn test_header_layout() {
        let page = encode_page(&header(), &[], 512).unwrap();
        assert_eq!(&page[0..2], &[0x50, 0x54]);
        assert_eq!(page[2], PageType::Leaf as u8);
        assert_eq!(LittleEndian::read_u32(&page[8..12]), PAGE_HEADER_SIZE as u32);
    }

    #[test]
    fn test_corruption_detected() {
        let mut page = encode_page(&header(), b"data", 512).unwrap();
        page[PAGE_HEADER_SIZE] ^= 0xFF;
        assert!(matches!(decode_page(&page), Err(StorageError::Corruption(_))));

        let mut page = encode_page(&header(), b"data", 512).unwrap();
        page[500] = 1;
        assert!(matches!(decode_page(&page), Err(StorageError::Corruption(_))));

        let zeroed = vec![0u8; 512];
        assert!(matches!(decode_page(&zeroed), Err(StorageError::Corruption(_))));
    }

    #[test]
    fn test_body_overflow() {
        let body = vec![1u8; 512];
        assert!(encode_page(&header(), &body, 512).is_err());
    }

    #[test]
    fn test_validate_page_size() {
        assert!(validate_page_size(512).is_ok());
        assert!(validate_page_size(262_144).is_ok());
        assert!(validate_page_size(256).is_err());
        assert!(validate_page_size(1000).is_err());
    }
}
