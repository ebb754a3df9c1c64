//! Page file
//!
//! A page file is a sequence of fixed-size pages. Page 0 is the meta page:
//!
//! ```text
//! +------------------+
//! | Magic: "TPDB"    | 4 bytes
//! | Format Version   | 4 bytes (u32 LE)
//! | Page Size        | 4 bytes (u32 LE)
//! | Key Type         | 1 byte
//! | Storage Kind     | 1 byte
//! | Reserved         | 2 bytes
//! | Root Page        | 8 bytes (u64 LE)
//! | Height           | 4 bytes (u32 LE)
//! | Entry Count      | 8 bytes (u64 LE)
//! | Unique Keys      | 8 bytes (u64 LE)
//! | Free List Head   | 8 bytes (u64 LE, 0 = empty)
//! | Page Count       | 8 bytes (u64 LE)
//! | CRC32            | 4 bytes
//! +------------------+
//! ```
//!
//! Freed pages are chained through their `next` header field and reused
//! before the file grows. Growing the file appends a zeroed page.

use std::fs::{File, OpenOptions};
use std::io::{Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use tracing::debug;

use crate::config::StorageKind;
use crate::error::{Result, StorageError};
use crate::key::KeyType;
use crate::page::{
    decode_page, encode_page, validate_page_size, PageHeader, PageId, PageType, PAGE_HEADER_SIZE,
};

/// Meta page magic bytes: "TPDB"
pub const FILE_MAGIC: [u8; 4] = *b"TPDB";

/// Current page file format version
pub const FILE_FORMAT_VERSION: u32 = 1;

const META_SIZE: usize = 4 + 4 + 4 + 1 + 1 + 2 + 8 + 4 + 8 + 8 + 8 + 8 + 4;

/// Contents of the meta page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Meta {
    /// Page size in bytes
    pub page_size: usize,
    /// Declared key type
    pub key_type: KeyType,
    /// Layout stored in the file
    pub kind: StorageKind,
    /// Root page, 0 if none
    pub root: PageId,
    /// Tree height, 0 when empty
    pub height: u32,
    /// Number of entries
    pub count: u64,
    /// Number of distinct keys
    pub unique: u64,
    /// First free page, 0 if none
    pub free_head: PageId,
    /// Pages in the file, meta page included
    pub page_count: u64,
}

impl Meta {
    fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(META_SIZE);
        bytes.extend_from_slice(&FILE_MAGIC);
        bytes.extend_from_slice(&FILE_FORMAT_VERSION.to_le_bytes());
        bytes.extend_from_slice(&(self.page_size as u32).to_le_bytes());
        bytes.push(self.key_type.to_u8());
        bytes.push(self.kind.to_u8());
        bytes.extend_from_slice(&[0u8; 2]);
        bytes.extend_from_slice(&self.root.to_le_bytes());
        bytes.extend_from_slice(&self.height.to_le_bytes());
        bytes.extend_from_slice(&self.count.to_le_bytes());
        bytes.extend_from_slice(&self.unique.to_le_bytes());
        bytes.extend_from_slice(&self.free_head.to_le_bytes());
        bytes.extend_from_slice(&self.page_count.to_le_bytes());
        let crc = crc32fast::hash(&bytes);
        bytes.extend_from_slice(&crc.to_le_bytes());
        bytes
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < META_SIZE {
            return Err(StorageError::Corruption("meta page too short".to_string()));
        }
        if bytes[0..4] != FILE_MAGIC {
            return Err(StorageError::Corruption("invalid file magic".to_string()));
        }
        let data = &bytes[..META_SIZE - 4];
        let mut crc_bytes = [0u8; 4];
        crc_bytes.copy_from_slice(&bytes[META_SIZE - 4..META_SIZE]);
        let stored = u32::from_le_bytes(crc_bytes);
        let computed = crc32fast::hash(data);
        if stored != computed {
            return Err(StorageError::Corruption(format!(
                "meta checksum mismatch: expected {:08x}, computed {:08x}",
                stored, computed
            )));
        }

        let mut cursor = Cursor::new(&data[4..]);
        let version = cursor.read_u32::<LittleEndian>()?;
        if version != FILE_FORMAT_VERSION {
            return Err(StorageError::Corruption(format!(
                "unsupported format version {}",
                version
            )));
        }
        let page_size = cursor.read_u32::<LittleEndian>()? as usize;
        let key_tag = cursor.read_u8()?;
        let kind_tag = cursor.read_u8()?;
        cursor.read_u16::<LittleEndian>()?;
        let key_type = KeyType::from_u8(key_tag)
            .ok_or_else(|| StorageError::Corruption(format!("unknown key type {}", key_tag)))?;
        let kind = StorageKind::from_u8(kind_tag)
            .ok_or_else(|| StorageError::Corruption(format!("unknown storage kind {}", kind_tag)))?;
        Ok(Meta {
            page_size,
            key_type,
            kind,
            root: cursor.read_u64::<LittleEndian>()?,
            height: cursor.read_u32::<LittleEndian>()?,
            count: cursor.read_u64::<LittleEndian>()?,
            unique: cursor.read_u64::<LittleEndian>()?,
            free_head: cursor.read_u64::<LittleEndian>()?,
            page_count: cursor.read_u64::<LittleEndian>()?,
        })
    }
}

/// File of fixed-size pages with a free list
#[derive(Debug)]
pub struct PageFile {
    file: File,
    path: PathBuf,
    meta: Meta,
}

impl PageFile {
    /// Create a new file, replacing any existing one
    pub fn create(
        path: impl AsRef<Path>,
        page_size: usize,
        key_type: KeyType,
        kind: StorageKind,
    ) -> Result<Self> {
        validate_page_size(page_size)?;
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.set_len(page_size as u64)?;
        let mut page_file = PageFile {
            file,
            path,
            meta: Meta {
                page_size,
                key_type,
                kind,
                root: 0,
                height: 0,
                count: 0,
                unique: 0,
                free_head: 0,
                page_count: 1,
            },
        };
        page_file.write_meta()?;
        debug!(path = %page_file.path.display(), page_size, "created page file");
        Ok(page_file)
    }

    /// Open an existing file
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;
        let mut bytes = vec![0u8; META_SIZE];
        file.read_exact(&mut bytes)?;
        let meta = Meta::from_bytes(&bytes)?;
        validate_page_size(meta.page_size)
            .map_err(|_| StorageError::Corruption(format!("bad page size {}", meta.page_size)))?;
        let needed = meta.page_count * meta.page_size as u64;
        let actual = file.metadata()?.len();
        if actual < needed {
            return Err(StorageError::Corruption(format!(
                "file holds {} bytes, meta expects {}",
                actual, needed
            )));
        }
        Ok(PageFile { file, path, meta })
    }

    /// Path of the file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Page size in bytes
    pub fn page_size(&self) -> usize {
        self.meta.page_size
    }

    /// Bytes available for a page body
    pub fn payload_size(&self) -> usize {
        self.meta.page_size - PAGE_HEADER_SIZE
    }

    /// Declared key type
    pub fn key_type(&self) -> KeyType {
        self.meta.key_type
    }

    /// In-memory meta; written by [`PageFile::write_meta`]
    pub fn meta(&self) -> &Meta {
        &self.meta
    }

    /// Mutable meta
    pub fn meta_mut(&mut self) -> &mut Meta {
        &mut self.meta
    }

    fn offset(&self, id: PageId) -> Result<u64> {
        if id == 0 || id >= self.meta.page_count {
            return Err(StorageError::Corruption(format!(
                "page {} outside 1..{}",
                id, self.meta.page_count
            )));
        }
        Ok(id * self.meta.page_size as u64)
    }

    /// Read a whole page
    pub fn read_page(&mut self, id: PageId) -> Result<Vec<u8>> {
        let offset = self.offset(id)?;
        let mut page = vec![0u8; self.meta.page_size];
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(&mut page)?;
        Ok(page)
    }

    /// Overwrite a whole page
    pub fn write_page(&mut self, id: PageId, page: &[u8]) -> Result<()> {
        if page.len() != self.meta.page_size {
            return Err(StorageError::Corruption(format!(
                "page image of {} bytes, expected {}",
                page.len(),
                self.meta.page_size
            )));
        }
        let offset = self.offset(id)?;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(page)?;
        Ok(())
    }

    /// Take a page from the free list, or grow the file by one page
    pub fn allocate(&mut self) -> Result<PageId> {
        if self.meta.free_head != 0 {
            let id = self.meta.free_head;
            let page = self.read_page(id)?;
            let (header, _) = decode_page(&page)?;
            if header.page_type != PageType::Free {
                return Err(StorageError::Corruption(format!(
                    "free list entry {} is a {:?} page",
                    id, header.page_type
                )));
            }
            self.meta.free_head = header.next;
            debug!(page = id, "reused free page");
            return Ok(id);
        }
        let id = self.meta.page_count;
        self.meta.page_count += 1;
        self.file
            .set_len(self.meta.page_count * self.meta.page_size as u64)?;
        debug!(page = id, "grew page file");
        Ok(id)
    }

    /// Return a page to the free list
    pub fn free(&mut self, id: PageId) -> Result<()> {
        let header = PageHeader {
            page_type: PageType::Free,
            key_type: self.meta.key_type.to_u8(),
            count: 0,
            next: self.meta.free_head,
        };
        let page = encode_page(&header, &[], self.meta.page_size)?;
        self.write_page(id, &page)?;
        self.meta.free_head = id;
        debug!(page = id, "freed page");
        Ok(())
    }

    /// Pages on the free list
    pub fn free_pages(&mut self) -> Result<Vec<PageId>> {
        let mut pages = Vec::new();
        let mut next = self.meta.free_head;
        while next != 0 {
            if pages.len() as u64 >= self.meta.page_count {
                return Err(StorageError::Corruption("free list cycle".to_string()));
            }
            pages.push(next);
            let page = self.read_page(next)?;
            next = decode_page(&page)?.0.next;
        }
        Ok(pages)
    }

    /// Write the meta page
    pub fn write_meta(&mut self) -> Result<()> {
        let bytes = self.meta.to_bytes();
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&bytes)?;
        Ok(())
    }

    /// Write the meta page and sync the file to disk
    pub fn sync(&mut self) -> Result<()> {
        self.write_meta()?;
        self.file.sync_all()?;
        Ok(())
    }
}
