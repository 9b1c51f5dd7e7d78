// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Page files: `[sequence: u64][length: u32][payload]` entries, little
//! endian, appended in sequence order. One directory per address.

use crate::types::id::PageId;
use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

pub const ENTRY_HEADER_SIZE: u64 = 12;

const PAGE_PREFIX: &str = "page-";
const PAGE_SUFFIX: &str = ".page";

pub fn page_path(dir: &Path, id: PageId) -> PathBuf {
    dir.join(format!("{PAGE_PREFIX}{:08}{PAGE_SUFFIX}", id.0))
}

pub fn parse_page_name(name: &str) -> Option<PageId> {
    let digits = name.strip_prefix(PAGE_PREFIX)?.strip_suffix(PAGE_SUFFIX)?;
    digits.parse().ok().map(PageId)
}

/// Length field of a page entry holding `body_len` bytes.
pub fn entry_length(body_len: usize) -> io::Result<u32> {
    u32::try_from(body_len).map_err(|_| {
        io::Error::new(io::ErrorKind::InvalidInput, format!("message body of {body_len} bytes does not fit a page entry"))
    })
}

/// Appender for the page file currently receiving messages.
pub struct PageWriter {
    pub id: PageId,
    pub path: PathBuf,
    file: File,
    len: u64,
    sync: bool,
}

impl PageWriter {
    pub fn create(dir: &Path, id: PageId, sync: bool) -> io::Result<Self> {
        let path = page_path(dir, id);
        let file = OpenOptions::new().create(true).write(true).truncate(true).open(&path)?;
        Ok(Self { id, path, file, len: 0, sync })
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Appends one entry and returns its offset. The entry goes out in a
    /// single write; a failed write is cut off the file again.
    pub fn append(&mut self, sequence: u64, body: &[u8]) -> io::Result<u64> {
        let length = entry_length(body.len())?;
        let mut entry = Vec::with_capacity(ENTRY_HEADER_SIZE as usize + body.len());
        entry.write_u64::<LittleEndian>(sequence)?;
        entry.write_u32::<LittleEndian>(length)?;
        entry.extend_from_slice(body);

        let offset = self.len;
        if let Err(e) = self.write_entry(&entry) {
            if let Err(trim) = self.file.set_len(offset) {
                tracing::warn!(path = %self.path.display(), error = %trim, "failed to trim torn page entry");
            }
            return Err(e);
        }
        self.len += entry.len() as u64;
        Ok(offset)
    }

    fn write_entry(&mut self, entry: &[u8]) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(self.len))?;
        self.file.write_all(entry)?;
        if self.sync {
            self.file.sync_data()?;
        }
        Ok(())
    }
}

/// Reads the entry at `offset`, checking it holds `sequence`.
pub fn read_entry(path: &Path, offset: u64, sequence: u64) -> io::Result<Vec<u8>> {
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(offset))?;
    let stored = file.read_u64::<LittleEndian>()?;
    let len = file.read_u32::<LittleEndian>()? as usize;
    if stored != sequence {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("page entry at {offset} holds sequence {stored}, expected {sequence}"),
        ));
    }
    let mut body = vec![0u8; len];
    file.read_exact(&mut body)?;
    Ok(body)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageEntry {
    pub sequence: u64,
    pub offset: u64,
    pub length: u32,
}

/// Lists the complete entries of a page file. A torn final entry is ignored.
pub fn scan_entries(path: &Path) -> io::Result<Vec<PageEntry>> {
    let bytes = fs::read(path)?;
    let mut entries = Vec::new();
    let mut pos = 0usize;
    while pos + ENTRY_HEADER_SIZE as usize <= bytes.len() {
        let sequence = LittleEndian::read_u64(&bytes[pos..pos + 8]);
        let length = LittleEndian::read_u32(&bytes[pos + 8..pos + 12]);
        let end = pos + ENTRY_HEADER_SIZE as usize + length as usize;
        if end > bytes.len() {
            tracing::warn!(path = %path.display(), offset = pos, "ignoring torn page entry");
            break;
        }
        entries.push(PageEntry { sequence, offset: pos as u64, length });
        pos = end;
    }
    Ok(entries)
}
