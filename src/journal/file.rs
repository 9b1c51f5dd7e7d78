// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Journal file naming and header.
//!
//! Header layout (24 bytes, little endian), followed by `source_count`
//! file ids for compacted files:
//!
//! ```text
//! [magic: u32][version: u8][kind: u8][reserved: u16][file_id: u32][source_count: u32][base_record_id: u64]
//! ```
//!
//! A compacted file lists the files it replaced so a crash between the
//! rename and the deletion of the old files can be finished at open time.

use crate::error::{JournalError, JournalResult};
use crate::types::enums::{FileKind, FileState};
use crate::types::id::{FileId, RecordId};
use byteorder::{ByteOrder, LittleEndian};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

pub const FILE_MAGIC: u32 = 0x4C4A_5241; // "ARJL"
pub const FILE_VERSION: u8 = 1;
pub const FILE_HEADER_SIZE: usize = 24;
const MAX_SOURCES: usize = 1 << 16;

const FILE_PREFIX: &str = "journal-";
const FILE_SUFFIX: &str = ".jrn";
const TMP_SUFFIX: &str = ".jrn.cmp";
const CORRUPT_SUFFIX: &str = ".corrupt";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileHeader {
    pub kind: FileKind,
    pub file_id: FileId,
    pub base_record_id: RecordId,
    pub sources: Vec<FileId>,
}

impl FileHeader {
    pub fn append(file_id: FileId, base_record_id: RecordId) -> Self {
        Self { kind: FileKind::Append, file_id, base_record_id, sources: Vec::new() }
    }

    pub fn encoded_len(&self) -> usize {
        FILE_HEADER_SIZE + 4 * self.sources.len()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0u8; self.encoded_len()];
        LittleEndian::write_u32(&mut buf[0..4], FILE_MAGIC);
        buf[4] = FILE_VERSION;
        buf[5] = self.kind as u8;
        LittleEndian::write_u32(&mut buf[8..12], self.file_id.0);
        LittleEndian::write_u32(&mut buf[12..16], self.sources.len() as u32);
        LittleEndian::write_u64(&mut buf[16..24], self.base_record_id.0);
        for (i, source) in self.sources.iter().enumerate() {
            let at = FILE_HEADER_SIZE + 4 * i;
            LittleEndian::write_u32(&mut buf[at..at + 4], source.0);
        }
        buf
    }

    /// Parses a header from the start of a file. Returns a reason on failure.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, String> {
        if bytes.len() < FILE_HEADER_SIZE {
            return Err(format!("header truncated at {} bytes", bytes.len()));
        }
        let magic = LittleEndian::read_u32(&bytes[0..4]);
        if magic != FILE_MAGIC {
            return Err(format!("bad magic {magic:#010x}"));
        }
        if bytes[4] != FILE_VERSION {
            return Err(format!("unsupported version {}", bytes[4]));
        }
        let kind = FileKind::from_u8(bytes[5]).ok_or_else(|| format!("unknown file kind {}", bytes[5]))?;
        let file_id = FileId(LittleEndian::read_u32(&bytes[8..12]));
        let source_count = LittleEndian::read_u32(&bytes[12..16]) as usize;
        let base_record_id = RecordId(LittleEndian::read_u64(&bytes[16..24]));

        let end = FILE_HEADER_SIZE + 4 * source_count;
        if source_count > MAX_SOURCES || bytes.len() < end {
            return Err(format!("source list truncated ({source_count} entries)"));
        }
        let sources = bytes[FILE_HEADER_SIZE..end]
            .chunks_exact(4)
            .map(|c| FileId(LittleEndian::read_u32(c)))
            .collect();

        Ok(Self { kind, file_id, base_record_id, sources })
    }
}

/// Metadata of one journal file. `len` is the durable length: bytes past it
/// may be in flight and are never read.
#[derive(Clone, Debug)]
pub struct JournalFile {
    pub id: FileId,
    pub kind: FileKind,
    pub base_record_id: RecordId,
    pub sources: Vec<FileId>,
    pub path: PathBuf,
    pub data_start: u64,
    pub len: u64,
    pub state: FileState,
}

impl JournalFile {
    pub fn from_header(header: FileHeader, path: PathBuf, len: u64, state: FileState) -> Self {
        Self {
            id: header.file_id,
            kind: header.kind,
            base_record_id: header.base_record_id,
            data_start: header.encoded_len() as u64,
            sources: header.sources,
            path,
            len,
            state,
        }
    }

    pub fn data_bytes(&self) -> u64 {
        self.len.saturating_sub(self.data_start)
    }
}

pub fn file_name(id: FileId) -> String {
    format!("{FILE_PREFIX}{id}{FILE_SUFFIX}")
}

pub fn file_path(dir: &Path, id: FileId) -> PathBuf {
    dir.join(file_name(id))
}

pub fn tmp_path(dir: &Path, id: FileId) -> PathBuf {
    dir.join(format!("{FILE_PREFIX}{id}{TMP_SUFFIX}"))
}

pub fn corrupt_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(CORRUPT_SUFFIX);
    path.with_file_name(name)
}

pub fn parse_file_name(name: &str) -> Option<FileId> {
    let digits = name.strip_prefix(FILE_PREFIX)?.strip_suffix(FILE_SUFFIX)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok().map(FileId)
}

/// Contents of a journal directory.
#[derive(Debug, Default)]
pub struct DirScan {
    /// Journal files sorted by id.
    pub journals: Vec<(FileId, PathBuf)>,
    /// Unfinished compaction outputs.
    pub leftovers: Vec<PathBuf>,
    /// Highest id seen on any file, quarantined ones included.
    pub max_id: FileId,
}

pub fn scan(dir: &Path) -> io::Result<DirScan> {
    let mut scan = DirScan::default();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };

        if name.ends_with(TMP_SUFFIX) {
            scan.leftovers.push(entry.path());
            continue;
        }
        let stem = name.strip_suffix(CORRUPT_SUFFIX).unwrap_or(name);
        if let Some(id) = parse_file_name(stem) {
            scan.max_id = scan.max_id.max(id);
            if stem.len() == name.len() {
                scan.journals.push((id, entry.path()));
            }
        }
    }
    scan.journals.sort_by_key(|(id, _)| *id);
    Ok(scan)
}

/// Reads the header and the current length of a journal file.
pub fn read_header(path: &Path) -> JournalResult<(FileHeader, u64)> {
    let mut file = File::open(path)?;
    let len = file.metadata()?.len();
    let mut head = vec![0u8; FILE_HEADER_SIZE];
    let read = read_up_to(&mut file, &mut head)?;
    if read == FILE_HEADER_SIZE {
        let source_count = LittleEndian::read_u32(&head[12..16]) as usize;
        if source_count <= MAX_SOURCES {
            head.resize(FILE_HEADER_SIZE + 4 * source_count, 0);
            let extra = read_up_to(&mut file, &mut head[FILE_HEADER_SIZE..])?;
            head.truncate(FILE_HEADER_SIZE + extra);
        }
    } else {
        head.truncate(read);
    }

    let header = FileHeader::from_bytes(&head)
        .map_err(|reason| JournalError::InvalidFile { path: path.to_path_buf(), reason })?;
    Ok((header, len))
}

fn read_up_to(file: &mut File, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}

/// Creates a new append file with its header durable.
pub fn create_append(dir: &Path, id: FileId, base: RecordId) -> io::Result<(File, JournalFile)> {
    let header = FileHeader::append(id, base);
    let path = file_path(dir, id);
    let mut file = OpenOptions::new().create_new(true).read(true).append(true).open(&path)?;
    let bytes = header.to_bytes();
    file.write_all(&bytes)?;
    file.sync_all()?;
    sync_dir(dir)?;
    let len = bytes.len() as u64;
    Ok((file, JournalFile::from_header(header, path, len, FileState::Open)))
}

/// Makes renames and unlinks in `dir` durable.
pub fn sync_dir(dir: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        File::open(dir)?.sync_all()?;
    }
    #[cfg(not(unix))]
    let _ = dir;
    Ok(())
}
