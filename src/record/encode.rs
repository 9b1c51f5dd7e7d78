// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
use super::{JournalRecord, BODY_HEADER_SIZE, CHECKSUM_SIZE, FRAME_OVERHEAD, LEN_PREFIX_SIZE, MAX_BODY_SIZE};
use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;

/// The record would produce a frame the decoder refuses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
#[error("record body of {size} bytes exceeds the {limit} byte frame limit")]
pub struct BodyTooLarge {
    pub size: usize,
    pub limit: usize,
}

fn body_len(record: &JournalRecord) -> usize {
    let target = if record.body.target().is_some() { 8 } else { 0 };
    BODY_HEADER_SIZE + target + record.body.payload().len()
}

/// Size of the encoded frame, prefix and checksum included.
pub fn encoded_len(record: &JournalRecord) -> usize {
    FRAME_OVERHEAD + body_len(record)
}

/// Like [`encoded_len`], but fails for records whose body exceeds
/// [`MAX_BODY_SIZE`].
pub fn checked_len(record: &JournalRecord) -> Result<usize, BodyTooLarge> {
    let size = body_len(record);
    if size > MAX_BODY_SIZE {
        return Err(BodyTooLarge { size, limit: MAX_BODY_SIZE });
    }
    Ok(FRAME_OVERHEAD + size)
}

pub fn encode(record: &JournalRecord) -> Result<Vec<u8>, BodyTooLarge> {
    let mut buf = vec![0u8; checked_len(record)?];
    write_frame(record, &mut buf);
    Ok(buf)
}

/// Appends the frame to `out`, returning its length. `out` is untouched on
/// error.
pub fn encode_into(record: &JournalRecord, out: &mut Vec<u8>) -> Result<usize, BodyTooLarge> {
    let len = checked_len(record)?;
    let start = out.len();
    out.resize(start + len, 0);
    write_frame(record, &mut out[start..]);
    Ok(len)
}

/// CRC-32 of the frame `record` encodes to, size limit not applied.
pub(crate) fn frame_checksum(record: &JournalRecord) -> u32 {
    let mut buf = vec![0u8; encoded_len(record)];
    write_frame(record, &mut buf);
    LittleEndian::read_u32(&buf[buf.len() - CHECKSUM_SIZE..])
}

fn write_frame(record: &JournalRecord, buf: &mut [u8]) {
    let body_len = buf.len() - FRAME_OVERHEAD;
    LittleEndian::write_u32(&mut buf[0..4], body_len as u32);

    let mut pos = LEN_PREFIX_SIZE;
    buf[pos] = record.kind() as u8;
    pos += 1;
    LittleEndian::write_u64(&mut buf[pos..pos + 8], record.tx.map_or(0, |tx| tx.0));
    pos += 8;
    LittleEndian::write_u64(&mut buf[pos..pos + 8], record.id.0);
    pos += 8;

    if let Some(target) = record.body.target() {
        LittleEndian::write_u64(&mut buf[pos..pos + 8], target.0);
        pos += 8;
    }

    let payload = record.body.payload();
    buf[pos..pos + payload.len()].copy_from_slice(payload);
    pos += payload.len();

    let crc = crc32fast::hash(&buf[..pos]);
    LittleEndian::write_u32(&mut buf[pos..pos + CHECKSUM_SIZE], crc);
}
