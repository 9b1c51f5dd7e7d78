// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
use super::{
    JournalRecord, RecordBody, BODY_HEADER_SIZE, CHECKSUM_SIZE, LEN_PREFIX_SIZE, MAX_BODY_SIZE,
};
use crate::types::enums::RecordKind;
use crate::types::id::{RecordId, TxId};
use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CorruptionKind {
    /// Fewer bytes than the frame claims (torn write).
    Truncated,
    /// Length prefix outside the valid range.
    BadLength,
    ChecksumMismatch,
    UnknownKind(u8),
    /// Checksum is fine but the fields violate the record grammar.
    InvalidRecord,
}

/// A frame failed validation. `offset` is the absolute byte offset of the
/// frame start within whatever buffer or file was being decoded.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
#[error("corrupt journal frame at offset {offset}: {kind:?}")]
pub struct CorruptionError {
    pub offset: u64,
    pub kind: CorruptionKind,
}

/// Decodes exactly one frame; trailing bytes are rejected.
pub fn decode(bytes: &[u8]) -> Result<JournalRecord, CorruptionError> {
    let (record, consumed) = decode_frame(bytes, 0)?;
    if consumed != bytes.len() {
        return Err(CorruptionError { offset: 0, kind: CorruptionKind::BadLength });
    }
    Ok(record)
}

/// Decodes the frame at the start of `bytes`, returning the record and the
/// number of bytes it occupied. `base_offset` is only used for error reports.
pub fn decode_frame(bytes: &[u8], base_offset: u64) -> Result<(JournalRecord, usize), CorruptionError> {
    let fail = |kind| CorruptionError { offset: base_offset, kind };

    if bytes.len() < LEN_PREFIX_SIZE {
        return Err(fail(CorruptionKind::Truncated));
    }
    let body_len = LittleEndian::read_u32(&bytes[..LEN_PREFIX_SIZE]) as usize;
    if body_len < BODY_HEADER_SIZE || body_len > MAX_BODY_SIZE {
        return Err(fail(CorruptionKind::BadLength));
    }
    let body_end = LEN_PREFIX_SIZE + body_len;
    let total = body_end + CHECKSUM_SIZE;
    if bytes.len() < total {
        return Err(fail(CorruptionKind::Truncated));
    }

    let stored = LittleEndian::read_u32(&bytes[body_end..total]);
    if stored != crc32fast::hash(&bytes[..body_end]) {
        return Err(fail(CorruptionKind::ChecksumMismatch));
    }

    let body = &bytes[LEN_PREFIX_SIZE..body_end];
    let kind = RecordKind::from_u8(body[0]).ok_or(fail(CorruptionKind::UnknownKind(body[0])))?;
    let raw_tx = LittleEndian::read_u64(&body[1..9]);
    let id = RecordId(LittleEndian::read_u64(&body[9..17]));
    let rest = &body[BODY_HEADER_SIZE..];

    let tx = if raw_tx == 0 { None } else { Some(TxId(raw_tx)) };
    if id.is_none() || (kind.is_transaction_marker() && tx.is_none()) {
        return Err(fail(CorruptionKind::InvalidRecord));
    }

    let target = if kind.has_target() {
        if rest.len() < 8 {
            return Err(fail(CorruptionKind::InvalidRecord));
        }
        let target = RecordId(LittleEndian::read_u64(&rest[..8]));
        if target.is_none() {
            return Err(fail(CorruptionKind::InvalidRecord));
        }
        target
    } else {
        RecordId::NONE
    };

    let body = match kind {
        RecordKind::Add => RecordBody::Add { payload: rest.to_vec() },
        RecordKind::Prepare => RecordBody::Prepare { payload: rest.to_vec() },
        RecordKind::Update => RecordBody::Update { target, payload: rest[8..].to_vec() },
        RecordKind::Delete if rest.len() == 8 => RecordBody::Delete { target },
        RecordKind::Commit if rest.is_empty() => RecordBody::Commit,
        RecordKind::Rollback if rest.is_empty() => RecordBody::Rollback,
        _ => return Err(fail(CorruptionKind::InvalidRecord)),
    };

    Ok((JournalRecord { id, tx, body }, total))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::encode;

    #[test]
    fn test_decode_rejects_trailing_bytes() {
        let record = JournalRecord {
            id: RecordId(3),
            tx: Some(TxId(7)),
            body: RecordBody::Commit,
        };
        let mut bytes = encode(&record).unwrap();
        assert_eq!(decode(&bytes).unwrap(), record);
        bytes.push(0);
        assert_eq!(decode(&bytes).unwrap_err().kind, CorruptionKind::BadLength);
    }

    #[test]
    fn test_decode_frame_reports_base_offset() {
        let record = JournalRecord {
            id: RecordId(9),
            tx: None,
            body: RecordBody::Add { payload: b"m".to_vec() },
        };
        let bytes = encode(&record).unwrap();
        let err = decode_frame(&bytes[..bytes.len() - 1], 4096).unwrap_err();
        assert_eq!(err.offset, 4096);
        assert_eq!(err.kind, CorruptionKind::Truncated);
    }

    #[test]
    fn test_zeroed_prefix_is_bad_length() {
        let err = decode(&[0u8; 32]).unwrap_err();
        assert_eq!(err.kind, CorruptionKind::BadLength);
    }
}
