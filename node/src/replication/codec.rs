// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Wire format of the replication link.
//!
//! ```text
//! [tag: u8][len: u32][body ...]
//! ```
//!
//! All integers are little endian. A `Record` body is the journal frame of the
//! record, checksum included, so the backup validates it exactly as it would
//! validate a frame read from disk. `MessageRecord` carries a record of the
//! paging store's message journal the same way. Strings are `[len: u16][utf8]`.

use crate::failover::Role;
use artemis_journal::record::{self, CorruptionError, MAX_BODY_SIZE};
use artemis_journal::{JournalRecord, RecordId};
use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

pub const HEADER_SIZE: usize = 1 + 4;
/// Marks heartbeat bodies. ASCII "ARHB".
pub const HEARTBEAT_MAGIC: u32 = 0x4248_5241;
pub const MAX_FRAME_BODY: usize = MAX_BODY_SIZE + 64 * 1024;

const TAG_ANNOUNCE: u8 = 1;
const TAG_SYNC_BEGIN: u8 = 2;
const TAG_RECORD: u8 = 3;
const TAG_PAGE_WRITE: u8 = 4;
const TAG_PAGE_DEPAGE: u8 = 5;
const TAG_SYNC_END: u8 = 6;
const TAG_ACK: u8 = 7;
const TAG_HEARTBEAT: u8 = 8;
const TAG_MESSAGE_RECORD: u8 = 9;
const TAG_MESSAGE_ACK: u8 = 10;
const TAG_STEP_DOWN: u8 = 11;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    /// First frame from each side of a session.
    Announce { node: String, role: Role, epoch: u64 },
    /// The backup must drop its state; a full copy follows.
    SyncBegin,
    Record(JournalRecord),
    PageWrite { address: String, sequence: u64, body: Vec<u8> },
    PageDepage { address: String, sequence: u64 },
    /// Record of the message journal holding resident messages.
    MessageRecord(JournalRecord),
    /// End of the full copy: the highest ids sent in it, per journal.
    SyncEnd { last_record: RecordId, last_message: RecordId },
    /// Highest record id the backup has applied.
    Ack { record: RecordId },
    /// Highest message journal record id the backup has applied.
    MessageAck { record: RecordId },
    Heartbeat { timestamp_ms: u64 },
    /// The promoted node has released leadership and hands it back.
    StepDown { epoch: u64 },
}

impl Frame {
    fn tag(&self) -> u8 {
        match self {
            Frame::Announce { .. } => TAG_ANNOUNCE,
            Frame::SyncBegin => TAG_SYNC_BEGIN,
            Frame::Record(_) => TAG_RECORD,
            Frame::PageWrite { .. } => TAG_PAGE_WRITE,
            Frame::PageDepage { .. } => TAG_PAGE_DEPAGE,
            Frame::SyncEnd { .. } => TAG_SYNC_END,
            Frame::Ack { .. } => TAG_ACK,
            Frame::Heartbeat { .. } => TAG_HEARTBEAT,
            Frame::MessageRecord(_) => TAG_MESSAGE_RECORD,
            Frame::MessageAck { .. } => TAG_MESSAGE_ACK,
            Frame::StepDown { .. } => TAG_STEP_DOWN,
        }
    }
}

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unknown frame tag {0}")]
    UnknownTag(u8),
    #[error("frame body of {0} bytes exceeds the limit")]
    FrameTooLarge(usize),
    #[error("malformed frame: {0}")]
    Malformed(&'static str),
    #[error("bad record frame: {0}")]
    Record(#[from] CorruptionError),
    #[error("bad heartbeat magic {0:#x}")]
    BadMagic(u32),
}

#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, CodecError> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }
        let tag = src[0];
        let len = u32::from_le_bytes([src[1], src[2], src[3], src[4]]) as usize;
        if len > MAX_FRAME_BODY {
            return Err(CodecError::FrameTooLarge(len));
        }
        if src.len() < HEADER_SIZE + len {
            src.reserve(HEADER_SIZE + len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_SIZE);
        let mut body = src.split_to(len);
        let frame = decode_body(tag, &mut body)?;
        if body.has_remaining() {
            return Err(CodecError::Malformed("trailing bytes"));
        }
        Ok(Some(frame))
    }
}

fn decode_body(tag: u8, body: &mut BytesMut) -> Result<Frame, CodecError> {
    let frame = match tag {
        TAG_ANNOUNCE => {
            let node = get_string(body)?;
            let role = Role::from_u8(get_u8(body)?).ok_or(CodecError::Malformed("unknown role"))?;
            Frame::Announce { node, role, epoch: get_u64(body)? }
        }
        TAG_SYNC_BEGIN => Frame::SyncBegin,
        TAG_RECORD => {
            let record = record::decode(&body[..])?;
            body.clear();
            Frame::Record(record)
        }
        TAG_PAGE_WRITE => {
            let address = get_string(body)?;
            let sequence = get_u64(body)?;
            let body = body.split().to_vec();
            Frame::PageWrite { address, sequence, body }
        }
        TAG_PAGE_DEPAGE => Frame::PageDepage { address: get_string(body)?, sequence: get_u64(body)? },
        TAG_MESSAGE_RECORD => {
            let record = record::decode(&body[..])?;
            body.clear();
            Frame::MessageRecord(record)
        }
        TAG_SYNC_END => Frame::SyncEnd {
            last_record: RecordId(get_u64(body)?),
            last_message: RecordId(get_u64(body)?),
        },
        TAG_ACK => Frame::Ack { record: RecordId(get_u64(body)?) },
        TAG_MESSAGE_ACK => Frame::MessageAck { record: RecordId(get_u64(body)?) },
        TAG_STEP_DOWN => Frame::StepDown { epoch: get_u64(body)? },
        TAG_HEARTBEAT => {
            let magic = get_u32(body)?;
            if magic != HEARTBEAT_MAGIC {
                return Err(CodecError::BadMagic(magic));
            }
            Frame::Heartbeat { timestamp_ms: get_u64(body)? }
        }
        other => return Err(CodecError::UnknownTag(other)),
    };
    Ok(frame)
}

fn need(body: &BytesMut, n: usize) -> Result<(), CodecError> {
    if body.remaining() < n {
        return Err(CodecError::Malformed("short body"));
    }
    Ok(())
}

fn get_u8(body: &mut BytesMut) -> Result<u8, CodecError> {
    need(body, 1)?;
    Ok(body.get_u8())
}

fn get_u32(body: &mut BytesMut) -> Result<u32, CodecError> {
    need(body, 4)?;
    Ok(body.get_u32_le())
}

fn get_u64(body: &mut BytesMut) -> Result<u64, CodecError> {
    need(body, 8)?;
    Ok(body.get_u64_le())
}

fn get_string(body: &mut BytesMut) -> Result<String, CodecError> {
    need(body, 2)?;
    let len = body.get_u16_le() as usize;
    need(body, len)?;
    let raw = body.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|_| CodecError::Malformed("invalid utf-8"))
}

fn put_string(dst: &mut BytesMut, s: &str) -> Result<(), CodecError> {
    let len = u16::try_from(s.len()).map_err(|_| CodecError::Malformed("string too long"))?;
    dst.put_u16_le(len);
    dst.put_slice(s.as_bytes());
    Ok(())
}

impl Encoder<Frame> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), CodecError> {
        let start = dst.len();
        dst.put_u8(frame.tag());
        dst.put_u32_le(0);

        if let Err(e) = encode_body(&frame, dst) {
            dst.truncate(start);
            return Err(e);
        }

        let len = dst.len() - start - HEADER_SIZE;
        if len > MAX_FRAME_BODY {
            dst.truncate(start);
            return Err(CodecError::FrameTooLarge(len));
        }
        dst[start + 1..start + HEADER_SIZE].copy_from_slice(&(len as u32).to_le_bytes());
        Ok(())
    }
}

fn encode_body(frame: &Frame, dst: &mut BytesMut) -> Result<(), CodecError> {
    match frame {
        Frame::Announce { node, role, epoch } => {
            put_string(dst, node)?;
            dst.put_u8(role.as_u8());
            dst.put_u64_le(*epoch);
        }
        Frame::SyncBegin => {}
        Frame::Record(record) | Frame::MessageRecord(record) => {
            let mut buf = Vec::new();
            record::encode_into(record, &mut buf).map_err(|e| CodecError::FrameTooLarge(e.size))?;
            dst.put_slice(&buf);
        }
        Frame::PageWrite { address, sequence, body } => {
            put_string(dst, address)?;
            dst.put_u64_le(*sequence);
            dst.put_slice(body);
        }
        Frame::PageDepage { address, sequence } => {
            put_string(dst, address)?;
            dst.put_u64_le(*sequence);
        }
        Frame::SyncEnd { last_record, last_message } => {
            dst.put_u64_le(last_record.0);
            dst.put_u64_le(last_message.0);
        }
        Frame::Ack { record } | Frame::MessageAck { record } => dst.put_u64_le(record.0),
        Frame::StepDown { epoch } => dst.put_u64_le(*epoch),
        Frame::Heartbeat { timestamp_ms } => {
            dst.put_u32_le(HEARTBEAT_MAGIC);
            dst.put_u64_le(*timestamp_ms);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use artemis_journal::{RecordBody, TxId};
    use proptest::prelude::*;

    fn encode(frame: Frame) -> BytesMut {
        let mut buf = BytesMut::new();
        FrameCodec.encode(frame, &mut buf).unwrap();
        buf
    }

    #[test]
    fn test_frames_arrive_whole_from_partial_reads() {
        let record = JournalRecord {
            id: RecordId(7),
            tx: Some(TxId(3)),
            body: RecordBody::Update { target: RecordId(2), payload: b"body".to_vec() },
        };
        let mut wire = encode(Frame::Record(record.clone()));
        wire.extend_from_slice(&encode(Frame::Heartbeat { timestamp_ms: 99 }));

        let mut codec = FrameCodec;
        let mut src = BytesMut::new();
        let mut frames = Vec::new();
        for byte in wire.iter() {
            src.put_u8(*byte);
            while let Some(frame) = codec.decode(&mut src).unwrap() {
                frames.push(frame);
            }
        }
        assert_eq!(frames, vec![Frame::Record(record), Frame::Heartbeat { timestamp_ms: 99 }]);
        assert!(src.is_empty());
    }

    #[test]
    fn test_corrupt_record_frame_is_rejected() {
        let record = JournalRecord { id: RecordId(1), tx: None, body: RecordBody::Add { payload: vec![1, 2, 3] } };
        let mut wire = encode(Frame::Record(record));
        let last = wire.len() - 6;
        wire[last] ^= 0xFF;
        assert!(matches!(FrameCodec.decode(&mut wire), Err(CodecError::Record(_))));
    }

    #[test]
    fn test_heartbeat_magic_is_checked() {
        let mut wire = encode(Frame::Heartbeat { timestamp_ms: 1 });
        wire[HEADER_SIZE] ^= 0x01;
        assert!(matches!(FrameCodec.decode(&mut wire), Err(CodecError::BadMagic(_))));
    }

    #[test]
    fn test_unknown_tag_and_oversized_length() {
        let mut wire = BytesMut::from(&[42u8, 0, 0, 0, 0][..]);
        assert!(matches!(FrameCodec.decode(&mut wire), Err(CodecError::UnknownTag(42))));

        let mut wire = BytesMut::from(&[TAG_ACK, 0xFF, 0xFF, 0xFF, 0xFF][..]);
        assert!(matches!(FrameCodec.decode(&mut wire), Err(CodecError::FrameTooLarge(_))));
    }

    #[test]
    fn test_short_body_is_malformed() {
        let mut wire = BytesMut::from(&[TAG_ACK, 3, 0, 0, 0, 1, 2, 3][..]);
        assert!(matches!(FrameCodec.decode(&mut wire), Err(CodecError::Malformed(_))));
    }

    #[test]
    fn test_failed_encode_leaves_buffer_as_it_was() {
        let mut wire = encode(Frame::Ack { record: RecordId(4) });
        let before = wire.clone();

        let announce = Frame::Announce { node: "n".repeat(70_000), role: Role::Live, epoch: 1 };
        assert!(matches!(FrameCodec.encode(announce, &mut wire), Err(CodecError::Malformed(_))));
        assert_eq!(wire, before);

        assert_eq!(FrameCodec.decode(&mut wire).unwrap(), Some(Frame::Ack { record: RecordId(4) }));
        assert!(wire.is_empty());
    }

    fn frame_strategy() -> impl Strategy<Value = Frame> {
        prop_oneof![
            ("[a-z0-9-]{0,16}", 1u8..=5, any::<u64>()).prop_map(|(node, role, epoch)| Frame::Announce {
                node,
                role: Role::from_u8(role).unwrap(),
                epoch,
            }),
            Just(Frame::SyncBegin),
            ("[a-z./]{1,24}", any::<u64>(), proptest::collection::vec(any::<u8>(), 0..64))
                .prop_map(|(address, sequence, body)| Frame::PageWrite { address, sequence, body }),
            ("[a-z./]{1,24}", any::<u64>()).prop_map(|(address, sequence)| Frame::PageDepage { address, sequence }),
            (any::<u64>(), any::<u64>()).prop_map(|(record, message)| Frame::SyncEnd {
                last_record: RecordId(record),
                last_message: RecordId(message),
            }),
            any::<u64>().prop_map(|id| Frame::Ack { record: RecordId(id) }),
            any::<u64>().prop_map(|id| Frame::MessageAck { record: RecordId(id) }),
            any::<u64>().prop_map(|epoch| Frame::StepDown { epoch }),
            (1u64.., 1u64..).prop_map(|(id, target)| Frame::MessageRecord(JournalRecord {
                id: RecordId(id),
                tx: None,
                body: RecordBody::Delete { target: RecordId(target) },
            })),
            any::<u64>().prop_map(|timestamp_ms| Frame::Heartbeat { timestamp_ms }),
            (1u64.., proptest::collection::vec(any::<u8>(), 0..64))
                .prop_map(|(id, payload)| Frame::Record(JournalRecord { id: RecordId(id), tx: None, body: RecordBody::Add { payload } })),
        ]
    }

    proptest! {
        #[test]
        fn test_stream_of_frames_decodes_in_order(frames in proptest::collection::vec(frame_strategy(), 1..12)) {
            let mut wire = BytesMut::new();
            for frame in &frames {
                FrameCodec.encode(frame.clone(), &mut wire).unwrap();
            }
            let mut decoded = Vec::new();
            while let Some(frame) = FrameCodec.decode(&mut wire).unwrap() {
                decoded.push(frame);
            }
            prop_assert_eq!(decoded, frames);
        }
    }
}
