// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Message journal payloads: `[address len: u16][address][sequence: u64][body]`,
//! little endian.

use byteorder::{ByteOrder, LittleEndian};

const ADDRESS_LEN_SIZE: usize = 2;
const SEQUENCE_SIZE: usize = 8;

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct ResidentMessage {
    pub address: String,
    pub sequence: u64,
    pub body: Vec<u8>,
}

/// Longest address name a payload can carry.
pub(crate) const MAX_ADDRESS_LEN: usize = u16::MAX as usize;

/// `address` must be at most [`MAX_ADDRESS_LEN`] bytes.
pub(crate) fn encode(address: &str, sequence: u64, body: &[u8]) -> Vec<u8> {
    let name = address.as_bytes();
    let mut out = vec![0u8; ADDRESS_LEN_SIZE + name.len() + SEQUENCE_SIZE];
    LittleEndian::write_u16(&mut out[..ADDRESS_LEN_SIZE], name.len() as u16);
    out[ADDRESS_LEN_SIZE..ADDRESS_LEN_SIZE + name.len()].copy_from_slice(name);
    LittleEndian::write_u64(&mut out[ADDRESS_LEN_SIZE + name.len()..], sequence);
    out.extend_from_slice(body);
    out
}

pub(crate) fn decode(payload: &[u8]) -> Option<ResidentMessage> {
    let len = LittleEndian::read_u16(payload.get(..ADDRESS_LEN_SIZE)?) as usize;
    let name_end = ADDRESS_LEN_SIZE + len;
    let address = std::str::from_utf8(payload.get(ADDRESS_LEN_SIZE..name_end)?).ok()?;
    let sequence = LittleEndian::read_u64(payload.get(name_end..name_end + SEQUENCE_SIZE)?);
    Some(ResidentMessage {
        address: address.to_string(),
        sequence,
        body: payload[name_end + SEQUENCE_SIZE..].to_vec(),
    })
}
