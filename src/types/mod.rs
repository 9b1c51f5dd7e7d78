// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Identifiers and small enums shared by the journal and the paging store.

pub mod id;
pub mod enums;

pub use enums::{FileKind, FileState, RecordKind, TxState};
pub use id::{FileId, PageId, RecordId, TxId};
