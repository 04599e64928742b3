//! Delta framing.
//!
//! ```text
//! "BBPD" | version u32 | next_ref_id i32 | count i32
//!   | count x (len i32, len x ref i32)      -- -1 marks an unrecorded slot
//!   | body_len u32 | body | crc32 u32       -- crc over everything before it
//! ```
//!
//! All integers are big-endian.

use bbp_types::ReferenceId;

use crate::error::{CodecError, Result};
use crate::wire::{put_i32, put_u32, ByteReader};

pub const FRAME_MAGIC: &[u8; 4] = b"BBPD";
pub const FRAME_VERSION: u32 = 1;

/// Summary of a frame, for inspection tools.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeltaHeader {
    pub version: u32,
    pub next_ref_id: ReferenceId,
    pub associations: usize,
    pub inline_objects: usize,
    pub body_len: usize,
}

/// A decoded delta: reference arrays plus the body they index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeltaFrame {
    pub next_ref_id: ReferenceId,
    pub indexes: Vec<Vec<Option<ReferenceId>>>,
    pub body: Vec<u8>,
}

impl DeltaFrame {
    pub fn header(&self) -> DeltaHeader {
        DeltaHeader {
            version: FRAME_VERSION,
            next_ref_id: self.next_ref_id,
            associations: self.indexes.len(),
            inline_objects: self.indexes.iter().map(Vec::len).sum(),
            body_len: self.body.len(),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let arrays: usize = self.indexes.iter().map(|i| 4 + 4 * i.len()).sum();
        let mut out = Vec::with_capacity(24 + arrays + self.body.len());
        out.extend_from_slice(FRAME_MAGIC);
        put_u32(&mut out, FRAME_VERSION);
        put_i32(&mut out, self.next_ref_id.value() as i32);
        put_i32(&mut out, self.indexes.len() as i32);
        for index in &self.indexes {
            put_i32(&mut out, index.len() as i32);
            for slot in index {
                put_i32(&mut out, ReferenceId::to_wire(*slot));
            }
        }
        put_u32(&mut out, self.body.len() as u32);
        out.extend_from_slice(&self.body);
        let crc = crc32fast::hash(&out);
        put_u32(&mut out, crc);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < FRAME_MAGIC.len() || &bytes[..4] != FRAME_MAGIC {
            return Err(CodecError::BadMagic);
        }
        if bytes.len() < 8 {
            return Err(CodecError::Truncated {
                needed: 8,
                available: bytes.len(),
            });
        }
        let (content, trailer) = bytes.split_at(bytes.len() - 4);
        let expected = ByteReader::new(trailer).u32()?;
        let actual = crc32fast::hash(content);
        if expected != actual {
            return Err(CodecError::Checksum { expected, actual });
        }

        let mut r = ByteReader::new(&content[4..]);
        let version = r.u32()?;
        if version != FRAME_VERSION {
            return Err(CodecError::UnsupportedVersion(version));
        }
        let next_ref_id = ReferenceId::from_wire(r.i32()?).unwrap_or(ReferenceId::new(0));
        let count = non_negative(r.i32()?)?;
        let mut indexes = Vec::with_capacity(count.min(r.remaining() / 4));
        for _ in 0..count {
            let len = non_negative(r.i32()?)?;
            let mut index = Vec::with_capacity(len.min(r.remaining() / 4));
            for _ in 0..len {
                index.push(ReferenceId::from_wire(r.i32()?));
            }
            indexes.push(index);
        }
        let body = r.bytes()?.to_vec();
        Ok(Self {
            next_ref_id,
            indexes,
            body,
        })
    }
}

/// Read only the header fields, for tools that list deltas.
pub fn peek_header(bytes: &[u8]) -> Result<DeltaHeader> {
    DeltaFrame::from_bytes(bytes).map(|f| f.header())
}

fn non_negative(v: i32) -> Result<usize> {
    usize::try_from(v).map_err(|_| CodecError::Malformed("negative length"))
}
