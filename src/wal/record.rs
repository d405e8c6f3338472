//! WAL record codec.
//!
//! Every record is a fixed 32-byte header followed by a serialized payload:
//!
//! ```text
//! +------------------+---------------------+
//! | Record Header    | Payload             |
//! | (32 bytes)       | (payload_len bytes) |
//! +------------------+---------------------+
//! ```
//!
//! The header carries the commit timestamp, payload length, record kind and
//! a CRC-64 over header fields plus payload. Decoding stops at the first
//! record whose magic or checksum does not validate; a torn tail from an
//! interrupted write is expected and treated as end-of-log.

use crc::{Crc, CRC_64_ECMA_182};
use eyre::{ensure, Result};
use serde::{Deserialize, Serialize};
use zerocopy::{FromBytes, Immutable, IntoBytes};

use crate::catalog::CatalogOp;
use crate::config::{MAX_WAL_RECORD_PAYLOAD, WAL_RECORD_HEADER_SIZE};

const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

pub const WAL_RECORD_MAGIC: u32 = 0x4C41_504F; // "OPAL"

const KIND_COMMIT: u16 = 1;
const KIND_FULL_CHECKPOINT: u16 = 2;
const KIND_DELTA_CHECKPOINT: u16 = 3;

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoBytes, FromBytes, Immutable)]
pub struct WalRecordHeader {
    pub magic: u32,
    pub payload_len: u32,
    pub commit_ts: u64,
    pub checksum: u64,
    pub kind: u16,
    _reserved: [u8; 6],
}

const _: () = assert!(std::mem::size_of::<WalRecordHeader>() == WAL_RECORD_HEADER_SIZE);

/// Payload of one WAL record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WalPayload {
    /// A committed transaction and its catalog-affecting operations.
    Commit {
        reader_allowed: bool,
        ops: Vec<CatalogOp>,
    },
    /// A full catalog snapshot was written to `catalog_file`.
    FullCheckpoint { catalog_file: String },
    /// A delta catalog checkpoint was written to `delta_file`.
    DeltaCheckpoint { delta_file: String },
}

impl WalPayload {
    fn kind(&self) -> u16 {
        match self {
            WalPayload::Commit { .. } => KIND_COMMIT,
            WalPayload::FullCheckpoint { .. } => KIND_FULL_CHECKPOINT,
            WalPayload::DeltaCheckpoint { .. } => KIND_DELTA_CHECKPOINT,
        }
    }
}

/// A decoded record.
#[derive(Debug, Clone)]
pub struct WalRecord {
    pub commit_ts: u64,
    pub payload: WalPayload,
}

fn checksum(magic: u32, payload_len: u32, commit_ts: u64, kind: u16, payload: &[u8]) -> u64 {
    let mut digest = CRC64.digest();
    digest.update(&magic.to_le_bytes());
    digest.update(&payload_len.to_le_bytes());
    digest.update(&commit_ts.to_le_bytes());
    digest.update(&kind.to_le_bytes());
    digest.update(payload);
    digest.finalize()
}

/// Encodes one record as header + payload bytes.
pub fn encode_record(commit_ts: u64, payload: &WalPayload) -> Result<Vec<u8>> {
    let body = serde_json::to_vec(payload)?;
    ensure!(
        body.len() <= MAX_WAL_RECORD_PAYLOAD,
        "WAL record payload of {} bytes exceeds the segment limit",
        body.len()
    );

    let kind = payload.kind();
    let header = WalRecordHeader {
        magic: WAL_RECORD_MAGIC,
        payload_len: body.len() as u32,
        commit_ts,
        checksum: checksum(WAL_RECORD_MAGIC, body.len() as u32, commit_ts, kind, &body),
        kind,
        _reserved: [0; 6],
    };

    let mut bytes = Vec::with_capacity(WAL_RECORD_HEADER_SIZE + body.len());
    bytes.extend_from_slice(header.as_bytes());
    bytes.extend_from_slice(&body);
    Ok(bytes)
}

/// Decodes the record starting at `buf[0]`. Returns the record and the
/// number of bytes consumed, or `None` when the buffer holds no further
/// valid record (normal end of log).
pub fn decode_record(buf: &[u8]) -> Option<(WalRecord, usize)> {
    if buf.len() < WAL_RECORD_HEADER_SIZE {
        return None;
    }
    let header = WalRecordHeader::read_from_bytes(&buf[..WAL_RECORD_HEADER_SIZE]).ok()?;
    if header.magic != WAL_RECORD_MAGIC {
        return None;
    }
    let total = WAL_RECORD_HEADER_SIZE + header.payload_len as usize;
    if buf.len() < total {
        return None;
    }
    let body = &buf[WAL_RECORD_HEADER_SIZE..total];
    if checksum(
        header.magic,
        header.payload_len,
        header.commit_ts,
        header.kind,
        body,
    ) != header.checksum
    {
        return None;
    }

    let payload: WalPayload = serde_json::from_slice(body).ok()?;
    if payload.kind() != header.kind {
        return None;
    }

    Some((
        WalRecord {
            commit_ts: header.commit_ts,
            payload,
        },
        total,
    ))
}

/// Decodes every valid record in `buf`, stopping at the first invalid one.
pub fn decode_all(buf: &[u8]) -> Vec<WalRecord> {
    let mut records = Vec::new();
    let mut offset = 0;
    while let Some((record, consumed)) = decode_record(&buf[offset..]) {
        records.push(record);
        offset += consumed;
    }
    records
}

#[cfg(test)]
mod tests {
    use super::*;

    fn commit_payload() -> WalPayload {
        WalPayload::Commit {
            reader_allowed: true,
            ops: vec![CatalogOp::CreateDatabase {
                name: "db1".to_string(),
                comment: "hello".to_string(),
            }],
        }
    }

    #[test]
    fn encode_decode_round_trip() {
        let payload = commit_payload();
        let bytes = encode_record(42, &payload).unwrap();

        let (record, consumed) = decode_record(&bytes).unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(record.commit_ts, 42);
        assert_eq!(record.payload, payload);
    }

    #[test]
    fn corrupt_payload_reads_as_end_of_log() {
        let mut bytes = encode_record(7, &commit_payload()).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        assert!(decode_record(&bytes).is_none());
    }

    #[test]
    fn torn_tail_is_ignored() {
        let first = encode_record(1, &commit_payload()).unwrap();
        let second = encode_record(
            2,
            &WalPayload::DeltaCheckpoint {
                delta_file: "catalog_delta.x.json".to_string(),
            },
        )
        .unwrap();

        let mut log = first.clone();
        log.extend_from_slice(&second[..second.len() / 2]);

        let records = decode_all(&log);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].commit_ts, 1);
    }
}
