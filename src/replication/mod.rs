//! # Replication Module
//!
//! Best-effort, push-based primary→backup replication of committed WAL
//! records over a framed TCP protocol.
//!
//! The primary registers a WAL commit listener; every durable record is
//! queued to a worker that owns one persistent connection to the backup.
//! Commits **never** wait on the network — a disconnected backup costs
//! nothing but the records it misses. The backup applies each incoming
//! record through its own engine (reassigning local WAL sequences) and
//! answers one ack per record, in receive order.
//!
//! # Wire format
//!
//! Frames are `[payload_len:u32 BE][opcode:u8][body]`:
//!
//! - `0x10 Replicate` — body is the WAL record body
//!   `[sequence:u64][timestamp:u64][op:u8][payload]` (see
//!   [`crate::wal`] for payload layouts).
//! - `0x11 ReplicateAck` — body is `[status:u8][sequence:u64]`, status
//!   `0x00` OK / `0x01` error.
//!
//! `payload_len` counts the opcode byte plus the body.
//!
//! # Failure model
//!
//! Connection loss drops the in-flight send and every unacked record —
//! they are **not** retried after reconnect (documented limitation). The
//! worker reconnects on a fixed interval. Ack/record mismatches and apply
//! rejections are counted in metrics, never surfaced to writers.

// ------------------------------------------------------------------------------------------------
// Sub-modules
// ------------------------------------------------------------------------------------------------

pub mod backup;
pub mod primary;

#[cfg(test)]
mod tests;

pub use backup::{BackupMetricsSnapshot, ReplicationBackup};
pub use primary::{PrimaryMetricsSnapshot, ReplicationPrimary};

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::io::{self, Read};

use thiserror::Error;

use crate::codec::{self, CodecError};
use crate::wal::{self, LogRecord, WalError};

/// Opcode of a record-carrying frame.
pub const OPCODE_REPLICATE: u8 = 0x10;
/// Opcode of an acknowledgement frame.
pub const OPCODE_REPLICATE_ACK: u8 = 0x11;

/// Ack status: the record was applied.
pub const STATUS_OK: u8 = 0x00;
/// Ack status: the backup failed to apply the record.
pub const STATUS_ERROR: u8 = 0x01;

/// `payload_len` + `opcode`.
pub(crate) const FRAME_HEADER_SIZE: usize = 5;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors raised by the replication subsystem. None of them propagate into
/// the write path.
#[derive(Debug, Error)]
pub enum ReplicationError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A frame carried an opcode this build does not understand.
    #[error("unknown opcode 0x{0:02X}")]
    UnknownOpcode(u8),

    /// The stream ended inside a frame.
    #[error("truncated frame")]
    TruncatedFrame,

    /// A frame body failed to decode.
    #[error("corrupt frame: {0}")]
    Codec(#[from] CodecError),

    /// A record body failed to decode.
    #[error("corrupt record: {0}")]
    Record(#[from] WalError),

    /// Connecting to the peer failed.
    #[error("connect failed: {0}")]
    Connect(String),

    /// Internal consistency or locking error.
    #[error("internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Frame codec
// ------------------------------------------------------------------------------------------------

/// A decoded replication frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Frame {
    /// A record pushed by the primary.
    Replicate(LogRecord),

    /// The backup's answer for one record.
    Ack {
        ok: bool,
        sequence: u64,
    },
}

/// Encodes a `Replicate` frame.
pub(crate) fn encode_replicate_frame(record: &LogRecord) -> Result<Vec<u8>, ReplicationError> {
    let mut body = Vec::new();
    wal::encode_record_body(record, &mut body)?;

    let payload_len = u32::try_from(1 + body.len())
        .map_err(|_| CodecError::LengthOverflow(format!("frame of {} bytes", body.len())))?;
    let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + body.len());
    frame.extend_from_slice(&payload_len.to_be_bytes());
    frame.push(OPCODE_REPLICATE);
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Encodes a `ReplicateAck` frame.
pub(crate) fn encode_ack_frame(ok: bool, sequence: u64) -> Vec<u8> {
    let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + 9);
    frame.extend_from_slice(&10u32.to_be_bytes()); // opcode + status + sequence
    frame.push(OPCODE_REPLICATE_ACK);
    frame.push(if ok { STATUS_OK } else { STATUS_ERROR });
    frame.extend_from_slice(&sequence.to_be_bytes());
    frame
}

/// Decodes a frame from its opcode and body bytes.
pub(crate) fn decode_frame(opcode: u8, body: &[u8]) -> Result<Frame, ReplicationError> {
    match opcode {
        OPCODE_REPLICATE => Ok(Frame::Replicate(wal::decode_record_body(body)?)),
        OPCODE_REPLICATE_ACK => {
            let mut at = 0;
            let status = codec::take_u8(body, &mut at)?;
            let sequence = codec::take_u64(body, &mut at)?;
            Ok(Frame::Ack {
                ok: status == STATUS_OK,
                sequence,
            })
        }
        other => Err(ReplicationError::UnknownOpcode(other)),
    }
}

/// Blocking frame read; used by the primary's ack reader, which is
/// unblocked by shutting the socket down.
pub(crate) fn read_frame(stream: &mut impl Read) -> Result<Frame, ReplicationError> {
    let mut header = [0u8; FRAME_HEADER_SIZE];
    stream
        .read_exact(&mut header)
        .map_err(|e| match e.kind() {
            io::ErrorKind::UnexpectedEof => ReplicationError::TruncatedFrame,
            _ => ReplicationError::Io(e),
        })?;

    let mut word = [0u8; 4];
    word.copy_from_slice(&header[0..4]);
    let payload_len = u32::from_be_bytes(word) as usize;
    let opcode = header[4];
    if payload_len == 0 {
        return Err(ReplicationError::TruncatedFrame);
    }

    let mut body = vec![0u8; payload_len - 1];
    stream.read_exact(&mut body).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => ReplicationError::TruncatedFrame,
        _ => ReplicationError::Io(e),
    })?;

    decode_frame(opcode, &body)
}
