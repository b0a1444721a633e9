//! Envelope codec.
//!
//! An envelope is `zstd(bincode(value))`. The codec is type-erased: whatever
//! was encoded on one side is decoded on the other, a command batch going to
//! the worker and a result batch coming back.

use std::io::Read;

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// zstd compression level used for every envelope.
const COMPRESSION_LEVEL: i32 = 3;

/// Upper bound on a decompressed envelope (64 MB). Matches the frame cap.
pub const MAX_DECODED_SIZE: usize = 64 * 1024 * 1024;

/// Errors raised while encoding or decoding an envelope.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to serialize envelope: {0}")]
    Serialize(#[source] bincode::Error),

    #[error("failed to compress envelope: {0}")]
    Compress(#[source] std::io::Error),

    #[error("failed to decompress envelope: {0}")]
    Decompress(#[source] std::io::Error),

    #[error("decompressed envelope exceeds {0} bytes")]
    TooLarge(usize),

    #[error("failed to deserialize envelope: {0}")]
    Deserialize(#[source] bincode::Error),
}

/// Serialize `value` and compress the result.
pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, CodecError> {
    let raw = bincode::serialize(value).map_err(CodecError::Serialize)?;
    zstd::encode_all(raw.as_slice(), COMPRESSION_LEVEL).map_err(CodecError::Compress)
}

/// Decompress `bytes` and deserialize the payload.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    decode_bounded(bytes, MAX_DECODED_SIZE)
}

/// Stream-decompress, reading at most `limit` bytes of output.
fn decode_bounded<T: DeserializeOwned>(bytes: &[u8], limit: usize) -> Result<T, CodecError> {
    let decoder = zstd::stream::Decoder::new(bytes).map_err(CodecError::Decompress)?;
    let mut raw = Vec::new();
    decoder
        .take(u64::try_from(limit).unwrap_or(u64::MAX).saturating_add(1))
        .read_to_end(&mut raw)
        .map_err(CodecError::Decompress)?;
    if raw.len() > limit {
        return Err(CodecError::TooLarge(limit));
    }
    bincode::deserialize(&raw).map_err(CodecError::Deserialize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{Command, CommandResult};
    use crate::transport::protocol::CommandRecord;

    fn sample_batch() -> Vec<Command> {
        vec![
            Command::shell("ls", ["-ahl"]),
            Command::expression("((30+10)*5+1)"),
            Command::shell("pwd", Vec::<String>::new()),
        ]
    }

    #[test]
    fn command_batch_round_trip() {
        let batch = sample_batch();
        let bytes = encode(&batch).unwrap();
        let decoded: Vec<Command> = decode(&bytes).unwrap();
        assert_eq!(decoded, batch);
    }

    #[test]
    fn result_batch_round_trip() {
        let results = vec![
            CommandResult::success("ls -ahl", "total 0\n"),
            CommandResult::failure("rm", "The use of 'rm' is not allowed"),
        ];
        let bytes = encode(&results).unwrap();
        let decoded: Vec<CommandResult> = decode(&bytes).unwrap();
        assert_eq!(decoded, results);
    }

    #[test]
    fn empty_batch_round_trip() {
        let bytes = encode(&Vec::<Command>::new()).unwrap();
        let decoded: Vec<Command> = decode(&bytes).unwrap();
        assert!(decoded.is_empty());
    }

    #[test]
    fn commands_decode_as_wire_records() {
        let bytes = encode(&sample_batch()).unwrap();
        let records: Vec<CommandRecord> = decode(&bytes).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].kind, "os");
        assert_eq!(records[1].kind, "compute");
        assert_eq!(records[1].expression.as_deref(), Some("((30+10)*5+1)"));
    }

    #[test]
    fn truncated_input_is_rejected() {
        let bytes = encode(&sample_batch()).unwrap();
        let truncated = &bytes[..bytes.len() / 2];
        assert!(decode::<Vec<Command>>(truncated).is_err());
    }

    #[test]
    fn garbage_input_is_rejected() {
        let result = decode::<Vec<Command>>(b"definitely not zstd");
        assert!(matches!(result, Err(CodecError::Decompress(_))));
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let bytes = encode(&vec![0u8; 1000]).unwrap();
        // bincode adds an 8-byte length prefix
        let decoded: Vec<u8> = decode_bounded(&bytes, 1008).unwrap();
        assert_eq!(decoded.len(), 1000);

        let result = decode_bounded::<Vec<u8>>(&bytes, 1007);
        assert!(matches!(result, Err(CodecError::TooLarge(1007))));
    }

    #[test]
    fn shape_mismatch_is_rejected() {
        // A compressed payload that is not a bincode command batch.
        let bytes = zstd::encode_all(&[0xffu8; 3][..], COMPRESSION_LEVEL).unwrap();
        let result = decode::<Vec<Command>>(&bytes);
        assert!(matches!(result, Err(CodecError::Deserialize(_))));
    }
}
