//! Length-prefixed framing
//!
//! Every frame is a 4-byte big-endian length followed by that many payload
//! bytes. Lengths above [`HARD_FRAME_LIMIT`] are rejected before any payload
//! is buffered. Frames above [`SOFT_FRAME_LIMIT`] are still read in full;
//! the connection decides to discard them.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Frames longer than this are banworthy
pub const HARD_FRAME_LIMIT: usize = 16 * 1024 * 1024;

/// Frames longer than this are read and dropped
pub const SOFT_FRAME_LIMIT: usize = 4 * 1024 * 1024;

const HEADER_LEN: usize = 4;

/// Framing errors
#[derive(Error, Debug)]
pub enum FrameError {
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
    #[error("Frame length {0} exceeds hard limit of {HARD_FRAME_LIMIT} bytes")]
    ExcessiveLength(usize),
}

/// Codec for length-prefixed frames
#[derive(Debug, Default)]
pub struct FrameCodec {
    /// Length of the frame whose header was already consumed
    pending: Option<usize>,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self { pending: None }
    }
}

impl Decoder for FrameCodec {
    type Item = BytesMut;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let len = match self.pending {
            Some(len) => len,
            None => {
                if src.len() < HEADER_LEN {
                    return Ok(None);
                }
                let len = src.get_u32() as usize;
                if len > HARD_FRAME_LIMIT {
                    return Err(FrameError::ExcessiveLength(len));
                }
                self.pending = Some(len);
                len
            }
        };

        if src.len() < len {
            src.reserve(len - src.len());
            return Ok(None);
        }

        self.pending = None;
        Ok(Some(src.split_to(len)))
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.len() > HARD_FRAME_LIMIT {
            return Err(FrameError::ExcessiveLength(item.len()));
        }

        dst.reserve(HEADER_LEN + item.len());
        dst.put_u32(item.len() as u32);
        dst.put_slice(&item);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(payload: &[u8]) -> BytesMut {
        let mut buf = BytesMut::new();
        FrameCodec::new()
            .encode(Bytes::copy_from_slice(payload), &mut buf)
            .unwrap();
        buf
    }

    #[test]
    fn test_frame_round_trip() {
        for len in [0usize, 1, 255, 4096, 70_000] {
            let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let mut buf = encode(&payload);
            assert_eq!(buf.len(), payload.len() + 4);

            let decoded = FrameCodec::new().decode(&mut buf).unwrap().unwrap();
            assert_eq!(&decoded[..], &payload[..]);
            assert!(buf.is_empty());
        }
    }

    #[test]
    fn test_frame_at_hard_limit_round_trips() {
        let payload = vec![7u8; HARD_FRAME_LIMIT];
        let mut buf = encode(&payload);
        let decoded = FrameCodec::new().decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.len(), HARD_FRAME_LIMIT);
    }

    #[test]
    fn test_partial_reads() {
        let mut full = encode(b"hello world");
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();

        // Header split across reads
        buf.extend_from_slice(&full.split_to(2));
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&full.split_to(4));
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&full);
        assert_eq!(&codec.decode(&mut buf).unwrap().unwrap()[..], b"hello world");
    }

    #[test]
    fn test_back_to_back_frames() {
        let mut buf = encode(b"one");
        buf.extend_from_slice(&encode(b"two"));

        let mut codec = FrameCodec::new();
        assert_eq!(&codec.decode(&mut buf).unwrap().unwrap()[..], b"one");
        assert_eq!(&codec.decode(&mut buf).unwrap().unwrap()[..], b"two");
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_excessive_length_rejected_from_header() {
        let mut buf = BytesMut::new();
        buf.put_u32((HARD_FRAME_LIMIT + 1) as u32);

        match FrameCodec::new().decode(&mut buf) {
            Err(FrameError::ExcessiveLength(len)) => assert_eq!(len, HARD_FRAME_LIMIT + 1),
            other => panic!("Expected excessive length, got {:?}", other.map(|f| f.map(|b| b.len()))),
        }
    }

    #[test]
    fn test_encode_rejects_oversized() {
        let mut buf = BytesMut::new();
        let err = FrameCodec::new()
            .encode(Bytes::from(vec![0u8; HARD_FRAME_LIMIT + 1]), &mut buf)
            .unwrap_err();
        assert!(matches!(err, FrameError::ExcessiveLength(_)));
        assert!(buf.is_empty());
    }
}
