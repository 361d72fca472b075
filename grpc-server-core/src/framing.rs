//! gRPC message framing atop HTTP/2 DATA frames (design §1, §4.4): a
//! 1-byte compressed flag, a 4-byte big-endian length, then the message
//! payload. This crate never compresses a message itself; the flag byte
//! is always read and always written as `0`.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::status::Status;

const HEADER_LEN: usize = 5;

/// Encodes one message into a single gRPC-framed `Bytes` buffer.
pub fn encode_message(payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.put_u8(0); // uncompressed
    buf.put_u32(payload.len() as u32);
    buf.extend_from_slice(payload);
    buf.freeze()
}

/// Incrementally reassembles gRPC-framed messages from a byte stream
/// that may deliver DATA frames in arbitrary chunk boundaries.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        FrameDecoder::default()
    }

    /// Feeds newly-received bytes into the decoder.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Pulls the next fully-buffered message, if any. Returns `Ok(None)`
    /// when more bytes are needed before a complete message is
    /// available; a malformed compressed-flag byte is reported instead
    /// of silently accepted, since this crate never negotiates
    /// compression.
    pub fn next_message(&mut self) -> Result<Option<Bytes>, Status> {
        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }

        let compressed = self.buf[0];
        if compressed != 0 {
            return Err(Status::internal("compressed gRPC messages are not supported"));
        }

        let len = u32::from_be_bytes([self.buf[1], self.buf[2], self.buf[3], self.buf[4]]) as usize;
        if self.buf.len() < HEADER_LEN + len {
            return Ok(None);
        }

        self.buf.advance(HEADER_LEN);
        let message = self.buf.split_to(len).freeze();
        Ok(Some(message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_then_decode_single_message() {
        let framed = encode_message(b"hello");
        let mut decoder = FrameDecoder::new();
        decoder.push(&framed);
        let message = decoder.next_message().unwrap().unwrap();
        assert_eq!(&message[..], b"hello");
        assert!(decoder.next_message().unwrap().is_none());
    }

    #[test]
    fn decoder_waits_for_split_header() {
        let framed = encode_message(b"hello world");
        let mut decoder = FrameDecoder::new();
        decoder.push(&framed[..3]);
        assert!(decoder.next_message().unwrap().is_none());
        decoder.push(&framed[3..]);
        let message = decoder.next_message().unwrap().unwrap();
        assert_eq!(&message[..], b"hello world");
    }

    #[test]
    fn decoder_handles_back_to_back_messages_in_one_chunk() {
        let mut combined = Vec::new();
        combined.extend_from_slice(&encode_message(b"one"));
        combined.extend_from_slice(&encode_message(b"two"));

        let mut decoder = FrameDecoder::new();
        decoder.push(&combined);
        assert_eq!(&decoder.next_message().unwrap().unwrap()[..], b"one");
        assert_eq!(&decoder.next_message().unwrap().unwrap()[..], b"two");
        assert!(decoder.next_message().unwrap().is_none());
    }

    #[test]
    fn decoder_rejects_compressed_flag() {
        let mut framed = encode_message(b"x").to_vec();
        framed[0] = 1;
        let mut decoder = FrameDecoder::new();
        decoder.push(&framed);
        assert!(decoder.next_message().is_err());
    }
}
