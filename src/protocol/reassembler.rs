//! Stream reassembly
//!
//! TCP hands us an undifferentiated byte stream. The reassembler owns one
//! connection's accumulation buffer and cuts complete frames off its front:
//! a frame is emitted only once its header and both body segments are
//! buffered, and exactly those bytes are removed. Anything incomplete stays
//! put for the next read.

use bytes::{Buf, BytesMut};
use serde::{Deserialize, Serialize};

use super::{
    check_frame_size, frame_total_length, try_decode_body, try_decode_header, CodecError, CodecResult,
    FrameHeader, Message, DEFAULT_MAX_FRAME_SIZE, HEADER_SIZE, SYNC_MAGIC,
};

/// What to do when the bytes at the front of the buffer are not a frame start
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DesyncPolicy {
    /// Fail the connection
    #[default]
    Close,
    /// Drop bytes up to the next sync magic and carry on
    Resync,
}

#[derive(Debug, Default)]
enum State {
    /// Waiting for a complete header
    #[default]
    Header,
    /// Header decoded and cached, waiting for `total` bytes
    Body { header: FrameHeader, total: usize },
    /// Fatal framing error; no further bytes are processed
    Failed(CodecError),
}

/// Per-connection frame reassembler
#[derive(Debug)]
pub struct Reassembler {
    buffer: BytesMut,
    state: State,
    /// `0` disables the limit
    max_frame_size: usize,
    policy: DesyncPolicy,
    skipped: u64,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_MAX_FRAME_SIZE, DesyncPolicy::Close)
    }

    pub fn with_limits(max_frame_size: usize, policy: DesyncPolicy) -> Self {
        Self {
            buffer: BytesMut::with_capacity(4096),
            state: State::Header,
            max_frame_size,
            policy,
            skipped: 0,
        }
    }

    /// Append newly arrived bytes and emit every frame now complete, in
    /// arrival order. Returns how many frames were emitted.
    ///
    /// On a fatal error, frames completed before the bad bytes have already
    /// been passed to `emit`; nothing after them is, and every later call
    /// returns the same error without touching the buffer.
    pub fn on_bytes_received<F>(&mut self, chunk: &[u8], mut emit: F) -> CodecResult<usize>
    where
        F: FnMut(Message),
    {
        if let State::Failed(e) = &self.state {
            return Err(e.clone());
        }

        self.extend(chunk);

        let mut emitted = 0;
        while let Some(message) = self.next_message()? {
            emit(message);
            emitted += 1;
        }
        Ok(emitted)
    }

    /// Append bytes without extracting anything
    pub fn extend(&mut self, chunk: &[u8]) {
        if !self.is_failed() {
            self.buffer.extend_from_slice(chunk);
        }
    }

    /// Buffer for a reader to fill in place, with at least `additional`
    /// bytes of spare capacity. Bytes written here are picked up by the
    /// next [`next_message`](Self::next_message) call.
    pub fn read_buffer(&mut self, additional: usize) -> &mut BytesMut {
        self.buffer.reserve(additional);
        &mut self.buffer
    }

    /// Cut the next complete frame off the buffer.
    ///
    /// Returns `Ok(None)` if more bytes are needed.
    pub fn next_message(&mut self) -> CodecResult<Option<Message>> {
        loop {
            match &self.state {
                State::Failed(e) => return Err(e.clone()),

                State::Header => match try_decode_header(&self.buffer) {
                    Ok(None) => return Ok(None),
                    Ok(Some(header)) => {
                        if let Err(e) = check_frame_size(&header, self.max_frame_size) {
                            return Err(self.fail(e));
                        }
                        let size = frame_total_length(&header);
                        let Ok(total) = usize::try_from(size) else {
                            return Err(self.fail(CodecError::FrameTooLarge {
                                size,
                                max: usize::MAX,
                            }));
                        };
                        tracing::trace!(
                            "Frame header: type={} seq={} total={}",
                            header.msg_type,
                            header.sequence,
                            total
                        );
                        self.state = State::Body { header, total };
                    }
                    Err(e) => match self.policy {
                        DesyncPolicy::Close => return Err(self.fail(e)),
                        DesyncPolicy::Resync => {
                            if !self.resync() {
                                return Ok(None);
                            }
                        }
                    },
                },

                State::Body { header, total } => {
                    let (header, total) = (*header, *total);
                    if try_decode_body(&self.buffer, &header).is_none() {
                        return Ok(None);
                    }

                    let mut frame = self.buffer.split_to(total).freeze();
                    frame.advance(HEADER_SIZE);
                    let json = frame.split_to(header.json_len as usize);

                    self.state = State::Header;
                    return Ok(Some(Message::new(header, json, frame)));
                }
            }
        }
    }

    /// Skip forward to the next sync magic after the current position.
    ///
    /// Returns `false` if none is buffered yet; the last three bytes are kept
    /// since they may be the start of a magic split across reads.
    fn resync(&mut self) -> bool {
        let magic = SYNC_MAGIC.to_be_bytes();
        let found = self.buffer[1..]
            .windows(magic.len())
            .position(|w| w == magic.as_slice())
            .map(|p| p + 1);

        let skip = match found {
            Some(offset) => offset,
            None => self.buffer.len().saturating_sub(magic.len() - 1),
        };

        self.buffer.advance(skip);
        self.skipped += skip as u64;
        tracing::warn!(
            "Desync: skipped {} bytes ({} total){}",
            skip,
            self.skipped,
            if found.is_some() { ", realigned" } else { "" }
        );

        found.is_some()
    }

    fn fail(&mut self, error: CodecError) -> CodecError {
        tracing::error!("Framing failed: {}", error);
        self.buffer.clear();
        self.state = State::Failed(error.clone());
        error
    }

    /// Drop buffered bytes and release the allocation
    pub fn clear(&mut self) {
        self.buffer = BytesMut::new();
        self.state = State::Header;
    }

    /// Bytes held but not yet emitted as a frame
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.state, State::Failed(_))
    }

    /// Bytes discarded while resynchronizing
    pub fn skipped_bytes(&self) -> u64 {
        self.skipped
    }
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::encode;

    fn frame(sequence: u32, json: &[u8], binary: &[u8]) -> BytesMut {
        let header = FrameHeader {
            sequence,
            timestamp: 1_753_776_000,
            ..FrameHeader::new(1, 0)
        };
        let mut buf = BytesMut::new();
        encode(&header, json, binary, &mut buf).unwrap();
        buf
    }

    fn feed(reassembler: &mut Reassembler, chunk: &[u8]) -> CodecResult<Vec<Message>> {
        let mut out = Vec::new();
        reassembler.on_bytes_received(chunk, |m| out.push(m))?;
        Ok(out)
    }

    #[test]
    fn test_ping_split_10_27() {
        let bytes = frame(1, br#"{"ping":true}"#, &[]);
        assert_eq!(bytes.len(), 37);

        let mut r = Reassembler::new();
        assert!(feed(&mut r, &bytes[..10]).unwrap().is_empty());
        assert_eq!(r.buffered(), 10);

        let messages = feed(&mut r, &bytes[10..]).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].json_str().unwrap(), r#"{"ping":true}"#);
        assert!(messages[0].binary.is_empty());
        assert_eq!(messages[0].header.json_len, 13);
        assert_eq!(messages[0].header.sequence, 1);
        assert_eq!(r.buffered(), 0);
    }

    #[test]
    fn test_every_split_point_matches_whole_delivery() {
        let bytes = frame(7, br#"{"a":[1,2,3]}"#, &[0xDE, 0xAD, 0xBE, 0xEF]);

        let mut whole = Reassembler::new();
        let expected = feed(&mut whole, &bytes).unwrap();
        assert_eq!(expected.len(), 1);

        for split in 1..bytes.len() {
            let mut r = Reassembler::new();
            let mut got = feed(&mut r, &bytes[..split]).unwrap();
            got.extend(feed(&mut r, &bytes[split..]).unwrap());
            assert_eq!(got, expected, "split at {}", split);
        }
    }

    #[test]
    fn test_byte_at_a_time() {
        let bytes = frame(3, br#"{"k":"v"}"#, &[1, 2, 3]);
        let mut r = Reassembler::new();
        let mut got = Vec::new();
        for b in bytes.iter() {
            got.extend(feed(&mut r, std::slice::from_ref(b)).unwrap());
        }
        assert_eq!(got.len(), 1);
        assert_eq!(&got[0].binary[..], &[1, 2, 3]);
    }

    #[test]
    fn test_coalesced_frames_in_order() {
        let mut stream = BytesMut::new();
        for seq in 0..10u32 {
            stream.extend_from_slice(&frame(seq, format!("{{\"n\":{}}}", seq).as_bytes(), &[]));
        }

        let mut r = Reassembler::new();
        let messages = feed(&mut r, &stream).unwrap();
        let sequences: Vec<u32> = messages.iter().map(|m| m.sequence()).collect();
        assert_eq!(sequences, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_back_to_back_with_binary() {
        let mut stream = frame(1, br#"{"ping":true}"#, &[]);
        stream.extend_from_slice(&frame(2, br#"{"blob":1}"#, &[1, 2, 3, 4, 5]));

        let mut r = Reassembler::new();
        let messages = feed(&mut r, &stream).unwrap();
        assert_eq!(messages.len(), 2);
        assert!(messages[0].binary.is_empty());
        assert_eq!(messages[1].header.binary_len, 5);
        assert_eq!(&messages[1].binary[..], &[0x01, 0x02, 0x03, 0x04, 0x05]);
    }

    #[test]
    fn test_trailing_partial_frame_is_kept() {
        let first = frame(1, b"{}", &[]);
        let second = frame(2, b"{}", &[7; 16]);
        let mut stream = first.clone();
        stream.extend_from_slice(&second[..30]);

        let mut r = Reassembler::new();
        assert_eq!(feed(&mut r, &stream).unwrap().len(), 1);
        assert_eq!(r.buffered(), 30);

        let rest = feed(&mut r, &second[30..]).unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].sequence(), 2);
    }

    #[test]
    fn test_corrupt_sync_is_fatal() {
        for i in 0..4 {
            let mut bytes = frame(1, b"{}", &[]);
            bytes[i] = bytes[i].wrapping_add(1);

            let mut r = Reassembler::new();
            let mut emitted = Vec::new();
            let err = r.on_bytes_received(&bytes, |m| emitted.push(m)).unwrap_err();
            assert!(matches!(err, CodecError::Desync { .. }));
            assert!(emitted.is_empty());
            assert!(r.is_failed());

            // Later bytes are refused, even a valid frame
            let good = frame(2, b"{}", &[]);
            assert_eq!(r.on_bytes_received(&good, |m| emitted.push(m)), Err(err));
            assert!(emitted.is_empty());
            assert_eq!(r.buffered(), 0);
        }
    }

    #[test]
    fn test_frames_before_corruption_are_emitted() {
        let mut stream = frame(1, b"{}", &[]);
        let mut bad = frame(2, b"{}", &[]);
        bad[0] = 0;
        stream.extend_from_slice(&bad);
        stream.extend_from_slice(&frame(3, b"{}", &[]));

        let mut r = Reassembler::new();
        let mut emitted = Vec::new();
        let result = r.on_bytes_received(&stream, |m| emitted.push(m));
        assert!(matches!(result, Err(CodecError::Desync { .. })));
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].sequence(), 1);
    }

    #[test]
    fn test_frame_too_large_fails_before_buffering_body() {
        let bytes = frame(1, &[b'x'; 100], &[]);
        let mut r = Reassembler::with_limits(64, DesyncPolicy::Close);

        let err = feed(&mut r, &bytes[..HEADER_SIZE]).unwrap_err();
        assert_eq!(err, CodecError::FrameTooLarge { size: 124, max: 64 });
        assert!(r.is_failed());
    }

    #[test]
    fn test_resync_skips_garbage() {
        let mut stream = BytesMut::from(&b"garbage bytes before the first frame!"[..]);
        stream.extend_from_slice(&frame(1, b"{}", &[]));
        stream.extend_from_slice(&[0xAA; 5]);
        stream.extend_from_slice(&frame(2, b"{}", &[]));

        let mut r = Reassembler::with_limits(0, DesyncPolicy::Resync);
        let messages = feed(&mut r, &stream).unwrap();
        let sequences: Vec<u32> = messages.iter().map(|m| m.sequence()).collect();
        assert_eq!(sequences, vec![1, 2]);
        assert_eq!(r.skipped_bytes(), 37 + 5);
        assert!(!r.is_failed());
    }

    #[test]
    fn test_resync_magic_split_across_reads() {
        let good = frame(9, b"{}", &[]);
        let mut first = BytesMut::from(&[0x55u8; 30][..]);
        first.extend_from_slice(&good[..2]);

        let mut r = Reassembler::with_limits(0, DesyncPolicy::Resync);
        assert!(feed(&mut r, &first).unwrap().is_empty());
        // the magic prefix survives the skip
        assert_eq!(r.buffered(), 3);

        let messages = feed(&mut r, &good[2..]).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].sequence(), 9);
    }

    #[test]
    fn test_fill_in_place() {
        let bytes = frame(3, br#"{"x":1}"#, &[7, 7]);
        let mut r = Reassembler::new();

        let buf = r.read_buffer(4096);
        assert!(buf.capacity() - buf.len() >= 4096);
        buf.extend_from_slice(&bytes[..30]);
        assert!(r.next_message().unwrap().is_none());

        r.read_buffer(16).extend_from_slice(&bytes[30..]);
        let message = r.next_message().unwrap().unwrap();
        assert_eq!(message.sequence(), 3);
        assert_eq!(&message.binary[..], &[7, 7]);
        assert_eq!(r.buffered(), 0);
    }
}
