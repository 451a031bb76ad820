//! Demultiplexer for the runtime's combined stdout/stderr log stream.
//!
//! Each frame is an 8-byte header followed by a payload:
//!
//! | Byte | Meaning |
//! |---|---|
//! | 0 | stream selector (`2` = stderr, anything else = stdout) |
//! | 1-3 | reserved |
//! | 4-7 | payload length, big-endian `u32` |
//!
//! [`FrameDecoder`] is incremental: bytes are appended as they arrive and a
//! frame is only consumed once its header and full payload are buffered.
//! The one-shot [`demux_all`] drives the same decoder over a complete body,
//! so both paths yield identical events for identical bytes.

use bytes::{Buf, Bytes, BytesMut};

use crate::event::{LogEvent, StreamKind};
use crate::timestamp::split_container_timestamp;

/// Size of a frame header in bytes.
pub const HEADER_LEN: usize = 8;

/// One decoded frame before timestamp handling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub stream: StreamKind,
    pub payload: Bytes,
}

impl Frame {
    /// Convert the payload into an event, stripping the leading timestamp.
    pub fn into_event(self) -> LogEvent {
        let text = String::from_utf8_lossy(&self.payload);
        let (timestamp, message) = split_container_timestamp(&text);
        LogEvent::from_container_line(self.stream, message, timestamp)
    }
}

/// Incremental frame decoder.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw bytes read from the stream.
    pub fn extend(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Take the next complete frame, skipping zero-length ones.
    ///
    /// Returns `None` when the buffered bytes do not hold a whole frame;
    /// nothing is consumed in that case.
    pub fn next_frame(&mut self) -> Option<Frame> {
        loop {
            if self.buf.len() < HEADER_LEN {
                return None;
            }

            let stream = StreamKind::from_selector(self.buf[0]);
            let len = u32::from_be_bytes([self.buf[4], self.buf[5], self.buf[6], self.buf[7]]) as usize;

            if self.buf.len() - HEADER_LEN < len {
                return None;
            }

            self.buf.advance(HEADER_LEN);
            if len == 0 {
                continue;
            }

            let payload = self.buf.split_to(len).freeze();
            return Some(Frame { stream, payload });
        }
    }

    /// Append `chunk` and return every event it completes, in order.
    pub fn decode(&mut self, chunk: &[u8]) -> Vec<LogEvent> {
        self.extend(chunk);
        let mut events = Vec::new();
        while let Some(frame) = self.next_frame() {
            events.push(frame.into_event());
        }
        events
    }

    /// Bytes buffered but not yet forming a complete frame.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

/// Demultiplex a complete response body.
///
/// A truncated trailing frame ends decoding quietly.
pub fn demux_all(body: &[u8]) -> Vec<LogEvent> {
    FrameDecoder::new().decode(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn frame(selector: u8, payload: &[u8]) -> Vec<u8> {
        let mut out = vec![selector, 0, 0, 0];
        out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        out.extend_from_slice(payload);
        out
    }

    fn sample_stream() -> Vec<u8> {
        let mut body = Vec::new();
        for i in 0..40 {
            let selector = if i % 3 == 0 { 2 } else { 1 };
            let line = format!("2024-01-01T00:00:{:02}.000000001Z line number {}\n", i % 60, i);
            body.extend(frame(selector, line.as_bytes()));
            if i % 7 == 0 {
                body.extend(frame(1, b""));
            }
        }
        body
    }

    #[test]
    fn test_stderr_frame_example() {
        let mut body = vec![0x02, 0, 0, 0, 0, 0, 0, 0x05];
        body.extend_from_slice(b"hello");

        let events = demux_all(&body);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].stream, StreamKind::Stderr);
        assert_eq!(events[0].message, "hello");
    }

    #[test]
    fn test_stdout_and_unknown_selectors() {
        let mut body = frame(1, b"out");
        body.extend(frame(0, b"stdin-ish"));
        body.extend(frame(9, b"odd"));

        let events = demux_all(&body);
        assert_eq!(events.len(), 3);
        assert!(events.iter().all(|e| e.stream == StreamKind::Stdout));
    }

    #[test]
    fn test_zero_length_frame_produces_no_event() {
        let mut body = frame(1, b"");
        body.extend(frame(2, b"after"));

        let events = demux_all(&body);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].message, "after");
    }

    #[test]
    fn test_timestamp_stripped_from_payload() {
        let body = frame(1, b"2024-01-01T00:00:00.123456789Z started\n");
        let events = demux_all(&body);
        assert_eq!(events[0].message, "started");
        assert_eq!(events[0].timestamp.to_rfc3339(), "2024-01-01T00:00:00.123456789+00:00");
    }

    #[test]
    fn test_partial_frame_is_deferred() {
        let full = frame(2, b"a longer payload");
        let mut decoder = FrameDecoder::new();

        // Header says 16 bytes but only 5 are present.
        assert!(decoder.decode(&full[..HEADER_LEN + 5]).is_empty());
        assert_eq!(decoder.pending(), HEADER_LEN + 5);

        let events = decoder.decode(&full[HEADER_LEN + 5..]);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].message, "a longer payload");
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn test_short_header_is_deferred() {
        let mut decoder = FrameDecoder::new();
        assert!(decoder.decode(&[1, 0, 0]).is_empty());
        assert!(decoder.decode(&[0, 0, 0, 0, 2]).is_empty());
        let events = decoder.decode(b"ok");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].message, "ok");
    }

    #[test]
    fn test_truncated_trailing_frame_ends_cleanly() {
        let mut body = frame(1, b"complete");
        let tail = frame(2, b"cut off here");
        body.extend_from_slice(&tail[..tail.len() - 3]);

        let events = demux_all(&body);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].message, "complete");
    }

    #[test]
    fn test_chunk_independence() {
        let body = sample_stream();
        let whole: Vec<(StreamKind, String)> = demux_all(&body)
            .into_iter()
            .map(|e| (e.stream, e.message))
            .collect();
        assert_eq!(whole.len(), 40);

        let mut rng = StdRng::seed_from_u64(0x5eed);
        for _ in 0..50 {
            let mut decoder = FrameDecoder::new();
            let mut split = Vec::new();
            let mut offset = 0;
            while offset < body.len() {
                let step = rng.gen_range(1..=23).min(body.len() - offset);
                split.extend(
                    decoder
                        .decode(&body[offset..offset + step])
                        .into_iter()
                        .map(|e| (e.stream, e.message)),
                );
                offset += step;
            }
            assert_eq!(split, whole);
            assert_eq!(decoder.pending(), 0);
        }
    }

    #[test]
    fn test_byte_at_a_time() {
        let body = sample_stream();
        let mut decoder = FrameDecoder::new();
        let mut count = 0;
        for byte in &body {
            count += decoder.decode(std::slice::from_ref(byte)).len();
        }
        assert_eq!(count, 40);
    }
}
