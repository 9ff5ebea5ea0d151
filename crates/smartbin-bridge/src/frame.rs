//! Line framing for the bin firmware's serial output
//!
//! The firmware prints diagnostic text and status reports on the same
//! serial channel. Status reports are single lines of the form:
//!
//! ```text
//! ARDUINO_DATA:{"materialDetected":"Plastic","plastic":{"status":"clean"}}\r\n
//! ```
//!
//! [`FrameDecoder`] accumulates raw bytes, splits them on `\n`, and yields the
//! text after the prefix for every tagged line. Everything else is counted
//! and dropped. A partial line at the end of a chunk stays buffered until
//! the next [`FrameDecoder::push`].

use bytes::{Buf, BytesMut};
use tracing::{debug, trace, warn};

use crate::config::FrameConfig;

/// Counters kept by the decoder
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecoderStats {
    /// Tagged lines yielded as frames
    pub frames: u64,
    /// Complete lines without the prefix
    pub noise_lines: u64,
    /// Lines dropped for exceeding the length cap
    pub oversized_lines: u64,
    /// Tagged lines dropped for invalid UTF-8
    pub invalid_utf8: u64,
    /// Partial lines thrown away by [`FrameDecoder::discard_partial`]
    pub discarded_partials: u64,
}

/// Extracts prefix-tagged payloads from a fragmented byte stream
#[derive(Debug)]
pub struct FrameDecoder {
    prefix: String,
    max_line_length: usize,
    buffer: BytesMut,
    /// Set after an overflow; bytes are skipped up to the next terminator
    skipping: bool,
    stats: DecoderStats,
}

impl FrameDecoder {
    /// Create a decoder for the given prefix and line cap
    pub fn new(prefix: impl Into<String>, max_line_length: usize) -> Self {
        Self {
            prefix: prefix.into(),
            max_line_length,
            buffer: BytesMut::with_capacity(max_line_length.min(1024)),
            skipping: false,
            stats: DecoderStats::default(),
        }
    }

    /// Create a decoder from configuration
    pub fn from_config(config: &FrameConfig) -> Self {
        Self::new(config.prefix.clone(), config.max_line_length)
    }

    /// The prefix marker this decoder matches
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Append raw bytes read from the link
    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Return the next frame payload, or `None` once the buffer holds no
    /// complete tagged line
    pub fn next_frame(&mut self) -> Option<String> {
        loop {
            let Some(end) = self.buffer.iter().position(|&b| b == b'\n') else {
                self.enforce_line_cap();
                return None;
            };

            let line = self.buffer.split_to(end + 1);

            if self.skipping {
                // Tail of an oversized line
                self.skipping = false;
                continue;
            }

            let length = line_length(&line[..end]);
            if length > self.max_line_length {
                warn!(
                    length,
                    max = self.max_line_length,
                    "Dropping oversized serial line"
                );
                self.stats.oversized_lines += 1;
                continue;
            }

            if let Some(payload) = self.match_line(&line[..end]) {
                self.stats.frames += 1;
                return Some(payload);
            }
        }
    }

    /// Drain all complete frames currently buffered
    ///
    /// The iterator is lazy; frames not consumed stay in the decoder.
    pub fn frames(&mut self) -> Frames<'_> {
        Frames { decoder: self }
    }

    /// Bytes held for an unterminated line
    pub fn pending_len(&self) -> usize {
        self.buffer.len()
    }

    /// Drop any buffered partial line
    pub fn discard_partial(&mut self) {
        if !self.buffer.is_empty() {
            debug!(bytes = self.buffer.len(), "Discarding buffered partial frame");
            self.buffer.clear();
            self.stats.discarded_partials += 1;
        }
        self.skipping = false;
    }

    /// Current counters
    pub fn stats(&self) -> DecoderStats {
        self.stats
    }

    fn match_line(&mut self, raw: &[u8]) -> Option<String> {
        let trimmed = raw.trim_ascii();
        if trimmed.is_empty() {
            return None;
        }

        if !trimmed.starts_with(self.prefix.as_bytes()) {
            trace!(bytes = trimmed.len(), "Ignoring untagged serial line");
            self.stats.noise_lines += 1;
            return None;
        }

        match std::str::from_utf8(&trimmed[self.prefix.len()..]) {
            Ok(payload) => Some(payload.to_string()),
            Err(e) => {
                warn!(error = %e, "Dropping tagged line with invalid UTF-8");
                self.stats.invalid_utf8 += 1;
                None
            }
        }
    }

    /// Drop an unterminated line that has grown past the cap
    fn enforce_line_cap(&mut self) {
        if line_length(&self.buffer) <= self.max_line_length {
            return;
        }

        if !self.skipping {
            warn!(
                buffered = self.buffer.len(),
                max = self.max_line_length,
                "Partial serial line exceeds cap, skipping to next line break"
            );
            self.stats.oversized_lines += 1;
            self.skipping = true;
        }
        let len = self.buffer.len();
        self.buffer.advance(len);
    }
}

/// Length of a line without its `\r` terminator
fn line_length(line: &[u8]) -> usize {
    line.strip_suffix(b"\r").map_or(line.len(), <[u8]>::len)
}

/// Lazy iterator over buffered frames, see [`FrameDecoder::frames`]
pub struct Frames<'a> {
    decoder: &'a mut FrameDecoder,
}

impl Iterator for Frames<'_> {
    type Item = String;

    fn next(&mut self) -> Option<Self::Item> {
        self.decoder.next_frame()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PREFIX: &str = "ARDUINO_DATA:";

    fn decoder() -> FrameDecoder {
        FrameDecoder::new(PREFIX, 256)
    }

    #[test]
    fn test_single_frame() {
        let mut dec = decoder();
        dec.push(b"ARDUINO_DATA:{\"a\":1}\r\n");

        assert_eq!(dec.next_frame().as_deref(), Some("{\"a\":1}"));
        assert_eq!(dec.next_frame(), None);
        assert_eq!(dec.pending_len(), 0);
    }

    #[test]
    fn test_fragmented_frame() {
        let mut dec = decoder();
        dec.push(b"ARDUINO_DA");
        assert_eq!(dec.next_frame(), None);
        dec.push(b"TA:{\"level\":");
        assert_eq!(dec.next_frame(), None);
        dec.push(b"42}\nARDUINO");

        assert_eq!(dec.next_frame().as_deref(), Some("{\"level\":42}"));
        assert_eq!(dec.next_frame(), None);
        assert_eq!(dec.pending_len(), "ARDUINO".len());
    }

    #[test]
    fn test_noise_lines_are_skipped_in_order() {
        let mut dec = decoder();
        dec.push(
            b"Booting sensor array\n\
              ARDUINO_DATA:{\"n\":1}\n\
              distance=12cm\n\
              \n\
              ARDUINO_DATA:{\"n\":2}\n\
              servo ok\n\
              ARDUINO_DATA:{\"n\":3}\n",
        );

        let frames: Vec<String> = dec.frames().collect();
        assert_eq!(frames, vec!["{\"n\":1}", "{\"n\":2}", "{\"n\":3}"]);
        assert_eq!(dec.stats().frames, 3);
        assert_eq!(dec.stats().noise_lines, 3);
    }

    #[test]
    fn test_prefix_must_start_line() {
        let mut dec = decoder();
        dec.push(b"debug ARDUINO_DATA:{\"n\":1}\n");
        assert_eq!(dec.next_frame(), None);
        assert_eq!(dec.stats().noise_lines, 1);
    }

    #[test]
    fn test_oversized_partial_line_is_dropped() {
        let mut dec = FrameDecoder::new(PREFIX, 32);
        dec.push(&[b'x'; 40]);
        assert_eq!(dec.next_frame(), None);
        assert_eq!(dec.pending_len(), 0);

        // Tail of the oversized line, then a good frame
        dec.push(b"yyyy\nARDUINO_DATA:{\"ok\":true}\n");
        assert_eq!(dec.next_frame().as_deref(), Some("{\"ok\":true}"));
        assert_eq!(dec.stats().oversized_lines, 1);
    }

    #[test]
    fn test_oversized_complete_line_is_dropped() {
        let mut dec = FrameDecoder::new(PREFIX, 32);
        let mut chunk = b"ARDUINO_DATA:".to_vec();
        chunk.extend_from_slice(&[b'1'; 40]);
        chunk.extend_from_slice(b"\nARDUINO_DATA:{}\n");
        dec.push(&chunk);

        assert_eq!(dec.next_frame().as_deref(), Some("{}"));
        assert_eq!(dec.stats().oversized_lines, 1);
    }

    #[test]
    fn test_crlf_line_at_cap_is_kept() {
        // 13 byte prefix + 19 byte payload = exactly the cap
        let line = "ARDUINO_DATA:{\"n\":1234567890123}";
        let mut dec = FrameDecoder::new(PREFIX, line.len());

        dec.push(format!("{line}\r\n").as_bytes());
        assert_eq!(dec.next_frame().as_deref(), Some("{\"n\":1234567890123}"));

        // Same line split before the line feed
        dec.push(format!("{line}\r").as_bytes());
        assert_eq!(dec.next_frame(), None);
        assert_eq!(dec.pending_len(), line.len() + 1);
        dec.push(b"\n");
        assert_eq!(dec.next_frame().as_deref(), Some("{\"n\":1234567890123}"));
        assert_eq!(dec.stats().oversized_lines, 0);
    }

    #[test]
    fn test_invalid_utf8_is_dropped() {
        let mut dec = decoder();
        dec.push(b"ARDUINO_DATA:\xff\xfe\nARDUINO_DATA:{}\n");

        assert_eq!(dec.next_frame().as_deref(), Some("{}"));
        assert_eq!(dec.stats().invalid_utf8, 1);
    }

    #[test]
    fn test_discard_partial() {
        let mut dec = decoder();
        dec.push(b"ARDUINO_DATA:{\"half\":");
        dec.discard_partial();
        assert_eq!(dec.pending_len(), 0);
        assert_eq!(dec.stats().discarded_partials, 1);

        dec.push(b"1}\nARDUINO_DATA:{}\n");
        assert_eq!(dec.next_frame().as_deref(), Some("{}"));
    }

    #[test]
    fn test_frames_iterator_is_restartable() {
        let mut dec = decoder();
        dec.push(b"ARDUINO_DATA:{\"n\":1}\nARDUINO_DATA:{\"n\":2}\n");

        let first: Vec<String> = dec.frames().take(1).collect();
        assert_eq!(first, vec!["{\"n\":1}"]);

        dec.push(b"ARDUINO_DATA:{\"n\":3}\n");
        let rest: Vec<String> = dec.frames().collect();
        assert_eq!(rest, vec!["{\"n\":2}", "{\"n\":3}"]);
    }
}
