//! SMP console framing
//!
//! Over a serial console each SMP message is wrapped as
//!
//! ```text
//! raw  = length (u16 BE, message + CRC) | message | CRC-16 (u16 BE)
//! line = marker | base64(chunk of raw) | '\n'
//! ```
//!
//! `raw` is split into chunks of at most [`MAX_RAW_CHUNK`] bytes. The first
//! line of a frame uses [`FIRST_MARKER`], every following line uses
//! [`CONTINUATION_MARKER`]. Neither marker byte is part of the base64
//! alphabet, so markers can be found in a stream mixed with console output.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use smpmgr_core::crc16::smp_crc16;

/// Marker starting the first line of a frame
pub const FIRST_MARKER: [u8; 2] = [0x06, 0x09];
/// Marker starting each continuation line
pub const CONTINUATION_MARKER: [u8; 2] = [0x04, 0x14];
/// Line terminator
pub const LINE_END: u8 = 0x0A;

/// Raw bytes carried by one line (124 base64 characters, 127 bytes with
/// marker and terminator)
pub const MAX_RAW_CHUNK: usize = 93;
/// Base64 characters per full line
pub const MAX_ENCODED_CHUNK: usize = 124;
/// Longest valid line, marker and terminator included
pub const MAX_LINE_LENGTH: usize = FIRST_MARKER.len() + MAX_ENCODED_CHUNK + 1;

/// Without a marker, the receive buffer is discarded once it grows past this
const GARBAGE_LIMIT: usize = 10;

/// Length and CRC fields added around each message
const FRAME_OVERHEAD: usize = 4;

/// Encode one SMP message into console lines
pub fn encode_frame(message: &[u8]) -> Vec<u8> {
    let mut raw = Vec::with_capacity(message.len() + FRAME_OVERHEAD);
    // Messages never exceed u16 once the transport has checked them
    let length = (message.len() + 2) as u16;
    raw.extend_from_slice(&length.to_be_bytes());
    raw.extend_from_slice(message);
    raw.extend_from_slice(&smp_crc16(message).to_be_bytes());

    let lines = raw.len().div_ceil(MAX_RAW_CHUNK);
    let mut output = Vec::with_capacity(lines * MAX_LINE_LENGTH);

    for (i, chunk) in raw.chunks(MAX_RAW_CHUNK).enumerate() {
        let marker = if i == 0 {
            FIRST_MARKER
        } else {
            CONTINUATION_MARKER
        };
        output.extend_from_slice(&marker);
        output.extend_from_slice(STANDARD.encode(chunk).as_bytes());
        output.push(LINE_END);
    }

    output
}

/// Largest SMP message that fits in `mtu` bytes of console output
///
/// Three quarters of the MTU is usable after base64, minus the length and
/// CRC fields and the marker/terminator overhead of each line. The result is
/// trimmed when the final line would be nearly full.
pub fn max_message_data_size(mtu: usize) -> usize {
    let packets = mtu.div_ceil(MAX_ENCODED_CHUNK) as i64;
    let mut available = (mtu as i64 * 3) / 4 - FRAME_OVERHEAD as i64 - 3 * packets;

    if available > 0 {
        let remainder = available % MAX_RAW_CHUNK as i64;
        if remainder >= 91 {
            available -= 3;
        } else if remainder >= 88 {
            available -= 1;
        }
    }

    available.max(0) as usize
}

/// Line type, from its marker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LineKind {
    First,
    Continuation,
}

fn find_marker(data: &[u8]) -> Option<(usize, LineKind)> {
    data.windows(2).enumerate().find_map(|(i, w)| {
        if w == FIRST_MARKER {
            Some((i, LineKind::First))
        } else if w == CONTINUATION_MARKER {
            Some((i, LineKind::Continuation))
        } else {
            None
        }
    })
}

/// Reassembles SMP messages from console bytes
///
/// Bytes are fed with [`push`](Self::push) as they arrive; complete,
/// CRC-checked messages are taken out with [`next_frame`](Self::next_frame).
/// Corrupt frames and unrelated console output are dropped silently.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    /// Bytes not yet split into lines
    receive_buffer: Vec<u8>,
    /// A first line was seen and the frame is not complete yet
    continuation_expected: bool,
    /// Length of message plus CRC, from the first line
    declared_length: u16,
    /// Decoded bytes after the length field
    accumulated: Vec<u8>,
}

impl FrameDecoder {
    /// Create an empty decoder
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed received bytes
    pub fn push(&mut self, data: &[u8]) {
        self.receive_buffer.extend_from_slice(data);
    }

    /// Whether a partial frame is being reassembled
    pub fn in_frame(&self) -> bool {
        self.continuation_expected
    }

    /// Number of buffered bytes not yet split into lines
    pub fn buffered(&self) -> usize {
        self.receive_buffer.len()
    }

    /// Drop all buffered and partially reassembled data
    pub fn reset(&mut self) {
        self.receive_buffer.clear();
        self.reset_frame();
    }

    fn reset_frame(&mut self) {
        self.continuation_expected = false;
        self.declared_length = 0;
        self.accumulated.clear();
    }

    /// Process buffered bytes and return the next complete message, if any
    ///
    /// Call repeatedly until it returns `None`; one push may complete
    /// several messages.
    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        while let Some(line) = self.next_line() {
            if let Some(message) = self.process_line(line) {
                return Some(message);
            }
        }
        None
    }

    /// Split off the next complete line, discarding anything that cannot be one
    fn next_line(&mut self) -> Option<(LineKind, Vec<u8>)> {
        loop {
            let Some((start, kind)) = find_marker(&self.receive_buffer) else {
                if self.receive_buffer.len() > GARBAGE_LIMIT {
                    log::debug!(
                        "uart: discarding {} bytes without frame marker",
                        self.receive_buffer.len()
                    );
                    // A trailing byte may be the first half of a marker
                    let keep = match self.receive_buffer.last() {
                        Some(&b) if b == FIRST_MARKER[0] || b == CONTINUATION_MARKER[0] => 1,
                        _ => 0,
                    };
                    let len = self.receive_buffer.len();
                    self.receive_buffer.drain(..len - keep);
                }
                return None;
            };

            if start > 0 {
                log::trace!("uart: skipping {} bytes of console output", start);
                self.receive_buffer.drain(..start);
            }

            let body = &self.receive_buffer[FIRST_MARKER.len()..];
            let end = body.iter().position(|&b| b == LINE_END);
            let next_marker = find_marker(body).map(|(i, _)| i);

            match (end, next_marker) {
                // Another marker before the terminator: this line was cut short
                (Some(e), Some(m)) if m < e => {
                    log::debug!("uart: dropping unterminated line");
                    self.receive_buffer.drain(..FIRST_MARKER.len() + m);
                }
                (None, Some(m)) => {
                    log::debug!("uart: dropping unterminated line");
                    self.receive_buffer.drain(..FIRST_MARKER.len() + m);
                }
                (Some(e), _) => {
                    let line = body[..e].to_vec();
                    self.receive_buffer.drain(..FIRST_MARKER.len() + e + 1);
                    return Some((kind, line));
                }
                (None, None) => {
                    if self.receive_buffer.len() > MAX_LINE_LENGTH {
                        log::debug!("uart: dropping overlong line");
                        self.receive_buffer.drain(..FIRST_MARKER.len());
                        continue;
                    }
                    return None;
                }
            }
        }
    }

    fn process_line(&mut self, (kind, line): (LineKind, Vec<u8>)) -> Option<Vec<u8>> {
        let decoded = match STANDARD.decode(&line) {
            Ok(decoded) => decoded,
            Err(e) => {
                log::debug!("uart: dropping undecodable line: {}", e);
                if kind == LineKind::Continuation {
                    self.reset_frame();
                }
                return None;
            }
        };

        match kind {
            LineKind::First => {
                if self.continuation_expected {
                    log::debug!("uart: new frame before previous one completed");
                }
                self.reset_frame();

                if decoded.len() < 2 {
                    log::debug!("uart: first line too short");
                    return None;
                }
                self.declared_length = u16::from_be_bytes([decoded[0], decoded[1]]);
                self.accumulated.extend_from_slice(&decoded[2..]);
                self.continuation_expected = true;
            }
            LineKind::Continuation => {
                if !self.continuation_expected {
                    log::debug!("uart: dropping continuation line without frame");
                    return None;
                }
                self.accumulated.extend_from_slice(&decoded);
            }
        }

        self.complete_frame()
    }

    fn complete_frame(&mut self) -> Option<Vec<u8>> {
        let declared = usize::from(self.declared_length);
        if self.accumulated.len() < declared {
            return None;
        }

        let frame = std::mem::take(&mut self.accumulated);
        self.reset_frame();

        if declared < 2 {
            log::debug!("uart: frame length {} too short for CRC", declared);
            return None;
        }

        let (message, crc) = frame[..declared].split_at(declared - 2);
        let expected = u16::from_be_bytes([crc[0], crc[1]]);
        let actual = smp_crc16(message);
        if actual != expected {
            log::debug!(
                "uart: dropping frame with bad CRC (got 0x{:04X}, expected 0x{:04X})",
                actual,
                expected
            );
            return None;
        }

        log::trace!("uart: received frame of {} bytes", message.len());
        Some(message.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 + 3) as u8).collect()
    }

    fn decode_all(decoder: &mut FrameDecoder) -> Vec<Vec<u8>> {
        std::iter::from_fn(|| decoder.next_frame()).collect()
    }

    fn split_lines(frame: &[u8]) -> Vec<&[u8]> {
        frame.split_inclusive(|&b| b == LINE_END).collect()
    }

    #[test]
    fn test_line_format() {
        let frame = encode_frame(&[0x01, 0x02, 0x03]);
        let lines = split_lines(&frame);
        assert_eq!(lines.len(), 1);
        assert_eq!(&lines[0][..2], &FIRST_MARKER);
        assert_eq!(*lines[0].last().unwrap(), LINE_END);

        let raw = STANDARD.decode(&lines[0][2..lines[0].len() - 1]).unwrap();
        assert_eq!(&raw[..2], &5u16.to_be_bytes());
        assert_eq!(&raw[2..5], &[0x01, 0x02, 0x03]);
        assert_eq!(&raw[5..], &smp_crc16(&[0x01, 0x02, 0x03]).to_be_bytes());
    }

    #[test]
    fn test_chunking() {
        // 89 + 4 = 93 raw bytes fit one line exactly
        let frame = encode_frame(&payload(89));
        let lines = split_lines(&frame);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].len(), MAX_LINE_LENGTH);

        let frame = encode_frame(&payload(90));
        let lines = split_lines(&frame);
        assert_eq!(lines.len(), 2);
        assert_eq!(&lines[1][..2], &CONTINUATION_MARKER);

        let frame = encode_frame(&payload(1000));
        assert!(lines_ok(&frame));
        assert_eq!(split_lines(&frame).len(), 1004usize.div_ceil(MAX_RAW_CHUNK));
    }

    fn lines_ok(frame: &[u8]) -> bool {
        split_lines(frame).iter().all(|l| l.len() <= MAX_LINE_LENGTH)
    }

    #[test]
    fn test_round_trip_sizes() {
        for len in [0, 1, 67, 68, 88, 89, 90, 200, 1000] {
            let message = payload(len);
            let mut decoder = FrameDecoder::new();
            decoder.push(&encode_frame(&message));
            assert_eq!(decode_all(&mut decoder), vec![message], "length {}", len);
            assert!(!decoder.in_frame());
        }
    }

    #[test]
    fn test_byte_at_a_time() {
        let message = payload(300);
        let frame = encode_frame(&message);
        let mut decoder = FrameDecoder::new();
        let mut received = Vec::new();

        for &b in &frame {
            decoder.push(&[b]);
            received.extend(decode_all(&mut decoder));
        }

        assert_eq!(received, vec![message]);
    }

    #[test]
    fn test_interleaved_console_output() {
        let first = payload(150);
        let second = payload(20);

        let mut stream = b"uart:~$ ".to_vec();
        stream.extend(encode_frame(&first));
        stream.extend_from_slice(b"*** Booting Zephyr OS ***\r\n");
        stream.extend(encode_frame(&second));

        let mut decoder = FrameDecoder::new();
        decoder.push(&stream);
        assert_eq!(decode_all(&mut decoder), vec![first, second]);
    }

    #[test]
    fn test_crc_mismatch_dropped() {
        let message = payload(40);
        let mut raw = 42u16.to_be_bytes().to_vec();
        raw.extend_from_slice(&message);
        raw.extend_from_slice(&(smp_crc16(&message) ^ 0x0001).to_be_bytes());

        let mut frame = FIRST_MARKER.to_vec();
        frame.extend_from_slice(STANDARD.encode(&raw).as_bytes());
        frame.push(LINE_END);

        let mut decoder = FrameDecoder::new();
        decoder.push(&frame);
        assert!(decode_all(&mut decoder).is_empty());
        assert!(!decoder.in_frame());

        // Decoder recovers for the next frame
        decoder.push(&encode_frame(&message));
        assert_eq!(decode_all(&mut decoder), vec![message]);
    }

    #[test]
    fn test_stray_continuation_dropped() {
        let frame = encode_frame(&payload(200));
        let lines = split_lines(&frame);

        let mut decoder = FrameDecoder::new();
        decoder.push(lines[1]);
        assert!(decode_all(&mut decoder).is_empty());
        assert_eq!(decoder.buffered(), 0);

        decoder.push(&frame);
        assert_eq!(decode_all(&mut decoder), vec![payload(200)]);
    }

    #[test]
    fn test_undecodable_line_dropped() {
        let mut decoder = FrameDecoder::new();
        decoder.push(&[0x06, 0x09, b'!', b'!', b'!', LINE_END]);
        assert!(decode_all(&mut decoder).is_empty());
        assert_eq!(decoder.buffered(), 0);
        assert!(!decoder.in_frame());
    }

    #[test]
    fn test_garbage_purged() {
        let mut decoder = FrameDecoder::new();
        decoder.push(b"0123456789");
        assert!(decoder.next_frame().is_none());
        assert_eq!(decoder.buffered(), 10);

        decoder.push(b"A");
        assert!(decoder.next_frame().is_none());
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_truncated_frame_replaced_by_new_frame() {
        let first = encode_frame(&payload(200));
        let lines = split_lines(&first);

        let mut decoder = FrameDecoder::new();
        decoder.push(lines[0]);
        assert!(decode_all(&mut decoder).is_empty());
        assert!(decoder.in_frame());

        decoder.push(&encode_frame(&payload(5)));
        assert_eq!(decode_all(&mut decoder), vec![payload(5)]);
    }

    #[test]
    fn test_reset() {
        let frame = encode_frame(&payload(200));
        let mut decoder = FrameDecoder::new();
        decoder.push(&frame[..150]);
        assert!(decode_all(&mut decoder).is_empty());

        decoder.reset();
        assert_eq!(decoder.buffered(), 0);
        assert!(!decoder.in_frame());
    }

    /// Bytes on the wire for a message of `len` bytes
    fn wire_len(len: usize) -> usize {
        encode_frame(&payload(len)).len()
    }

    #[test]
    fn test_max_message_data_size_values() {
        assert_eq!(max_message_data_size(0), 0);
        assert_eq!(max_message_data_size(4), 0);
        assert_eq!(max_message_data_size(128), 86);
        assert_eq!(max_message_data_size(256), 179);
        assert_eq!(max_message_data_size(512), 365);
        assert_eq!(max_message_data_size(1024), 737);
    }

    #[test]
    fn test_max_message_data_size_fits_mtu() {
        for mtu in (128..4096).step_by(7) {
            let size = max_message_data_size(mtu);
            assert!(
                wire_len(size) <= mtu,
                "mtu {}: {} bytes encode to {}",
                mtu,
                size,
                wire_len(size)
            );
        }
    }

    #[test]
    fn test_max_message_data_size_is_decoded_budget() {
        // No end-of-line correction applies at these sizes
        for mtu in [128usize, 256, 300, 512, 1024] {
            let packets = mtu.div_ceil(MAX_ENCODED_CHUNK);
            let size = max_message_data_size(mtu);
            assert_eq!(size + FRAME_OVERHEAD + 3 * packets, mtu * 3 / 4);
        }
    }

    #[test]
    fn test_one_byte_over_capacity_exceeds_budget() {
        for mtu in [128usize, 256, 300, 512, 1024] {
            let packets = mtu.div_ceil(MAX_ENCODED_CHUNK);
            let size = max_message_data_size(mtu);
            assert!(wire_len(size) <= mtu);

            // The encoder does not enforce the limit; the budget does
            let over = size + 1;
            assert!(
                over + FRAME_OVERHEAD + 3 * packets > mtu * 3 / 4,
                "mtu {}: {} bytes still within the budget",
                mtu,
                over
            );
        }
    }
}
