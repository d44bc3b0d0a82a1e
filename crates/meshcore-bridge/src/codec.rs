//! Serial wire format for MeshCore bridge frames
//!
//! Every mesh packet crossing the serial link is wrapped as:
//!
//! ```text
//! ┌──────────┬──────────────┬───────────────┬───────────────┐
//! │ C0 3E    │ length (LE)  │ payload       │ checksum (LE) │
//! │ 2 bytes  │ 2 bytes      │ length bytes  │ 2 bytes       │
//! └──────────┴──────────────┴───────────────┴───────────────┘
//! ```
//!
//! The checksum is Fletcher-16 over the two length bytes followed by the
//! payload. The payload itself is opaque and is never inspected.
//!
//! [`try_decode`] is a pure function over a byte slice. [`FrameDecoder`]
//! wraps it with the growing buffer the serial read loop feeds.

use bytes::{Buf, Bytes, BytesMut};
use std::fmt;
use tracing::{debug, trace};

use crate::error::{BridgeError, Result};

/// Frame start marker, in wire order
pub const FRAME_MAGIC: [u8; 2] = [0xC0, 0x3E];

/// Magic plus length field
pub const HEADER_SIZE: usize = 4;

/// Trailing checksum field
pub const CHECKSUM_SIZE: usize = 2;

/// Largest payload a frame may carry (MeshCore MAX_TRANS_UNIT)
pub const MAX_PAYLOAD: usize = 255;

/// Largest complete frame on the wire
pub const MAX_FRAME_SIZE: usize = HEADER_SIZE + MAX_PAYLOAD + CHECKSUM_SIZE;

/// One validated mesh packet
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    payload: Bytes,
}

impl Frame {
    /// Wrap a payload. Size is checked when the frame is encoded.
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
        }
    }

    /// The opaque mesh packet
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Consume the frame, returning its payload
    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    /// Encode this frame for the wire
    pub fn encode(&self) -> Result<Vec<u8>> {
        encode(&self.payload)
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("len", &self.payload.len())
            .finish()
    }
}

/// Fletcher-16 checksum, both running sums modulo 255
pub fn fletcher16(data: &[u8]) -> u16 {
    fletcher16_parts(&[data])
}

fn fletcher16_parts(parts: &[&[u8]]) -> u16 {
    let mut sum1: u16 = 0;
    let mut sum2: u16 = 0;
    for byte in parts.iter().flat_map(|part| part.iter()) {
        sum1 = (sum1 + u16::from(*byte)) % 255;
        sum2 = (sum2 + sum1) % 255;
    }
    (sum2 << 8) | sum1
}

/// Encode a payload into a complete frame
pub fn encode(payload: &[u8]) -> Result<Vec<u8>> {
    if payload.len() > MAX_PAYLOAD {
        return Err(BridgeError::PayloadTooLarge {
            size: payload.len(),
            max: MAX_PAYLOAD,
        });
    }

    let length = (payload.len() as u16).to_le_bytes();
    let checksum = fletcher16_parts(&[&length[..], payload]);

    let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len() + CHECKSUM_SIZE);
    frame.extend_from_slice(&FRAME_MAGIC);
    frame.extend_from_slice(&length);
    frame.extend_from_slice(payload);
    frame.extend_from_slice(&checksum.to_le_bytes());
    Ok(frame)
}

/// Why a candidate frame was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorruptReason {
    /// Declared length exceeds [`MAX_PAYLOAD`]
    LengthTooLarge(u16),
    /// Checksum field disagrees with the computed checksum
    ChecksumMismatch {
        /// Value carried in the frame
        received: u16,
        /// Value computed over length and payload
        computed: u16,
    },
}

impl fmt::Display for CorruptReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CorruptReason::LengthTooLarge(len) => {
                write!(f, "declared length {} exceeds {}", len, MAX_PAYLOAD)
            }
            CorruptReason::ChecksumMismatch { received, computed } => write!(
                f,
                "checksum mismatch: received 0x{:04X}, computed 0x{:04X}",
                received, computed
            ),
        }
    }
}

/// Result of one [`try_decode`] step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeOutcome {
    /// A valid frame starts at offset 0
    Frame {
        /// The decoded frame
        frame: Frame,
        /// Total bytes the frame occupied
        consumed: usize,
    },
    /// Magic present (or possibly present) but the frame is not complete yet
    NeedMore,
    /// No magic at offset 0; drop one byte and scan again
    Resync,
    /// A complete candidate failed validation; drop `consumed` bytes
    Corrupt {
        /// Bytes to drop, which always covers the bad magic occurrence
        consumed: usize,
        /// Validation failure
        reason: CorruptReason,
    },
}

impl DecodeOutcome {
    /// Bytes the caller should drop from the front of its buffer
    pub fn consumed(&self) -> usize {
        match self {
            DecodeOutcome::Frame { consumed, .. } => *consumed,
            DecodeOutcome::NeedMore => 0,
            DecodeOutcome::Resync => 1,
            DecodeOutcome::Corrupt { consumed, .. } => *consumed,
        }
    }

    /// The decoded frame, if any
    pub fn into_frame(self) -> Option<Frame> {
        match self {
            DecodeOutcome::Frame { frame, .. } => Some(frame),
            _ => None,
        }
    }
}

/// Try to decode one frame from the start of `buf`
///
/// Never blocks and never consumes more than one magic marker's worth of
/// bytes when the data at offset 0 is not a valid frame, so a real frame
/// overlapping a corrupt candidate is still found on a later call.
pub fn try_decode(buf: &[u8]) -> DecodeOutcome {
    match buf {
        [] => return DecodeOutcome::NeedMore,
        [first] if *first == FRAME_MAGIC[0] => return DecodeOutcome::NeedMore,
        [first, ..] if *first != FRAME_MAGIC[0] => return DecodeOutcome::Resync,
        [_, second, ..] if *second != FRAME_MAGIC[1] => return DecodeOutcome::Resync,
        _ => {}
    }

    if buf.len() < HEADER_SIZE {
        return DecodeOutcome::NeedMore;
    }

    let length_bytes = [buf[2], buf[3]];
    let length = u16::from_le_bytes(length_bytes);
    if length as usize > MAX_PAYLOAD {
        return DecodeOutcome::Corrupt {
            consumed: FRAME_MAGIC.len(),
            reason: CorruptReason::LengthTooLarge(length),
        };
    }

    let payload_end = HEADER_SIZE + length as usize;
    let frame_size = payload_end + CHECKSUM_SIZE;
    if buf.len() < frame_size {
        return DecodeOutcome::NeedMore;
    }

    let payload = &buf[HEADER_SIZE..payload_end];
    let received = u16::from_le_bytes([buf[payload_end], buf[payload_end + 1]]);
    let computed = fletcher16_parts(&[&length_bytes[..], payload]);
    if received != computed {
        return DecodeOutcome::Corrupt {
            consumed: FRAME_MAGIC.len(),
            reason: CorruptReason::ChecksumMismatch { received, computed },
        };
    }

    DecodeOutcome::Frame {
        frame: Frame::new(Bytes::copy_from_slice(payload)),
        consumed: frame_size,
    }
}

/// Counters kept by a [`FrameDecoder`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecoderStats {
    /// Valid frames produced
    pub frames: u64,
    /// Candidates rejected for bad length or checksum
    pub corrupt: u64,
    /// Bytes dropped while resynchronizing
    pub discarded_bytes: u64,
}

/// Incremental decoder over an unreliable byte stream
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: BytesMut,
    stats: DecoderStats,
}

impl FrameDecoder {
    /// Create an empty decoder
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(MAX_FRAME_SIZE * 2),
            stats: DecoderStats::default(),
        }
    }

    /// Append raw bytes read from the device
    pub fn push(&mut self, data: &[u8]) {
        trace!(bytes = data.len(), "Buffered serial bytes");
        self.buffer.extend_from_slice(data);
    }

    /// Decode the next complete frame, or `None` once more bytes are needed
    pub fn next_frame(&mut self) -> Option<Frame> {
        let mut skipped = 0usize;
        let frame = loop {
            match try_decode(&self.buffer) {
                DecodeOutcome::Frame { frame, consumed } => {
                    self.buffer.advance(consumed);
                    self.stats.frames += 1;
                    break Some(frame);
                }
                DecodeOutcome::NeedMore => break None,
                DecodeOutcome::Resync => {
                    self.buffer.advance(1);
                    skipped += 1;
                }
                DecodeOutcome::Corrupt { consumed, reason } => {
                    debug!(%reason, "Discarding corrupt frame candidate");
                    self.buffer.advance(consumed);
                    self.stats.corrupt += 1;
                    skipped += consumed;
                }
            }
        };

        if skipped > 0 {
            debug!(discarded = skipped, "Resynchronized serial stream");
            self.stats.discarded_bytes += skipped as u64;
        }
        frame
    }

    /// Drop any partial data, e.g. after the device reconnects
    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    /// Bytes waiting for the rest of a frame
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Decoder counters
    pub fn stats(&self) -> DecoderStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};

    fn decode_all(stream: &[u8]) -> Vec<Frame> {
        let mut decoder = FrameDecoder::new();
        decoder.push(stream);
        std::iter::from_fn(|| decoder.next_frame()).collect()
    }

    #[test]
    fn test_fletcher16_known_values() {
        assert_eq!(fletcher16(b""), 0);
        assert_eq!(fletcher16(b"abcde"), 0xC8F0);
        assert_eq!(fletcher16(b"abcdef"), 0x2057);
    }

    #[test]
    fn test_encode_layout() {
        let framed = encode(b"\xAA").unwrap();
        assert_eq!(framed, vec![0xC0, 0x3E, 0x01, 0x00, 0xAA, 0xAB, 0xAD]);

        let framed = encode(b"hello").unwrap();
        assert_eq!(&framed[..4], &[0xC0, 0x3E, 0x05, 0x00]);
        assert_eq!(&framed[4..9], b"hello");
        assert_eq!(&framed[9..], &[0x1B, 0x50]);
    }

    #[test]
    fn test_encode_empty_payload() {
        assert_eq!(encode(b"").unwrap(), vec![0xC0, 0x3E, 0, 0, 0, 0]);
    }

    #[test]
    fn test_encode_rejects_oversized() {
        let payload = vec![0u8; MAX_PAYLOAD + 1];
        match encode(&payload) {
            Err(BridgeError::PayloadTooLarge { size, max }) => {
                assert_eq!(size, MAX_PAYLOAD + 1);
                assert_eq!(max, MAX_PAYLOAD);
            }
            other => panic!("expected PayloadTooLarge, got {:?}", other),
        }
        assert_eq!(encode(&payload[..MAX_PAYLOAD]).unwrap().len(), MAX_FRAME_SIZE);
    }

    #[test]
    fn test_round_trip_all_lengths() {
        for len in 0..=MAX_PAYLOAD {
            let payload: Vec<u8> = (0..len).map(|i| (i * 7 + len) as u8).collect();
            let framed = encode(&payload).unwrap();
            match try_decode(&framed) {
                DecodeOutcome::Frame { frame, consumed } => {
                    assert_eq!(frame.payload().as_ref(), payload.as_slice());
                    assert_eq!(consumed, framed.len());
                }
                other => panic!("length {} failed to decode: {:?}", len, other),
            }
        }
    }

    #[test]
    fn test_partial_frame_needs_more() {
        let framed = encode(b"partial").unwrap();
        for cut in 0..framed.len() {
            assert_eq!(try_decode(&framed[..cut]), DecodeOutcome::NeedMore, "cut {}", cut);
        }
    }

    #[test]
    fn test_missing_magic_resyncs_one_byte() {
        assert_eq!(try_decode(b"\x00\xC0\x3E"), DecodeOutcome::Resync);
        assert_eq!(try_decode(&[0xC0, 0x00]), DecodeOutcome::Resync);
        assert_eq!(DecodeOutcome::Resync.consumed(), 1);
    }

    #[test]
    fn test_bad_checksum_skips_magic_only() {
        let mut framed = encode(b"payload").unwrap();
        let last = framed.len() - 1;
        framed[last] ^= 0xFF;

        match try_decode(&framed) {
            DecodeOutcome::Corrupt { consumed, reason } => {
                assert_eq!(consumed, FRAME_MAGIC.len());
                assert!(matches!(reason, CorruptReason::ChecksumMismatch { .. }));
            }
            other => panic!("expected Corrupt, got {:?}", other),
        }
    }

    #[test]
    fn test_oversized_length_is_corrupt() {
        let buf = [0xC0, 0x3E, 0xFF, 0xFF, 0x00];
        match try_decode(&buf) {
            DecodeOutcome::Corrupt { consumed, reason } => {
                assert_eq!(consumed, 2);
                assert_eq!(reason, CorruptReason::LengthTooLarge(0xFFFF));
            }
            other => panic!("expected Corrupt, got {:?}", other),
        }
    }

    #[test]
    fn test_payload_bit_flips_rejected() {
        let framed = encode(b"hello mesh").unwrap();
        for byte in HEADER_SIZE..framed.len() - CHECKSUM_SIZE {
            for bit in 0..8 {
                let mut corrupted = framed.clone();
                corrupted[byte] ^= 1 << bit;
                assert!(
                    decode_all(&corrupted).is_empty(),
                    "bit {} of byte {} accepted",
                    bit,
                    byte
                );
            }
        }
    }

    #[test]
    fn test_length_bit_flips_rejected() {
        let framed = encode(b"hello mesh").unwrap();
        for byte in 2..HEADER_SIZE {
            for bit in 0..8 {
                let mut corrupted = framed.clone();
                corrupted[byte] ^= 1 << bit;
                let frames = decode_all(&corrupted);
                assert!(frames.is_empty(), "bit {} of byte {} accepted", bit, byte);
            }
        }
    }

    #[test]
    fn test_resync_through_noise_and_stray_magic() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(0x5EED);
        let mut noise = |n: usize| -> Vec<u8> {
            (0..n)
                .map(|_| loop {
                    let b: u8 = rng.gen();
                    if !FRAME_MAGIC.contains(&b) {
                        break b;
                    }
                })
                .collect()
        };

        let mut stream = noise(37);
        // Stray magic with an impossible length
        stream.extend_from_slice(&[0xC0, 0x3E, 0xFF, 0x7F]);
        stream.extend(noise(5));
        // Stray magic with a plausible length but garbage checksum
        stream.extend_from_slice(&[0xC0, 0x3E, 0x03, 0x00, 0x01, 0x02, 0x03, 0x99, 0x99]);
        // Lone magic lead byte
        stream.push(0xC0);
        stream.extend(noise(3));
        let valid = encode(b"\x10\x20\x30\x40").unwrap();
        stream.extend_from_slice(&valid);
        stream.extend(noise(41));

        let frames = decode_all(&stream);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload().as_ref(), b"\x10\x20\x30\x40");
    }

    #[test]
    fn test_corrupt_candidate_overlapping_real_frame() {
        // A stray magic whose declared length swallows the start of a real frame
        let valid = encode(b"abc").unwrap();
        let mut stream = vec![0xC0, 0x3E, 0x04, 0x00, 0x55];
        stream.extend_from_slice(&valid);

        let frames = decode_all(&stream);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload().as_ref(), b"abc");
    }

    #[test]
    fn test_decoder_handles_split_reads() {
        let mut decoder = FrameDecoder::new();
        let first = encode(b"one").unwrap();
        let second = encode(b"two").unwrap();
        let mut stream = first.clone();
        stream.extend_from_slice(&second);

        for chunk in stream.chunks(3) {
            decoder.push(chunk);
        }
        assert_eq!(decoder.next_frame().unwrap().payload().as_ref(), b"one");
        assert_eq!(decoder.next_frame().unwrap().payload().as_ref(), b"two");
        assert!(decoder.next_frame().is_none());
        assert_eq!(decoder.buffered(), 0);
        assert_eq!(decoder.stats().frames, 2);
    }

    #[test]
    fn test_decoder_keeps_incomplete_tail() {
        let mut decoder = FrameDecoder::new();
        let framed = encode(b"tail").unwrap();
        decoder.push(&framed[..5]);
        assert!(decoder.next_frame().is_none());
        assert_eq!(decoder.buffered(), 5);

        decoder.push(&framed[5..]);
        assert_eq!(decoder.next_frame().unwrap().payload().as_ref(), b"tail");
    }

    #[test]
    fn test_decoder_stats_count_discards() {
        let mut decoder = FrameDecoder::new();
        decoder.push(b"\x01\x02\x03");
        let mut bad = encode(b"x").unwrap();
        bad[5] ^= 0x01;
        decoder.push(&bad);
        assert!(decoder.next_frame().is_none());

        let stats = decoder.stats();
        assert_eq!(stats.corrupt, 1);
        assert_eq!(stats.frames, 0);
        assert_eq!(stats.discarded_bytes, bad.len() as u64 + 3);
    }

    #[test]
    fn test_decoder_reset_drops_partial() {
        let mut decoder = FrameDecoder::new();
        decoder.push(&[0xC0, 0x3E, 0x05]);
        decoder.reset();
        assert_eq!(decoder.buffered(), 0);
    }
}
