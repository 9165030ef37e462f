//! Byte buffer and frame extraction.
//!
//! The framer accumulates bytes handed over by the transport and cuts them
//! into frames according to a [`FramingStrategy`]. Partial reads never
//! produce a frame: bytes stay buffered until the strategy is satisfied.
//!
//! Bytes that cannot belong to any frame (garbage before a registration
//! sequence, interstitial bytes between known headers) are surfaced as
//! [`Chunk::Unknown`] so the worker can still write them to the raw log.
//!
//! The buffer has a ceiling. Callers check [`Framer::enforce_ceiling`] after
//! each extraction; an overflow discards the whole buffer.

use bytes::{Buf, BytesMut};

/// Default buffer ceiling.
pub const DEFAULT_CEILING: usize = 16 * 1024;

/// How a frame ends after its header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameEnd {
    /// Total frame length in bytes, header included.
    Length(usize),
    /// Byte sequence closing the frame (kept in the frame).
    Terminator(Vec<u8>),
}

/// A known frame header and how its frames end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderRule {
    /// Header bytes starting the frame.
    pub header: Vec<u8>,
    /// End of frame rule.
    pub end: FrameEnd,
}

/// Frame delimitation rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FramingStrategy {
    /// Split on a terminator; the terminator is dropped.
    Terminator(Vec<u8>),
    /// Registration sequence followed by exactly `length` bytes.
    Registration {
        /// Start-of-frame marker.
        registration: Vec<u8>,
        /// Bytes collected after the marker.
        length: usize,
    },
    /// Several known headers, each with a fixed length or a terminator.
    HeaderDispatched(Vec<HeaderRule>),
    /// The whole buffer is one frame once the line goes quiet
    /// (request/response dialects).
    IdleGap,
    /// Frames are assembled by the strategy itself (polled devices).
    External,
}

/// A complete frame.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Frame {
    /// Registration or header bytes, empty for terminator framing.
    pub header: Vec<u8>,
    /// Frame content after the header.
    pub body: Vec<u8>,
}

impl Frame {
    /// Frame without header.
    pub fn from_body(body: impl Into<Vec<u8>>) -> Self {
        Self {
            header: Vec::new(),
            body: body.into(),
        }
    }

    /// Header followed by body, as received on the wire.
    pub fn wire(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.header.len() + self.body.len());
        out.extend_from_slice(&self.header);
        out.extend_from_slice(&self.body);
        out
    }
}

/// Output of [`Framer::extract`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Chunk {
    /// A complete frame.
    Frame(Frame),
    /// Bytes that belong to no frame.
    Unknown(Vec<u8>),
}

/// Growable byte buffer with frame extraction.
#[derive(Debug)]
pub struct Framer {
    buffer: BytesMut,
    strategy: FramingStrategy,
    ceiling: usize,
}

impl Framer {
    /// Create a framer with the given strategy and buffer ceiling.
    pub fn new(strategy: FramingStrategy, ceiling: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(ceiling.min(64 * 1024)),
            strategy,
            ceiling,
        }
    }

    /// Framing strategy in use.
    pub fn strategy(&self) -> &FramingStrategy {
        &self.strategy
    }

    /// Buffer ceiling.
    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    /// Bytes currently buffered.
    pub fn buffered(&self) -> &[u8] {
        &self.buffer
    }

    /// Number of buffered bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Append bytes read from the transport.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Drop every buffered byte.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    /// Clear the buffer if it exceeds the ceiling. Returns true on overflow.
    pub fn enforce_ceiling(&mut self) -> bool {
        if self.buffer.len() > self.ceiling {
            self.buffer.clear();
            true
        } else {
            false
        }
    }

    /// Take the whole buffer as one frame (idle-gap framing).
    pub fn take_all(&mut self) -> Option<Frame> {
        if self.buffer.is_empty() {
            return None;
        }
        Some(Frame::from_body(self.buffer.split().to_vec()))
    }

    /// Extract every complete frame currently buffered.
    pub fn extract(&mut self) -> Vec<Chunk> {
        match self.strategy.clone() {
            FramingStrategy::Terminator(terminator) => self.extract_terminated(&terminator),
            FramingStrategy::Registration {
                registration,
                length,
            } => self.extract_registered(&registration, length),
            FramingStrategy::HeaderDispatched(rules) => self.extract_dispatched(&rules),
            FramingStrategy::IdleGap | FramingStrategy::External => Vec::new(),
        }
    }

    fn extract_terminated(&mut self, terminator: &[u8]) -> Vec<Chunk> {
        let mut out = Vec::new();
        if terminator.is_empty() {
            return out;
        }
        while let Some(pos) = find(&self.buffer, terminator) {
            let frame = self.buffer.split_to(pos).to_vec();
            self.buffer.advance(terminator.len());
            out.push(Chunk::Frame(Frame::from_body(frame)));
        }
        out
    }

    fn extract_registered(&mut self, registration: &[u8], length: usize) -> Vec<Chunk> {
        let mut out = Vec::new();
        if registration.is_empty() {
            return out;
        }
        loop {
            match find(&self.buffer, registration) {
                None => {
                    // Keep what could be the beginning of a registration
                    let keep = registration.len() - 1;
                    if self.buffer.len() > keep {
                        let unknown = self.buffer.split_to(self.buffer.len() - keep);
                        out.push(Chunk::Unknown(unknown.to_vec()));
                    }
                    break;
                }
                Some(pos) => {
                    if pos > 0 {
                        out.push(Chunk::Unknown(self.buffer.split_to(pos).to_vec()));
                    }
                    if self.buffer.len() < registration.len() + length {
                        break;
                    }
                    let header = self.buffer.split_to(registration.len()).to_vec();
                    let body = self.buffer.split_to(length).to_vec();
                    out.push(Chunk::Frame(Frame { header, body }));
                }
            }
        }
        out
    }

    fn extract_dispatched(&mut self, rules: &[HeaderRule]) -> Vec<Chunk> {
        let mut out = Vec::new();
        let max_header = rules.iter().map(|r| r.header.len()).max().unwrap_or(0);
        if max_header == 0 {
            return out;
        }
        loop {
            let Some((pos, rule)) = find_header(&self.buffer, rules) else {
                let keep = max_header - 1;
                if self.buffer.len() > keep {
                    let unknown = self.buffer.split_to(self.buffer.len() - keep);
                    out.push(Chunk::Unknown(unknown.to_vec()));
                }
                break;
            };
            if pos > 0 {
                out.push(Chunk::Unknown(self.buffer.split_to(pos).to_vec()));
            }
            let header_len = rule.header.len();
            let frame_len = match &rule.end {
                FrameEnd::Length(n) => {
                    if self.buffer.len() < *n {
                        break;
                    }
                    *n
                }
                FrameEnd::Terminator(terminator) => {
                    let rest = &self.buffer[header_len..];
                    let end = find(rest, terminator);
                    // A header seen before the terminator means this frame was cut short
                    let next = find_header(rest, rules).map(|(p, _)| p);
                    match (end, next) {
                        (Some(e), Some(n)) if n < e => {
                            out.push(Chunk::Unknown(self.buffer.split_to(header_len + n).to_vec()));
                            continue;
                        }
                        (Some(e), _) => header_len + e + terminator.len(),
                        (None, _) => break,
                    }
                }
            };
            let header = self.buffer.split_to(header_len).to_vec();
            let body = self.buffer.split_to(frame_len - header_len).to_vec();
            out.push(Chunk::Frame(Frame { header, body }));
        }
        out
    }
}

/// Position of the first occurrence of `needle` in `haystack`.
pub fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Earliest known header in `buffer`; longest header wins a tie.
fn find_header<'a>(buffer: &[u8], rules: &'a [HeaderRule]) -> Option<(usize, &'a HeaderRule)> {
    let mut best: Option<(usize, &HeaderRule)> = None;
    for rule in rules {
        if let Some(pos) = find(buffer, &rule.header) {
            best = match best {
                Some((p, r)) if p < pos || (p == pos && r.header.len() >= rule.header.len()) => {
                    Some((p, r))
                }
                _ => Some((pos, rule)),
            };
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frames(chunks: &[Chunk]) -> Vec<Vec<u8>> {
        chunks
            .iter()
            .filter_map(|c| match c {
                Chunk::Frame(f) => Some(f.body.clone()),
                Chunk::Unknown(_) => None,
            })
            .collect()
    }

    #[test]
    fn terminator_keeps_tail() {
        let mut framer = Framer::new(FramingStrategy::Terminator(b"\n".to_vec()), DEFAULT_CEILING);
        framer.extend(b"1,2\n3,4\n5,6");
        let out = framer.extract();
        assert_eq!(frames(&out), vec![b"1,2".to_vec(), b"3,4".to_vec()]);
        assert_eq!(framer.buffered(), b"5,6");
    }

    #[test]
    fn partial_terminator_is_not_a_frame() {
        let mut framer =
            Framer::new(FramingStrategy::Terminator(b"\r\n".to_vec()), DEFAULT_CEILING);
        framer.extend(b"abc\r");
        assert!(framer.extract().is_empty());
        framer.extend(b"\ndef");
        assert_eq!(frames(&framer.extract()), vec![b"abc".to_vec()]);
        assert_eq!(framer.buffered(), b"def");
    }

    #[test]
    fn terminator_concatenation_holds_for_every_split() {
        let input: &[u8] = b"$GPGGA,1*00\r\n\r\nxx\r\n$GPRMC,2\r\n\rtail\r";
        let terminator = b"\r\n";
        for chunk_size in 1..=input.len() {
            let mut framer =
                Framer::new(FramingStrategy::Terminator(terminator.to_vec()), DEFAULT_CEILING);
            let mut rebuilt = Vec::new();
            for piece in input.chunks(chunk_size) {
                framer.extend(piece);
                for f in frames(&framer.extract()) {
                    rebuilt.extend_from_slice(&f);
                    rebuilt.extend_from_slice(terminator);
                }
            }
            rebuilt.extend_from_slice(framer.buffered());
            assert_eq!(rebuilt, input, "chunk size {chunk_size}");
        }
    }

    #[test]
    fn registration_surfaces_garbage_and_keeps_next_frame() {
        let reg = [0xFF, 0x00, 0xFF, 0x00];
        let payload: Vec<u8> = (0..84u8).collect();
        let mut framer = Framer::new(
            FramingStrategy::Registration {
                registration: reg.to_vec(),
                length: 84,
            },
            10 * 1024,
        );
        let mut input = b"garbage".to_vec();
        input.extend_from_slice(&reg);
        input.extend_from_slice(&payload);
        input.extend_from_slice(&reg);
        input.extend_from_slice(&[1, 2, 3]);
        framer.extend(&input);

        let out = framer.extract();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0], Chunk::Unknown(b"garbage".to_vec()));
        match &out[1] {
            Chunk::Frame(f) => {
                assert_eq!(f.header, reg.to_vec());
                assert_eq!(f.body, payload);
            }
            other => panic!("unexpected chunk {other:?}"),
        }
        assert_eq!(framer.buffered(), &[0xFF, 0x00, 0xFF, 0x00, 1, 2, 3]);
    }

    #[test]
    fn registration_without_marker_keeps_possible_prefix() {
        let mut framer = Framer::new(
            FramingStrategy::Registration {
                registration: vec![0xFF, 0x00, 0xFF, 0x00],
                length: 4,
            },
            1024,
        );
        framer.extend(&[1, 2, 3, 0xFF, 0x00]);
        let out = framer.extract();
        assert_eq!(out, vec![Chunk::Unknown(vec![1, 2])]);
        assert_eq!(framer.buffered(), &[3, 0xFF, 0x00]);
    }

    #[test]
    fn dispatched_headers_with_length_and_terminator() {
        let rules = vec![
            HeaderRule {
                header: b"SATHPR0001".to_vec(),
                end: FrameEnd::Length(14),
            },
            HeaderRule {
                header: b"SATPAR0002".to_vec(),
                end: FrameEnd::Terminator(b"\r\n".to_vec()),
            },
        ];
        let mut framer = Framer::new(FramingStrategy::HeaderDispatched(rules), DEFAULT_CEILING);
        framer.extend(b"zzSATHPR0001abcdSATPAR0002,1.5\r\nSATPAR00");
        let out = framer.extract();
        assert_eq!(out.len(), 3);
        assert_eq!(out[0], Chunk::Unknown(b"zz".to_vec()));
        assert_eq!(
            out[1],
            Chunk::Frame(Frame {
                header: b"SATHPR0001".to_vec(),
                body: b"abcd".to_vec()
            })
        );
        assert_eq!(
            out[2],
            Chunk::Frame(Frame {
                header: b"SATPAR0002".to_vec(),
                body: b",1.5\r\n".to_vec()
            })
        );
        assert_eq!(framer.buffered(), b"SATPAR00");
    }

    #[test]
    fn truncated_terminated_frame_becomes_unknown() {
        let rules = vec![HeaderRule {
            header: b"HDR".to_vec(),
            end: FrameEnd::Terminator(b"\n".to_vec()),
        }];
        let mut framer = Framer::new(FramingStrategy::HeaderDispatched(rules), DEFAULT_CEILING);
        framer.extend(b"HDR1,2HDR3,4\n");
        let out = framer.extract();
        assert_eq!(out[0], Chunk::Unknown(b"HDR1,2".to_vec()));
        assert_eq!(
            out[1],
            Chunk::Frame(Frame {
                header: b"HDR".to_vec(),
                body: b"3,4\n".to_vec()
            })
        );
        assert!(framer.is_empty());
    }

    #[test]
    fn overflow_clears_buffer() {
        let mut framer = Framer::new(FramingStrategy::Terminator(b"\n".to_vec()), 8);
        framer.extend(b"12345678");
        assert!(!framer.enforce_ceiling());
        framer.extend(b"9");
        assert!(framer.enforce_ceiling());
        assert!(framer.is_empty());
    }

    #[test]
    fn idle_gap_takes_everything() {
        let mut framer = Framer::new(FramingStrategy::IdleGap, 64);
        framer.extend(&[1, 3, 4]);
        assert!(framer.extract().is_empty());
        assert_eq!(framer.take_all(), Some(Frame::from_body(vec![1, 3, 4])));
        assert_eq!(framer.take_all(), None);
    }
}
