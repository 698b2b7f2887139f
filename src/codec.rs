use std::ops::Range;

use bytes::{Buf, BytesMut};
use thiserror::Error as ThisError;
use tokio_util::codec::{Decoder, Encoder};

use crate::config::MAX_FRAME_SIZE;
use crate::frame::{CommandFrame, Frame};
use crate::Error;

static CRLF: &[u8; 2] = b"\r\n";

/// Upper bound on the element count of an array frame.
const MAX_ARRAY_LEN: usize = 1024 * 1024;

/// Longest `*<count>` or `$<length>` line accepted before its terminator shows up.
const MAX_HEADER_LEN: usize = 32;

/// Errors found while decoding a client command. None of them is fatal to the connection: the
/// decoder drops the rest of the offending frame and resumes at the next frame boundary.
#[derive(Debug, ThisError, PartialEq)]
pub enum ProtocolError {
    #[error("protocol error; invalid array length {0:?}")]
    InvalidArrayLength(String),
    #[error("protocol error; expected '$', got {0:?}")]
    ExpectedBulkString(char),
    #[error("protocol error; invalid bulk length {0:?}")]
    InvalidBulkLength(String),
    #[error("protocol error; bulk payload is longer than its declared length of {0}")]
    BulkLengthMismatch(usize),
    #[error("protocol error; frame exceeds the limit of {0} bytes")]
    FrameTooLarge(usize),
}

/// Progress through an array frame that is not fully buffered yet.
///
/// Nothing is consumed from the read buffer until the frame completes, so every position here
/// is an offset from the start of the buffer.
#[derive(Debug)]
struct PendingArray {
    expected: usize,
    elements: Vec<Range<usize>>,
    // Where decoding resumes: just past the last fully validated element.
    offset: usize,
}

/// The tail of a malformed frame that is still being dropped.
///
/// Its error has already been yielded. Bytes are dropped as they arrive, so a huge or endless
/// tail never accumulates in the read buffer.
#[derive(Debug)]
struct Discard {
    // Elements still to drop, counting the one in progress.
    elements: usize,
    skip: Skip,
}

#[derive(Debug, Clone, Copy)]
enum Skip {
    /// At the start of an element.
    Element,
    /// Drop this many more lines; the last one ends the element.
    Lines(usize),
    /// Drop this many more bytes; they end the element.
    Bytes(usize),
}

#[derive(Debug)]
enum State {
    /// At a frame boundary or inside an inline line.
    Idle,
    Array(PendingArray),
    Discard(Discard),
}

/// Turns the connection's read buffer into [`CommandFrame`]s and encodes [`Frame`] replies.
///
/// Decoding yields `Err(ProtocolError)` items instead of failing the stream, because a
/// malformed command must not tear down the connection. Each malformed frame yields exactly one
/// error, and nothing inside it is ever decoded as a command.
pub struct FrameCodec {
    max_frame_size: usize,
    state: State,
    // How far the unterminated line being decoded has already been searched for CRLF.
    scanned: usize,
}

impl FrameCodec {
    pub fn new(max_frame_size: usize) -> FrameCodec {
        FrameCodec {
            max_frame_size,
            state: State::Idle,
            scanned: 0,
        }
    }

    fn decode_array(
        &mut self,
        src: &mut BytesMut,
    ) -> Option<Result<CommandFrame, ProtocolError>> {
        let mut pending = match std::mem::replace(&mut self.state, State::Idle) {
            State::Array(pending) => pending,
            _ => {
                let Some(line_end) = self.find_line_end(src, 1) else {
                    if src.len() > MAX_HEADER_LEN {
                        let err = ProtocolError::InvalidArrayLength(lossy(&src[1..]));
                        self.start_discard(1, Skip::Lines(1));
                        return Some(Err(err));
                    }
                    return None;
                };

                let header = &src[1..line_end];
                match parse_decimal(header) {
                    Some(n) if n > 0 && n <= MAX_ARRAY_LEN as i64 => PendingArray {
                        expected: n as usize,
                        elements: Vec::with_capacity((n as usize).min(16)),
                        offset: line_end + CRLF.len(),
                    },
                    _ => {
                        let err = ProtocolError::InvalidArrayLength(lossy(header));
                        src.advance(line_end + CRLF.len());
                        return Some(Err(err));
                    }
                }
            }
        };

        while pending.elements.len() < pending.expected {
            match self.decode_element(src, pending.offset) {
                Element::Incomplete => {
                    self.state = State::Array(pending);
                    return None;
                }
                Element::Invalid { err, resume, skip } => {
                    // The malformed element and every element after it belong to this frame.
                    src.advance(resume);
                    self.start_discard(pending.expected - pending.elements.len(), skip);
                    return Some(Err(err));
                }
                Element::Complete { payload, next } => {
                    pending.elements.push(payload);
                    pending.offset = next;
                }
            }
        }

        let frame = src.split_to(pending.offset).freeze();
        let args = pending
            .elements
            .into_iter()
            .map(|range| frame.slice(range))
            .collect();

        Some(Ok(CommandFrame::new(args)))
    }

    // $<length>\r\n<data>\r\n starting at `start`.
    fn decode_element(&mut self, src: &BytesMut, start: usize) -> Element {
        let Some(&marker) = src.get(start) else {
            return Element::Incomplete;
        };

        if marker != b'$' {
            return Element::Invalid {
                err: ProtocolError::ExpectedBulkString(marker as char),
                resume: start,
                skip: Skip::Lines(1),
            };
        }

        let Some(line_end) = self.find_line_end(src, start + 1) else {
            if src.len() - start > MAX_HEADER_LEN {
                return Element::Invalid {
                    err: ProtocolError::InvalidBulkLength(lossy(&src[start + 1..])),
                    resume: start,
                    skip: Skip::Lines(2),
                };
            }
            return Element::Incomplete;
        };

        let header = &src[start + 1..line_end];
        let length = match parse_decimal(header) {
            Some(length) if length >= 0 => length as usize,
            parsed => {
                // A null bulk string has no payload line; an unreadable header is assumed to
                // be followed by one.
                let lines = if parsed.is_some() { 1 } else { 2 };
                return Element::Invalid {
                    err: ProtocolError::InvalidBulkLength(lossy(header)),
                    resume: start,
                    skip: Skip::Lines(lines),
                };
            }
        };

        let payload_start = line_end + CRLF.len();

        if length > self.max_frame_size {
            return Element::Invalid {
                err: ProtocolError::FrameTooLarge(self.max_frame_size),
                resume: payload_start,
                skip: Skip::Bytes(length + CRLF.len()),
            };
        }

        let payload_end = payload_start + length;

        if src.len() < payload_end + CRLF.len() {
            return Element::Incomplete;
        }

        if &src[payload_end..payload_end + CRLF.len()] != CRLF {
            return Element::Invalid {
                err: ProtocolError::BulkLengthMismatch(length),
                resume: payload_end,
                skip: Skip::Lines(1),
            };
        }

        Element::Complete {
            payload: payload_start..payload_end,
            next: payload_end + CRLF.len(),
        }
    }

    // A line that does not start with '*', split on ASCII spaces.
    fn decode_inline(&mut self, src: &mut BytesMut) -> Option<CommandFrame> {
        let line_end = self.find_line_end(src, 0)?;
        let line = src.split_to(line_end + CRLF.len()).freeze();

        let args = line[..line_end]
            .split(|&b| b == b' ')
            .filter(|token| !token.is_empty())
            .map(|token| line.slice_ref(token))
            .collect();

        Some(CommandFrame::new(args))
    }

    /// Searches for the CRLF ending the line being decoded, skipping the bytes a previous call
    /// already searched.
    fn find_line_end(&mut self, src: &[u8], from: usize) -> Option<usize> {
        match find_crlf(src, self.scanned.max(from)) {
            Some(line_end) => {
                self.scanned = 0;
                Some(line_end)
            }
            None => {
                // The last byte may be the '\r' of a CRLF split across reads.
                self.scanned = src.len().saturating_sub(1).max(from);
                None
            }
        }
    }

    fn start_discard(&mut self, elements: usize, skip: Skip) {
        self.scanned = 0;
        self.state = State::Discard(Discard { elements, skip });
    }

    /// Drops buffered bytes of a malformed frame's tail. Returns `true` once the whole tail is
    /// gone and decoding can resume.
    fn discard(&mut self, src: &mut BytesMut) -> bool {
        let State::Discard(discard) = &mut self.state else {
            return true;
        };

        while discard.elements > 0 {
            match discard.skip {
                Skip::Bytes(remaining) => {
                    let dropped = remaining.min(src.len());
                    src.advance(dropped);
                    if dropped < remaining {
                        discard.skip = Skip::Bytes(remaining - dropped);
                        return false;
                    }
                    discard.elements -= 1;
                    discard.skip = Skip::Element;
                }
                Skip::Lines(lines) => match find_crlf(src, 0) {
                    Some(line_end) => {
                        src.advance(line_end + CRLF.len());
                        if lines > 1 {
                            discard.skip = Skip::Lines(lines - 1);
                        } else {
                            discard.elements -= 1;
                            discard.skip = Skip::Element;
                        }
                    }
                    None => {
                        // Keep a trailing '\r', its '\n' may arrive with the next read.
                        let keep = usize::from(src.last() == Some(&b'\r'));
                        let dropped = src.len() - keep;
                        src.advance(dropped);
                        return false;
                    }
                },
                Skip::Element => {
                    let Some(&marker) = src.first() else {
                        return false;
                    };
                    if marker != b'$' {
                        discard.skip = Skip::Lines(1);
                        continue;
                    }

                    let window = &src[..src.len().min(MAX_HEADER_LEN + CRLF.len())];
                    match find_crlf(window, 1) {
                        Some(line_end) => {
                            let length = parse_decimal(&src[1..line_end]);
                            src.advance(line_end + CRLF.len());
                            discard.skip = match length {
                                Some(length) if length >= 0 => {
                                    Skip::Bytes(length as usize + CRLF.len())
                                }
                                Some(_) => {
                                    discard.elements -= 1;
                                    Skip::Element
                                }
                                None => Skip::Lines(1),
                            };
                        }
                        None if src.len() > MAX_HEADER_LEN => discard.skip = Skip::Lines(2),
                        None => return false,
                    }
                }
            }
        }

        self.state = State::Idle;
        true
    }

    /// Gives up on a frame that outgrew `max_frame_size` before completing.
    fn abandon_oversized(&mut self, src: &mut BytesMut) -> ProtocolError {
        match std::mem::replace(&mut self.state, State::Idle) {
            State::Array(pending) => {
                src.advance(pending.offset);
                self.start_discard(
                    pending.expected - pending.elements.len(),
                    Skip::Element,
                );
            }
            // An unterminated inline line.
            _ => self.start_discard(1, Skip::Lines(1)),
        }

        ProtocolError::FrameTooLarge(self.max_frame_size)
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        FrameCodec::new(MAX_FRAME_SIZE)
    }
}

enum Element {
    Incomplete,
    Invalid {
        err: ProtocolError,
        // Where the rest of the frame starts, once the validated prefix is dropped.
        resume: usize,
        skip: Skip,
    },
    Complete {
        payload: Range<usize>,
        next: usize,
    },
}

impl Decoder for FrameCodec {
    type Item = Result<CommandFrame, ProtocolError>;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            if !self.discard(src) || src.is_empty() {
                return Ok(None);
            }

            let decoded = if matches!(self.state, State::Array(_)) || src[0] == b'*' {
                self.decode_array(src)
            } else {
                match self.decode_inline(src) {
                    // Blank lines carry no command.
                    Some(frame) if frame.is_empty() => continue,
                    Some(frame) => Some(Ok(frame)),
                    None => None,
                }
            };

            if decoded.is_some() {
                return Ok(decoded);
            }

            // Everything buffered belongs to the frame being decoded, so the buffer length
            // bounds its size.
            if src.len() > self.max_frame_size {
                return Ok(Some(Err(self.abandon_oversized(src))));
            }

            return Ok(None);
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(item) => Ok(Some(item)),
            None => {
                // A partial frame left when the peer hangs up is dropped.
                src.clear();
                self.state = State::Idle;
                self.scanned = 0;
                Ok(None)
            }
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.extend_from_slice(&frame.serialize());
        Ok(())
    }
}

fn find_crlf(src: &[u8], from: usize) -> Option<usize> {
    if from >= src.len() {
        return None;
    }

    src[from..]
        .windows(2)
        .position(|window| window == CRLF)
        .map(|index| from + index)
}

// ASCII digits with an optional leading '-'.
fn parse_decimal(digits: &[u8]) -> Option<i64> {
    let unsigned = digits.strip_prefix(b"-").unwrap_or(digits);
    if unsigned.is_empty() || !unsigned.iter().all(u8::is_ascii_digit) {
        return None;
    }

    std::str::from_utf8(digits).ok()?.parse::<i64>().ok()
}

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}
