// A subset of https://redis.io/docs/reference/protocol-spec restricted to the reply kinds this
// server produces.

use std::fmt;

use bytes::Bytes;
use itertools::Itertools;

static CRLF: &[u8; 2] = b"\r\n";

/// A reply sent back to the client.
#[derive(Clone, Debug, PartialEq)]
pub enum Frame {
    Simple(String),
    Error(String),
    Integer(i64),
    Bulk(Bytes),
    /// The null bulk string, `$-1\r\n`.
    Null,
    Array(Vec<Bytes>),
}

impl Frame {
    pub fn serialize(&self) -> Vec<u8> {
        match self {
            Frame::Simple(s) => {
                let mut bytes = Vec::with_capacity(1 + s.len() + CRLF.len());
                bytes.push(u8::from(DataType::SimpleString));
                bytes.extend_from_slice(s.as_bytes());
                bytes.extend_from_slice(CRLF);
                bytes
            }
            Frame::Error(s) => {
                let mut bytes = Vec::with_capacity(1 + s.len() + CRLF.len());
                bytes.push(u8::from(DataType::SimpleError));
                bytes.extend_from_slice(s.as_bytes());
                bytes.extend_from_slice(CRLF);
                bytes
            }
            Frame::Integer(i) => {
                let digits = i.to_string();
                let mut bytes = Vec::with_capacity(1 + digits.len() + CRLF.len());
                bytes.push(u8::from(DataType::Integer));
                bytes.extend_from_slice(digits.as_bytes());
                bytes.extend_from_slice(CRLF);
                bytes
            }
            Frame::Bulk(data) => {
                let mut bytes = Vec::with_capacity(data.len() + 16);
                write_bulk(&mut bytes, data);
                bytes
            }
            Frame::Null => {
                let mut bytes = Vec::with_capacity(5);
                bytes.push(u8::from(DataType::BulkString));
                bytes.extend_from_slice(b"-1");
                bytes.extend_from_slice(CRLF);
                bytes
            }
            Frame::Array(elements) => {
                let length_str = elements.len().to_string();
                let mut bytes = Vec::with_capacity(1 + length_str.len() + CRLF.len());
                bytes.push(u8::from(DataType::Array));
                bytes.extend_from_slice(length_str.as_bytes());
                bytes.extend_from_slice(CRLF);
                for element in elements {
                    write_bulk(&mut bytes, element);
                }
                bytes
            }
        }
    }
}

// $<length>\r\n<data>\r\n, where the length counts bytes rather than characters.
fn write_bulk(dst: &mut Vec<u8>, data: &[u8]) {
    dst.push(u8::from(DataType::BulkString));
    dst.extend_from_slice(data.len().to_string().as_bytes());
    dst.extend_from_slice(CRLF);
    dst.extend_from_slice(data);
    dst.extend_from_slice(CRLF);
}

impl From<Frame> for Vec<u8> {
    fn from(frame: Frame) -> Self {
        frame.serialize()
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Frame::Simple(s) => write!(f, "+{}", s),
            Frame::Error(s) => write!(f, "-{}", s),
            Frame::Integer(i) => write!(f, ":{}", i),
            Frame::Bulk(bytes) => write!(f, "${}", String::from_utf8_lossy(bytes)),
            Frame::Null => write!(f, "$-1"),
            Frame::Array(elements) => write!(
                f,
                "*[{}]",
                elements.iter().map(|e| String::from_utf8_lossy(e)).join(", ")
            ),
        }
    }
}

/// A decoded client command: the command name followed by its arguments.
///
/// Both array framing and inline framing decode to this type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandFrame {
    args: Vec<Bytes>,
}

impl CommandFrame {
    pub fn new(args: Vec<Bytes>) -> CommandFrame {
        CommandFrame { args }
    }

    pub fn args(&self) -> &[Bytes] {
        &self.args
    }

    pub fn len(&self) -> usize {
        self.args.len()
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    pub fn into_args(self) -> Vec<Bytes> {
        self.args
    }
}

impl<T: Into<Bytes>> FromIterator<T> for CommandFrame {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        CommandFrame::new(iter.into_iter().map(Into::into).collect())
    }
}

impl fmt::Display for CommandFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            self.args.iter().map(|a| String::from_utf8_lossy(a)).join(" ")
        )
    }
}

#[derive(Debug)]
enum DataType {
    SimpleString, // '+'
    SimpleError,  // '-'
    Integer,      // ':'
    BulkString,   // '$'
    Array,        // '*'
}

impl From<DataType> for u8 {
    fn from(value: DataType) -> Self {
        match value {
            DataType::SimpleString => b'+',
            DataType::SimpleError => b'-',
            DataType::Integer => b':',
            DataType::BulkString => b'$',
            DataType::Array => b'*',
        }
    }
}
