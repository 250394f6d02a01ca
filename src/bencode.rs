//! Streaming decoder for the bencode serialization format.
//!
//! Both torrent metadata and HTTP tracker responses are bencoded. The
//! decoder consumes one byte at a time, so it can be fed straight from a
//! network read loop without buffering a whole message first.
//!
//! Navigation is single-shot: a [`Cursor`] is consumed by the terminal
//! accessors, a new one must be taken from [`Bencode::root`] for each
//! extraction.
//!
//! ```
//! use remora::bencode::Bencode;
//!
//! let tree = Bencode::decode(b"d4:spami42ee");
//! assert_eq!(tree.root().unwrap().get("spam").unwrap().as_int().unwrap(), 42);
//! ```

use std::ops::Range;

use crate::error::Error;

/// A decoded bencode value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// `i<digits>e`, may be negative.
    Integer(i64),
    /// `<decimal-length>:<raw bytes>`, not necessarily UTF-8.
    Bytes(Vec<u8>),
    /// `l<value>*e`
    List(Vec<Node>),
    /// `d(<string><value>)*e`, keys ordered by appearance.
    Dict(Vec<(Vec<u8>, Node)>),
}

/// A node of the decoded tree. Containers remember the byte range they
/// were decoded from when raw capture is enabled, which is how the info
/// hash is recomputed from the metadata sub-dictionary.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    value: Value,
    raw: Option<Range<usize>>,
}

impl Node {
    fn terminal(value: Value) -> Self {
        Self { value, raw: None }
    }
}

#[derive(Debug)]
enum State {
    Idle,
    /// Inside `i...e`.
    Integer,
    /// Reading the decimal length prefix of a byte-string.
    Length,
    /// Reading the bytes of a byte-string.
    Str { remaining: usize },
}

#[derive(Debug)]
enum OpenKind {
    List(Vec<Node>),
    Dict {
        entries: Vec<(Vec<u8>, Node)>,
        /// A dictionary key read before its value completes the pair.
        pending_key: Option<Vec<u8>>,
    },
}

/// A container that has been opened but whose `e` terminator has not
/// arrived yet.
#[derive(Debug)]
struct Open {
    kind: OpenKind,
    start: usize,
}

/// The incremental decoder. Feed it bytes with [`Decoder::push`] and take
/// the tree with [`Decoder::finish`]; [`Bencode::decode`] does both.
#[derive(Debug, Default)]
pub struct Decoder {
    state: Option<State>,
    scratch: Vec<u8>,
    stack: Vec<Open>,
    root: Option<Node>,
    capture_raw: bool,
    pos: usize,
}

impl Decoder {
    pub fn new() -> Self {
        Self { state: Some(State::Idle), ..Default::default() }
    }

    /// Keep the undecoded byte range of every container, so that
    /// [`Cursor::as_raw`] works.
    pub fn capture_raw(mut self) -> Self {
        self.capture_raw = true;
        self
    }

    pub fn push(&mut self, byte: u8) {
        let state = self.state.take().unwrap_or(State::Idle);

        match state {
            State::Idle => self.consume_idle(byte),
            State::Integer => {
                if byte == b'e' {
                    let n = std::str::from_utf8(&self.scratch)
                        .ok()
                        .and_then(|s| s.parse::<i64>().ok());
                    self.scratch.clear();
                    if let Some(n) = n {
                        self.push_value(Node::terminal(Value::Integer(n)));
                    }
                    self.state = Some(State::Idle);
                } else if byte.is_ascii_digit() || byte == b'-' {
                    self.scratch.push(byte);
                    self.state = Some(State::Integer);
                } else {
                    // malformed integer, the value is dropped and the
                    // tree stays incomplete
                    self.scratch.clear();
                    self.state = Some(State::Idle);
                }
            }
            State::Length => {
                if byte.is_ascii_digit() {
                    self.scratch.push(byte);
                    self.state = Some(State::Length);
                } else if byte == b':' {
                    let len = std::str::from_utf8(&self.scratch)
                        .ok()
                        .and_then(|s| s.parse::<usize>().ok());
                    self.scratch.clear();
                    match len {
                        Some(0) => {
                            self.push_value(Node::terminal(Value::Bytes(
                                vec![],
                            )));
                            self.state = Some(State::Idle);
                        }
                        Some(len) => {
                            self.state = Some(State::Str { remaining: len });
                        }
                        None => self.state = Some(State::Idle),
                    }
                } else {
                    self.scratch.clear();
                    self.state = Some(State::Idle);
                }
            }
            State::Str { remaining } => {
                self.scratch.push(byte);
                if remaining > 1 {
                    self.state = Some(State::Str { remaining: remaining - 1 });
                } else {
                    let bytes = std::mem::take(&mut self.scratch);
                    self.push_value(Node::terminal(Value::Bytes(bytes)));
                    self.state = Some(State::Idle);
                }
            }
        }

        self.pos += 1;
    }

    fn consume_idle(&mut self, byte: u8) {
        self.state = Some(State::Idle);

        match byte {
            b'i' => self.state = Some(State::Integer),
            b'l' => self.stack.push(Open {
                kind: OpenKind::List(vec![]),
                start: self.pos,
            }),
            b'd' => self.stack.push(Open {
                kind: OpenKind::Dict { entries: vec![], pending_key: None },
                start: self.pos,
            }),
            b'e' => self.close_container(),
            b if b.is_ascii_digit() => {
                self.scratch.push(b);
                self.state = Some(State::Length);
            }
            // bytes outside of any value are skipped
            _ => {}
        }
    }

    fn close_container(&mut self) {
        // a stray `e` with nothing open is skipped
        let Some(open) = self.stack.pop() else { return };

        let value = match open.kind {
            OpenKind::List(items) => Value::List(items),
            OpenKind::Dict { entries, .. } => Value::Dict(entries),
        };
        let raw = self.capture_raw.then(|| open.start..self.pos + 1);

        self.push_value(Node { value, raw });
    }

    /// A terminal or closed container goes into the innermost open
    /// container, or becomes the root.
    fn push_value(&mut self, node: Node) {
        let Some(open) = self.stack.last_mut() else {
            if self.root.is_none() {
                self.root = Some(node);
            }
            return;
        };

        match &mut open.kind {
            OpenKind::List(items) => items.push(node),
            OpenKind::Dict { entries, pending_key } => match pending_key.take()
            {
                Some(key) => entries.push((key, node)),
                None => {
                    // a key must itself be a byte-string, anything else
                    // is dropped and leaves the pair incomplete
                    if let Value::Bytes(key) = node.value {
                        *pending_key = Some(key);
                    }
                }
            },
        }
    }

    /// True when every opened container was terminated and no terminal is
    /// half-read.
    pub fn is_complete(&self) -> bool {
        self.root.is_some()
            && self.stack.is_empty()
            && matches!(self.state, Some(State::Idle))
    }

    pub fn finish(self, src: &[u8]) -> Bencode {
        Bencode {
            complete: self.is_complete(),
            root: self.root,
            src: self.capture_raw.then(|| src.to_vec()),
        }
    }
}

/// A decoded bencode tree.
#[derive(Debug, Clone)]
pub struct Bencode {
    root: Option<Node>,
    src: Option<Vec<u8>>,
    complete: bool,
}

impl Bencode {
    /// Decode a whole buffer. Malformed input does not fail here, it
    /// produces an incomplete tree whose missing values surface as typed
    /// errors during navigation.
    pub fn decode(buf: &[u8]) -> Self {
        let mut decoder = Decoder::new();
        for byte in buf {
            decoder.push(*byte);
        }
        decoder.finish(buf)
    }

    /// Like [`Bencode::decode`] but retains the raw bytes of containers
    /// for [`Cursor::as_raw`].
    pub fn decode_with_raw(buf: &[u8]) -> Self {
        let mut decoder = Decoder::new().capture_raw();
        for byte in buf {
            decoder.push(*byte);
        }
        decoder.finish(buf)
    }

    /// Whether the input terminated every container it opened.
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// A cursor at the root of the tree, the starting point of every
    /// extraction.
    pub fn root(&self) -> Result<Cursor<'_>, Error> {
        let node = self.root.as_ref().ok_or(Error::BencodeIncomplete)?;
        Ok(Cursor { bencode: self, node })
    }
}

/// Walks [`Bencode`] down to one value. The terminal accessors take the
/// cursor by value: one cursor, one extraction.
#[derive(Debug, Clone, Copy)]
pub struct Cursor<'a> {
    bencode: &'a Bencode,
    node: &'a Node,
}

/// Path segments accepted by [`Cursor::get`]: a `usize` indexes a list, a
/// `&str` looks up a dictionary key.
pub trait PathSegment {
    fn walk<'a>(&self, cursor: Cursor<'a>) -> Result<Cursor<'a>, Error>;
}

impl PathSegment for usize {
    fn walk<'a>(&self, cursor: Cursor<'a>) -> Result<Cursor<'a>, Error> {
        let Value::List(items) = &cursor.node.value else {
            return Err(Error::BencodeTypeMismatch);
        };
        let node =
            items.get(*self).ok_or(Error::BencodeIndexNotFound(*self))?;
        Ok(Cursor { bencode: cursor.bencode, node })
    }
}

impl PathSegment for &str {
    fn walk<'a>(&self, cursor: Cursor<'a>) -> Result<Cursor<'a>, Error> {
        let Value::Dict(entries) = &cursor.node.value else {
            return Err(Error::BencodeTypeMismatch);
        };
        let node = entries
            .iter()
            .find(|(k, _)| k == self.as_bytes())
            .map(|(_, v)| v)
            .ok_or_else(|| Error::BencodeKeyNotFound((*self).to_owned()))?;
        Ok(Cursor { bencode: cursor.bencode, node })
    }
}

impl<'a> Cursor<'a> {
    /// Descend one level, by list index or dictionary key.
    pub fn get(self, segment: impl PathSegment) -> Result<Cursor<'a>, Error> {
        segment.walk(self)
    }

    pub fn as_int(self) -> Result<i64, Error> {
        match &self.node.value {
            Value::Integer(n) => Ok(*n),
            _ => Err(Error::BencodeTypeMismatch),
        }
    }

    pub fn as_bytes(self) -> Result<&'a [u8], Error> {
        match &self.node.value {
            Value::Bytes(b) => Ok(b),
            _ => Err(Error::BencodeTypeMismatch),
        }
    }

    pub fn as_str(self) -> Result<&'a str, Error> {
        std::str::from_utf8(self.as_bytes()?)
            .map_err(|_| Error::BencodeTypeMismatch)
    }

    /// The undecoded bytes this container was parsed from. Only available
    /// on trees built with [`Bencode::decode_with_raw`].
    pub fn as_raw(self) -> Result<&'a [u8], Error> {
        let range =
            self.node.raw.clone().ok_or(Error::BencodeRawNotCaptured)?;
        let src =
            self.bencode.src.as_deref().ok_or(Error::BencodeRawNotCaptured)?;
        src.get(range).ok_or(Error::BencodeRawNotCaptured)
    }
}
