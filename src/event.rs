//! Parsing of raw io_buffer trace lines.
//!
//! Every allocated io_buffer leaves these lines in the debug log:
//!
//! ```text
//! IOBAlloc <caller> <buffer_addr> <size>
//! IOBFree <caller> <buffer_addr>
//! ```
//!
//! Anything else in the log is noise and is skipped.

use std::borrow::Cow;
use std::collections::VecDeque;
use std::fmt;
use std::io::{self, BufRead};
use std::ops::Range;

use serde::{Serialize, Serializer};

pub const ALLOC_TAG: &str = "IOBAlloc";
pub const FREE_TAG: &str = "IOBFree";

const ESC: char = '\u{1b}';

/// Opaque integer identifier of a buffer or a call site. Never dereferenced.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Address(pub u64);

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Allocate {
        caller: Address,
        buffer: Address,
        size: u64,
    },
    Free {
        caller: Address,
        buffer: Address,
    },
}

impl Event {
    /// Classifies one log line. Lines with an unknown leading keyword, the wrong
    /// number of tokens or an operand that isn't an integer literal yield `None`.
    pub fn parse(line: &str) -> Option<Self> {
        let tokens = line.split_whitespace().collect::<Vec<_>>();
        match tokens.as_slice() {
            [ALLOC_TAG, caller, buffer, size] => Some(Event::Allocate {
                caller: Address(parse_int(caller)?),
                buffer: Address(parse_int(buffer)?),
                size: parse_int(size)?,
            }),
            [FREE_TAG, caller, buffer] => Some(Event::Free {
                caller: Address(parse_int(caller)?),
                buffer: Address(parse_int(buffer)?),
            }),
            _ => None,
        }
    }
}

/// Parses an integer literal whose base is given by its prefix: `0x` hex, `0o` octal,
/// `0b` binary, a bare leading `0` octal, decimal otherwise.
pub fn parse_int(token: &str) -> Option<u64> {
    let (digits, radix) = if let Some(hex) = strip_radix_prefix(token, 'x') {
        (hex, 16)
    } else if let Some(oct) = strip_radix_prefix(token, 'o') {
        (oct, 8)
    } else if let Some(bin) = strip_radix_prefix(token, 'b') {
        (bin, 2)
    } else if token.len() > 1 && token.starts_with('0') {
        (&token[1..], 8)
    } else {
        (token, 10)
    };

    // from_str_radix would accept a leading '+'
    if digits.is_empty() || !digits.starts_with(|c: char| c.is_ascii_alphanumeric()) {
        return None;
    }
    u64::from_str_radix(digits, radix).ok()
}

fn strip_radix_prefix(token: &str, marker: char) -> Option<&str> {
    let rest = token.strip_prefix('0')?;
    rest.strip_prefix(marker)
        .or_else(|| rest.strip_prefix(marker.to_ascii_uppercase()))
}

/// Removes terminal escape sequences: CSI sequences (`ESC [ ... final`) and two byte
/// `ESC x` escapes.
pub fn strip_ansi(line: &str) -> Cow<'_, str> {
    if !line.contains(ESC) {
        return Cow::Borrowed(line);
    }

    let mut out = String::with_capacity(line.len());
    let mut chars = line.chars();
    while let Some(c) = chars.next() {
        if c != ESC {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('[') => {
                // parameters and intermediates run until the final byte in @..~
                for c in chars.by_ref() {
                    if ('@'..='~').contains(&c) {
                        break;
                    }
                }
            }
            Some(_) | None => {}
        }
    }
    Cow::Owned(out)
}

/// Lazily reads a trace and yields `(line_index, event)` for every recognised line.
///
/// Lines end at `\n`, `\r\n` or a lone `\r`. The index counts every line read,
/// including the skipped ones. An I/O error ends the iteration; call
/// [`Scanner::finish`] afterwards to surface it.
pub struct Scanner<R> {
    reader: R,
    buf: Vec<u8>,
    // lines of `buf` not yet handed out
    pending: VecDeque<Range<usize>>,
    lines: usize,
    strip_ansi: bool,
    error: Option<io::Error>,
}

impl<R: BufRead> Scanner<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buf: Vec::new(),
            pending: VecDeque::new(),
            lines: 0,
            strip_ansi: false,
            error: None,
        }
    }

    pub fn strip_ansi(mut self, strip: bool) -> Self {
        self.strip_ansi = strip;
        self
    }

    /// Returns the number of lines read, or the error that cut reading short.
    pub fn finish(self) -> io::Result<usize> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.lines),
        }
    }

    /// Reads up to the next `\n` and queues the lines in that chunk. Returns false at
    /// end of input or on error.
    fn fill(&mut self) -> bool {
        self.buf.clear();
        match self.reader.read_until(b'\n', &mut self.buf) {
            Ok(0) => return false,
            Ok(_) => {}
            Err(err) => {
                self.error = Some(err);
                return false;
            }
        }

        let mut end = self.buf.len();
        if self.buf[..end].ends_with(b"\n") {
            end -= 1;
        }
        // either the \r of a \r\n or a lone \r closing the last line
        if self.buf[..end].ends_with(b"\r") {
            end -= 1;
        }
        let mut start = 0;
        for (i, &b) in self.buf[..end].iter().enumerate() {
            if b == b'\r' {
                self.pending.push_back(start..i);
                start = i + 1;
            }
        }
        self.pending.push_back(start..end);
        true
    }
}

impl<R: BufRead> Iterator for Scanner<R> {
    type Item = (usize, Event);

    fn next(&mut self) -> Option<Self::Item> {
        if self.error.is_some() {
            return None;
        }
        loop {
            let range = match self.pending.pop_front() {
                Some(range) => range,
                None if self.fill() => continue,
                None => return None,
            };
            let index = self.lines;
            self.lines += 1;

            let line = String::from_utf8_lossy(&self.buf[range]);
            let event = if self.strip_ansi {
                Event::parse(&strip_ansi(&line))
            } else {
                Event::parse(&line)
            };
            match event {
                Some(event) => return Some((index, event)),
                None => tracing::trace!("{index}: skipped {:?}", line),
            }
        }
    }
}
