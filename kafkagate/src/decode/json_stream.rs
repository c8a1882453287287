// kafkagate/src/decode/json_stream.rs
//
// Incremental JSON record extractor.
//
// Consumes the request body as a stream of opaque byte chunks and emits one
// record per top-level `{...}` object. Objects may be concatenated without
// separators and may straddle any number of chunk boundaries. Records closed
// entirely inside one chunk are zero-copy slices of the chunk buffer; a record
// that spans chunks is stitched into the session's carry buffer and emitted as
// its own allocation.
//
// The scanner tracks brace depth, string literals and escape sequences so a
// brace inside a string never opens or closes an object. Each completed
// top-level span is validated as real JSON before it becomes a record; the
// first invalid span aborts the request, keeping records that already closed.

use bytes::Bytes;
use serde::de::IgnoredAny;

use crate::kafka::batch::MessageBatch;

/// Parse failure, surfaced to the client in the terminal response.
#[derive(Debug, PartialEq, Eq)]
pub enum ParseError {
    /// Malformed input; holds the diagnostic string.
    Invalid(String),
    /// The carry buffer outgrew the configured memory limit.
    Memory,
}

impl ParseError {
    pub fn diagnostic(&self) -> &str {
        match self {
            ParseError::Invalid(diag) => diag,
            ParseError::Memory => "memory limit exceeded",
        }
    }
}

/// Lexer state inside a top-level object.
#[derive(Debug, Clone, Copy)]
struct Lex {
    depth:     u32,
    in_string: bool,
    escaped:   bool,
}

impl Lex {
    fn enter() -> Self {
        Lex {
            depth: 1,
            in_string: false,
            escaped: false,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum State {
    /// Between top-level values.
    Idle,
    /// Inside a top-level object. If the carry buffer is non-empty the
    /// object opened in an earlier chunk (straddling).
    Open(Lex),
}

pub struct JsonStreamParser {
    state:       State,
    /// Tail of the stream from the opening brace of an object still open at
    /// the last chunk boundary. Non-empty only between chunks of a straddle.
    carry:       Vec<u8>,
    carry_limit: Option<usize>,
    /// Total bytes consumed, for diagnostics.
    offset:      usize,
}

impl JsonStreamParser {
    pub fn new(carry_limit: Option<usize>) -> Self {
        Self {
            state: State::Idle,
            carry: Vec::new(),
            carry_limit,
            offset: 0,
        }
    }

    pub fn carry_len(&self) -> usize {
        self.carry.len()
    }

    /// Feed one body chunk; completed records are appended to `batch`.
    ///
    /// On error the batch keeps every record that closed before the offending
    /// byte (the valid prefix is still delivered by the caller).
    pub fn process_chunk(
        &mut self,
        chunk: &Bytes,
        batch: &mut MessageBatch,
    ) -> Result<(), ParseError> {
        if chunk.is_empty() {
            return Ok(());
        }

        let buf: &[u8] = chunk;
        // Offset in this chunk where the currently open object started, if it
        // started here. None while consuming the tail of a straddle.
        let mut open_at: Option<usize> = None;

        let mut i = 0;
        while i < buf.len() {
            let b = buf[i];
            match self.state {
                State::Idle => {
                    if b.is_ascii_whitespace() {
                        i += 1;
                        continue;
                    }
                    if b != b'{' {
                        return Err(self.diag_at(buf, i, "expected '{' at top level"));
                    }
                    self.state = State::Open(Lex::enter());
                    open_at = Some(i);
                    i += 1;
                }
                State::Open(mut lex) => {
                    let mut closed = false;
                    if lex.in_string {
                        if lex.escaped {
                            lex.escaped = false;
                        } else if b == b'\\' {
                            lex.escaped = true;
                        } else if b == b'"' {
                            lex.in_string = false;
                        }
                    } else {
                        match b {
                            b'"' => lex.in_string = true,
                            b'{' => lex.depth += 1,
                            b'}' => {
                                lex.depth -= 1;
                                closed = lex.depth == 0;
                            }
                            _ => {}
                        }
                    }

                    if closed {
                        let record = match open_at.take() {
                            // Closed within its opening chunk.
                            Some(start) => chunk.slice(start..i + 1),
                            // Straddle: stitch carry + prefix.
                            None => {
                                self.append_carry(&buf[..i + 1])?;
                                Bytes::from(std::mem::take(&mut self.carry))
                            }
                        };
                        self.validate(&record, i)?;
                        batch.push(record);
                        self.state = State::Idle;
                    } else {
                        self.state = State::Open(lex);
                    }
                    i += 1;
                }
            }
        }

        // End of chunk with an object still open: carry the tail.
        if matches!(self.state, State::Open(_)) {
            match open_at {
                Some(start) => self.append_carry(&buf[start..])?,
                None => self.append_carry(buf)?,
            }
        }

        self.offset += buf.len();
        Ok(())
    }

    fn append_carry(&mut self, bytes: &[u8]) -> Result<(), ParseError> {
        if let Some(limit) = self.carry_limit {
            if self.carry.len() + bytes.len() > limit {
                return Err(ParseError::Memory);
            }
        }
        self.carry.extend_from_slice(bytes);
        Ok(())
    }

    /// A balanced span must also be real JSON; `{"a":}` balances but is junk.
    fn validate(&self, record: &Bytes, chunk_pos: usize) -> Result<(), ParseError> {
        match serde_json::from_slice::<IgnoredAny>(record) {
            Ok(_) => Ok(()),
            Err(err) => Err(ParseError::Invalid(format!(
                "invalid JSON object ending at byte {}: {err}",
                self.offset + chunk_pos
            ))),
        }
    }

    fn diag_at(&self, buf: &[u8], pos: usize, reason: &str) -> ParseError {
        let end = (pos + 16).min(buf.len());
        let context = String::from_utf8_lossy(&buf[pos..end]);
        ParseError::Invalid(format!(
            "{reason} at byte {}, near {context:?}",
            self.offset + pos
        ))
    }
}
