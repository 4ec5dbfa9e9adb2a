use crate::{HttpError, MessageHeader};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum ChunkState {
    Size,
    SizeExt,
    SizeLf,
    Data,
    DataCr,
    DataLf,
    Trailer0,
    TrailerLine,
    TrailerLf,
    FinalLf,
    Done,
}

/// Incremental `Transfer-Encoding: chunked` decoder (read side only).
///
/// Chunk extensions are skipped; trailer lines are consumed and
/// discarded.
pub struct ChunkedDecoder {
    state: ChunkState,
    remaining: u64,
    size_seen: bool,
}

impl Default for ChunkedDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkedDecoder {
    pub fn new() -> Self {
        ChunkedDecoder { state: ChunkState::Size, remaining: 0, size_seen: false }
    }

    pub fn done(&self) -> bool {
        self.state == ChunkState::Done
    }

    /// Decodes from `input`, appending payload bytes to `out`. Returns
    /// the number of input bytes consumed.
    pub fn feed(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<usize, HttpError> {
        let mut i = 0;
        while i < input.len() {
            let b = input[i];
            match self.state {
                ChunkState::Size => match (b as char).to_digit(16) {
                    Some(d) => {
                        self.remaining = self
                            .remaining
                            .checked_mul(16)
                            .and_then(|v| v.checked_add(u64::from(d)))
                            .ok_or(HttpError::Protocol("chunk size overflow"))?;
                        self.size_seen = true;
                        i += 1;
                    }
                    None => {
                        if !self.size_seen {
                            return Err(HttpError::Protocol("missing chunk size"));
                        }
                        self.state = match b {
                            b';' => ChunkState::SizeExt,
                            b'\r' => ChunkState::SizeLf,
                            b'\n' => self.after_size(),
                            _ => return Err(HttpError::Protocol("bad chunk size line")),
                        };
                        i += 1;
                    }
                },
                ChunkState::SizeExt => {
                    if b == b'\r' {
                        self.state = ChunkState::SizeLf;
                    } else if b == b'\n' {
                        self.state = self.after_size();
                    }
                    i += 1;
                }
                ChunkState::SizeLf => {
                    if b != b'\n' {
                        return Err(HttpError::Protocol("chunk size line missing LF"));
                    }
                    self.state = self.after_size();
                    i += 1;
                }
                ChunkState::Data => {
                    let take = usize::try_from(self.remaining)
                        .unwrap_or(usize::MAX)
                        .min(input.len() - i);
                    out.extend_from_slice(&input[i..i + take]);
                    self.remaining -= take as u64;
                    i += take;
                    if self.remaining == 0 {
                        self.state = ChunkState::DataCr;
                    }
                }
                ChunkState::DataCr => {
                    self.state = match b {
                        b'\r' => ChunkState::DataLf,
                        b'\n' => {
                            self.size_seen = false;
                            ChunkState::Size
                        }
                        _ => return Err(HttpError::Protocol("chunk data missing CRLF")),
                    };
                    i += 1;
                }
                ChunkState::DataLf => {
                    if b != b'\n' {
                        return Err(HttpError::Protocol("chunk data missing LF"));
                    }
                    self.size_seen = false;
                    self.state = ChunkState::Size;
                    i += 1;
                }
                ChunkState::Trailer0 => {
                    self.state = match b {
                        b'\r' => ChunkState::FinalLf,
                        b'\n' => ChunkState::Done,
                        _ => ChunkState::TrailerLine,
                    };
                    i += 1;
                }
                ChunkState::TrailerLine => {
                    if b == b'\r' {
                        self.state = ChunkState::TrailerLf;
                    } else if b == b'\n' {
                        self.state = ChunkState::Trailer0;
                    }
                    i += 1;
                }
                ChunkState::TrailerLf => {
                    if b != b'\n' {
                        return Err(HttpError::Protocol("trailer line missing LF"));
                    }
                    self.state = ChunkState::Trailer0;
                    i += 1;
                }
                ChunkState::FinalLf => {
                    if b != b'\n' {
                        return Err(HttpError::Protocol("final chunk missing LF"));
                    }
                    self.state = ChunkState::Done;
                    i += 1;
                }
                ChunkState::Done => return Ok(i),
            }
        }
        Ok(i)
    }

    fn after_size(&mut self) -> ChunkState {
        if self.remaining == 0 {
            ChunkState::Trailer0
        } else {
            ChunkState::Data
        }
    }
}

enum BodyMode {
    None,
    Length(u64),
    Chunked(ChunkedDecoder),
    UntilClose,
}

/// Reads one message body according to the message's headers.
pub struct BodyReader {
    mode: BodyMode,
    pub body: Vec<u8>,
    limit: usize,
}

impl BodyReader {
    /// Chooses the body mode from the parsed header. Responses without a
    /// length and without chunking run until the peer closes.
    pub fn for_header(header: &MessageHeader, response: bool, limit: usize) -> Self {
        let mode = if header.chunked() {
            BodyMode::Chunked(ChunkedDecoder::new())
        } else if let Some(n) = header.content_length() {
            if n == 0 { BodyMode::None } else { BodyMode::Length(n) }
        } else if response {
            BodyMode::UntilClose
        } else {
            BodyMode::None
        };
        BodyReader { mode, body: Vec::new(), limit }
    }

    pub fn done(&self) -> bool {
        match &self.mode {
            BodyMode::None => true,
            BodyMode::Length(n) => *n == 0,
            BodyMode::Chunked(dec) => dec.done(),
            BodyMode::UntilClose => false,
        }
    }

    /// True when only a peer close can terminate this body.
    pub fn runs_until_close(&self) -> bool {
        matches!(self.mode, BodyMode::UntilClose)
    }

    /// Consumes body bytes from `input`; returns how many were taken.
    pub fn feed(&mut self, input: &[u8]) -> Result<usize, HttpError> {
        let consumed = match &mut self.mode {
            BodyMode::None => 0,
            BodyMode::Length(n) => {
                let take = usize::try_from(*n).unwrap_or(usize::MAX).min(input.len());
                self.body.extend_from_slice(&input[..take]);
                *n -= take as u64;
                take
            }
            BodyMode::Chunked(dec) => dec.feed(input, &mut self.body)?,
            BodyMode::UntilClose => {
                self.body.extend_from_slice(input);
                input.len()
            }
        };
        if self.body.len() > self.limit {
            return Err(HttpError::BodyTooLarge);
        }
        Ok(consumed)
    }
}
