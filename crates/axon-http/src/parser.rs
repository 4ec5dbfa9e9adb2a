use crate::{HttpError, MessageHeader};

/// Bytes of header input accepted before the parser fails the message.
const MAX_INPUT: usize = 8192;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum State {
    // request line
    Cmd0,
    Cmd,
    Url0,
    Url,
    UrlEsc1,
    UrlEsc2,
    QParam,
    Protocol0,
    Protocol,
    VersionMajor0,
    VersionMajor,
    VersionMinor0,
    VersionMinor,
    End0,
    // header fields
    H0,
    FieldName,
    FieldNameSpace,
    FieldBody0,
    FieldBody,
    FieldBodyCr,
    FieldBodyCrLf,
    HEndCr,
    // status line (client mode)
    ClProtocol0,
    ClProtocol,
    ClVersionMajor0,
    ClVersionMajor,
    ClVersionMinor0,
    ClVersionMinor,
    ClStatus0,
    ClStatus,
    ClStatusText,
    ClStatusCr,
    // terminal
    End,
    Error,
}

/// Incremental HTTP head parser.
///
/// Feed bytes one at a time or in slices; the result is identical. In
/// server mode it parses a request line, in client mode a status line;
/// header fields (including folded continuations) are shared. After
/// [`end`](Self::end) reports true, [`fail`](Self::fail) distinguishes a
/// malformed message from a parsed one; bytes past the blank line are
/// left untouched by [`advance`](Self::advance).
pub struct HeaderParser {
    state: State,
    client: bool,
    token: String,
    value_buf: String,
    esc: u8,
    num: u32,
    input_count: usize,

    pub method: String,
    pub url: String,
    pub query_string: String,
    pub version: (u8, u8),
    pub status_code: u16,
    pub status_text: String,
    pub header: MessageHeader,
    overflow: bool,
}

impl HeaderParser {
    pub fn new_request() -> Self {
        Self::new(false)
    }

    pub fn new_response() -> Self {
        Self::new(true)
    }

    fn new(client: bool) -> Self {
        HeaderParser {
            state: if client { State::ClProtocol0 } else { State::Cmd0 },
            client,
            token: String::new(),
            value_buf: String::new(),
            esc: 0,
            num: 0,
            input_count: 0,
            method: String::new(),
            url: String::new(),
            query_string: String::new(),
            version: (0, 9),
            status_code: 0,
            status_text: String::new(),
            header: MessageHeader::new(),
            overflow: false,
        }
    }

    /// Resets for the next message on the same connection.
    pub fn reset(&mut self) {
        *self = Self::new(self.client);
    }

    /// True when the machine reached a terminal state (parsed or failed).
    pub fn end(&self) -> bool {
        self.state == State::End || self.state == State::Error
    }

    /// True when the input was malformed, as opposed to merely
    /// incomplete.
    pub fn fail(&self) -> bool {
        self.state == State::Error
    }

    /// Parses as many bytes as available; returns how many were consumed.
    /// Stops consuming right after the terminal blank line so pipelined
    /// data stays in the caller's buffer.
    pub fn advance(&mut self, input: &[u8]) -> usize {
        for (n, &b) in input.iter().enumerate() {
            if self.parse_byte(b) {
                return n + 1;
            }
        }
        input.len()
    }

    /// Parses one byte; returns true when the machine reached a terminal
    /// state.
    pub fn parse_byte(&mut self, b: u8) -> bool {
        self.input_count += 1;
        if self.input_count > MAX_INPUT {
            self.overflow = true;
            self.state = State::Error;
            return true;
        }
        self.step(b);
        self.end()
    }

    pub fn header_overflow(&self) -> bool {
        self.overflow
    }

    fn err(&mut self) {
        self.state = State::Error;
    }

    fn store_field(&mut self) {
        let key = std::mem::take(&mut self.token);
        let value = std::mem::take(&mut self.value_buf);
        if self.header.add(key, value.trim_end().to_string()).is_err() {
            self.overflow = true;
            self.state = State::Error;
        }
    }

    fn step(&mut self, b: u8) {
        let c = b as char;
        match self.state {
            // ---- request line -------------------------------------------------
            State::Cmd0 => match b {
                b'\r' | b'\n' => {} // tolerate leading empty lines
                b if b.is_ascii_uppercase() => {
                    self.token.push(c);
                    self.state = State::Cmd;
                }
                _ => self.err(),
            },
            State::Cmd => match b {
                b' ' => {
                    self.method = std::mem::take(&mut self.token);
                    self.state = State::Url0;
                }
                b if b.is_ascii_uppercase() => self.token.push(c),
                _ => self.err(),
            },
            State::Url0 => match b {
                b' ' => {}
                b'\r' | b'\n' => self.err(),
                b'%' => {
                    self.state = State::UrlEsc1;
                }
                _ => {
                    self.url.push(c);
                    self.state = State::Url;
                }
            },
            State::Url => match b {
                b' ' => self.state = State::Protocol0,
                b'?' => self.state = State::QParam,
                b'%' => self.state = State::UrlEsc1,
                b'\r' | b'\n' => self.err(),
                _ => self.url.push(c),
            },
            State::UrlEsc1 | State::UrlEsc2 => match (b as char).to_digit(16) {
                Some(d) => {
                    if self.state == State::UrlEsc1 {
                        self.esc = (d as u8) << 4;
                        self.state = State::UrlEsc2;
                    } else {
                        self.url.push((self.esc | d as u8) as char);
                        self.state = State::Url;
                    }
                }
                None => self.err(),
            },
            State::QParam => match b {
                b' ' => self.state = State::Protocol0,
                b'\r' | b'\n' => self.err(),
                _ => self.query_string.push(c),
            },
            State::Protocol0 => match b {
                b' ' => {}
                b'H' => {
                    self.token.push(c);
                    self.state = State::Protocol;
                }
                _ => self.err(),
            },
            State::Protocol => match b {
                b'/' => {
                    if self.token == "HTTP" {
                        self.token.clear();
                        self.state = State::VersionMajor0;
                    } else {
                        self.err();
                    }
                }
                b if b.is_ascii_uppercase() => self.token.push(c),
                _ => self.err(),
            },
            State::VersionMajor0 => match c.to_digit(10) {
                Some(d) => {
                    self.num = d;
                    self.state = State::VersionMajor;
                }
                None => self.err(),
            },
            State::VersionMajor => match b {
                b'.' => {
                    self.version.0 = self.num as u8;
                    self.state = State::VersionMinor0;
                }
                _ => match c.to_digit(10) {
                    Some(d) => self.num = self.num * 10 + d,
                    None => self.err(),
                },
            },
            State::VersionMinor0 => match c.to_digit(10) {
                Some(d) => {
                    self.num = d;
                    self.state = State::VersionMinor;
                }
                None => self.err(),
            },
            State::VersionMinor => match b {
                b'\r' => {
                    self.version.1 = self.num as u8;
                    self.state = State::End0;
                }
                b'\n' => {
                    self.version.1 = self.num as u8;
                    self.state = State::H0;
                }
                _ => match c.to_digit(10) {
                    Some(d) => self.num = self.num * 10 + d,
                    None => self.err(),
                },
            },
            State::End0 => match b {
                b'\n' => self.state = State::H0,
                _ => self.err(),
            },

            // ---- status line (client mode) ------------------------------------
            State::ClProtocol0 => match b {
                b'\r' | b'\n' => {}
                b'H' => {
                    self.token.push(c);
                    self.state = State::ClProtocol;
                }
                _ => self.err(),
            },
            State::ClProtocol => match b {
                b'/' => {
                    if self.token == "HTTP" {
                        self.token.clear();
                        self.state = State::ClVersionMajor0;
                    } else {
                        self.err();
                    }
                }
                b if b.is_ascii_uppercase() => self.token.push(c),
                _ => self.err(),
            },
            State::ClVersionMajor0 => match c.to_digit(10) {
                Some(d) => {
                    self.num = d;
                    self.state = State::ClVersionMajor;
                }
                None => self.err(),
            },
            State::ClVersionMajor => match b {
                b'.' => {
                    self.version.0 = self.num as u8;
                    self.state = State::ClVersionMinor0;
                }
                _ => match c.to_digit(10) {
                    Some(d) => self.num = self.num * 10 + d,
                    None => self.err(),
                },
            },
            State::ClVersionMinor0 => match c.to_digit(10) {
                Some(d) => {
                    self.num = d;
                    self.state = State::ClVersionMinor;
                }
                None => self.err(),
            },
            State::ClVersionMinor => match b {
                b' ' => {
                    self.version.1 = self.num as u8;
                    self.state = State::ClStatus0;
                }
                _ => match c.to_digit(10) {
                    Some(d) => self.num = self.num * 10 + d,
                    None => self.err(),
                },
            },
            State::ClStatus0 => match c.to_digit(10) {
                Some(d) => {
                    self.num = d;
                    self.state = State::ClStatus;
                }
                None => self.err(),
            },
            State::ClStatus => match b {
                b' ' => {
                    self.status_code = self.num as u16;
                    self.state = State::ClStatusText;
                }
                b'\r' => {
                    self.status_code = self.num as u16;
                    self.state = State::ClStatusCr;
                }
                b'\n' => {
                    self.status_code = self.num as u16;
                    self.state = State::H0;
                }
                _ => match c.to_digit(10) {
                    Some(d) => self.num = self.num * 10 + d,
                    None => self.err(),
                },
            },
            State::ClStatusText => match b {
                b'\r' => self.state = State::ClStatusCr,
                b'\n' => self.state = State::H0,
                _ => self.status_text.push(c),
            },
            State::ClStatusCr => match b {
                b'\n' => self.state = State::H0,
                _ => self.err(),
            },

            // ---- header fields ------------------------------------------------
            State::H0 => match b {
                b'\r' => self.state = State::HEndCr,
                b'\n' => self.state = State::End,
                b' ' | b'\t' => self.err(), // continuation without a field
                b':' => self.err(),
                _ => {
                    self.token.push(c);
                    self.state = State::FieldName;
                }
            },
            State::FieldName => match b {
                b':' => self.state = State::FieldBody0,
                b' ' | b'\t' => self.state = State::FieldNameSpace,
                b'\r' | b'\n' => self.err(),
                _ => self.token.push(c),
            },
            State::FieldNameSpace => match b {
                b':' => self.state = State::FieldBody0,
                b' ' | b'\t' => {}
                _ => self.err(),
            },
            State::FieldBody0 => match b {
                b' ' | b'\t' => {}
                b'\r' => self.state = State::FieldBodyCr,
                b'\n' => self.state = State::FieldBodyCrLf,
                _ => {
                    self.value_buf.push(c);
                    self.state = State::FieldBody;
                }
            },
            State::FieldBody => match b {
                b'\r' => self.state = State::FieldBodyCr,
                b'\n' => self.state = State::FieldBodyCrLf,
                _ => self.value_buf.push(c),
            },
            State::FieldBodyCr => match b {
                b'\n' => self.state = State::FieldBodyCrLf,
                _ => self.err(),
            },
            State::FieldBodyCrLf => match b {
                // folded continuation line
                b' ' | b'\t' => {
                    self.value_buf.push(' ');
                    self.state = State::FieldBody;
                }
                b'\r' => {
                    self.store_field();
                    if self.state != State::Error {
                        self.state = State::HEndCr;
                    }
                }
                b'\n' => {
                    self.store_field();
                    if self.state != State::Error {
                        self.state = State::End;
                    }
                }
                b':' => self.err(),
                _ => {
                    self.store_field();
                    if self.state != State::Error {
                        self.token.push(c);
                        self.state = State::FieldName;
                    }
                }
            },
            State::HEndCr => match b {
                b'\n' => self.state = State::End,
                _ => self.err(),
            },

            State::End | State::Error => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REQUEST: &[u8] = b"GET /path/to%20it?x=1&y=2 HTTP/1.1\r\n\
Host: example.com\r\n\
Content-Length: 5\r\n\
X-Folded: first\r\n second\r\n\
\r\nBODY!";

    fn parse_all(input: &[u8], client: bool) -> (HeaderParser, usize) {
        let mut p = if client { HeaderParser::new_response() } else { HeaderParser::new_request() };
        let n = p.advance(input);
        (p, n)
    }

    #[test]
    fn request_line_and_fields() {
        let (p, consumed) = parse_all(REQUEST, false);
        assert!(p.end());
        assert!(!p.fail());
        assert_eq!(p.method, "GET");
        assert_eq!(p.url, "/path/to it");
        assert_eq!(p.query_string, "x=1&y=2");
        assert_eq!(p.version, (1, 1));
        assert_eq!(p.header.get("host"), Some("example.com"));
        assert_eq!(p.header.content_length(), Some(5));
        assert_eq!(p.header.get("X-Folded"), Some("first second"));
        // body bytes stay unconsumed
        assert_eq!(&REQUEST[consumed..], b"BODY!");
    }

    #[test]
    fn restartable_byte_at_a_time() {
        let mut p = HeaderParser::new_request();
        let mut consumed = 0;
        for &b in REQUEST {
            consumed += 1;
            if p.parse_byte(b) {
                break;
            }
        }
        assert!(p.end() && !p.fail());
        assert_eq!(p.url, "/path/to it");
        assert_eq!(p.header.get("x-folded"), Some("first second"));
        assert_eq!(&REQUEST[consumed..], b"BODY!");
    }

    #[test]
    fn incomplete_is_not_failed() {
        let mut p = HeaderParser::new_request();
        p.advance(b"GET / HTTP/1.1\r\nHost: e");
        assert!(!p.end());
        assert!(!p.fail());
    }

    #[test]
    fn malformed_fails() {
        let (p, _) = parse_all(b"NOT A REQUEST\r\n\r\n", false);
        assert!(p.fail());

        let (p, _) = parse_all(b"GET / HTTP/x.1\r\n\r\n", false);
        assert!(p.fail());

        let (p, _) = parse_all(b"GET / HTTP/1.1\r\n: novalue\r\n\r\n", false);
        assert!(p.fail());
    }

    #[test]
    fn lf_only_line_endings() {
        let (p, _) = parse_all(b"GET / HTTP/1.1\nHost: h\n\n", false);
        assert!(p.end() && !p.fail());
        assert_eq!(p.header.get("Host"), Some("h"));
    }

    #[test]
    fn response_mode() {
        let (p, _) = parse_all(
            b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n",
            true,
        );
        assert!(p.end() && !p.fail());
        assert_eq!(p.status_code, 404);
        assert_eq!(p.status_text, "Not Found");
        assert_eq!(p.version, (1, 1));
    }

    #[test]
    fn response_without_text() {
        let (p, _) = parse_all(b"HTTP/1.0 200\r\n\r\n", true);
        assert!(p.end() && !p.fail());
        assert_eq!(p.status_code, 200);
        assert_eq!(p.version, (1, 0));
    }

    #[test]
    fn reset_reuses_the_parser() {
        let (mut p, _) = parse_all(REQUEST, false);
        assert!(p.end());
        p.reset();
        assert!(!p.end());
        p.advance(b"POST /next HTTP/1.1\r\n\r\n");
        assert!(p.end() && !p.fail());
        assert_eq!(p.method, "POST");
        assert_eq!(p.url, "/next");
    }

    #[test]
    fn oversized_header_fails() {
        let mut input = b"GET / HTTP/1.1\r\n".to_vec();
        for n in 0..400 {
            input.extend_from_slice(format!("X-F{n}: {}\r\n", "v".repeat(24)).as_bytes());
        }
        input.extend_from_slice(b"\r\n");
        let (p, _) = parse_all(&input, false);
        assert!(p.fail());
        assert!(p.header_overflow());
    }
}
