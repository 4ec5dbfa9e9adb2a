use std::io::Write;

use crate::{Formatter, ScalarValue, SerError, SerializationInfo, formatter::SiBuilder};

/// Emits canonical JSON from the formatter event stream.
///
/// Non-finite numbers serialize as `null`. Keys are always quoted unless
/// `plain_keys` is enabled and the key is a plain identifier. With
/// `beautify`, objects break across lines with tab indentation while array
/// scalars stay on one line.
pub struct JsonFormatter<W: Write> {
    out: W,
    beautify: bool,
    plain_keys: bool,
    level: usize,
    last_level: usize,
}

impl<W: Write> JsonFormatter<W> {
    pub fn new(out: W) -> Self {
        JsonFormatter { out, beautify: false, plain_keys: false, level: 1, last_level: 0 }
    }

    pub fn beautify(mut self, on: bool) -> Self {
        self.beautify = on;
        self
    }

    pub fn plain_keys(mut self, on: bool) -> Self {
        self.plain_keys = on;
        self
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn indent(&mut self) -> Result<(), SerError> {
        for _ in 1..self.level {
            self.out.write_all(b"\t")?;
        }
        Ok(())
    }

    /// Comma/newline bookkeeping shared by every node start.
    fn separate(&mut self, inline: bool) -> Result<(), SerError> {
        if self.level == self.last_level {
            self.out.write_all(b",")?;
            if self.beautify {
                if inline {
                    self.out.write_all(b" ")?;
                } else {
                    self.out.write_all(b"\n")?;
                    self.indent()?;
                }
            }
        } else {
            self.last_level = self.level;
            if self.beautify && !inline {
                self.indent()?;
            }
        }
        Ok(())
    }

    fn string_out(&mut self, s: &str) -> Result<(), SerError> {
        for ch in s.chars() {
            match ch {
                '"' => self.out.write_all(b"\\\"")?,
                '\\' => self.out.write_all(b"\\\\")?,
                '\u{8}' => self.out.write_all(b"\\b")?,
                '\u{c}' => self.out.write_all(b"\\f")?,
                '\n' => self.out.write_all(b"\\n")?,
                '\r' => self.out.write_all(b"\\r")?,
                '\t' => self.out.write_all(b"\\t")?,
                c if (c as u32) < 0x20 || (c as u32) > 0x7f => {
                    let cp = c as u32;
                    if cp > 0xffff {
                        // surrogate pair
                        let v = cp - 0x10000;
                        write!(self.out, "\\u{:04x}\\u{:04x}", 0xd800 + (v >> 10), 0xdc00 + (v & 0x3ff))?;
                    } else {
                        write!(self.out, "\\u{cp:04x}")?;
                    }
                }
                c => write!(self.out, "{c}")?,
            }
        }
        Ok(())
    }

    fn key_out(&mut self, name: &str) -> Result<(), SerError> {
        let plain = self.plain_keys
            && !name.is_empty()
            && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
        if plain {
            write!(self.out, "{name}:")?;
        } else {
            self.out.write_all(b"\"")?;
            self.string_out(name)?;
            self.out.write_all(b"\":")?;
        }
        if self.beautify {
            self.out.write_all(b" ")?;
        }
        Ok(())
    }

    fn raw_number(&mut self, value: &ScalarValue) -> Result<(), SerError> {
        match value {
            ScalarValue::Float(f) if !f.is_finite() => self.out.write_all(b"null")?,
            other => write!(self.out, "{}", other.to_canonical())?,
        }
        Ok(())
    }
}

fn numeric_string(type_name: &str, s: &str) -> bool {
    match type_name {
        "bool" => s == "true" || s == "false",
        "int" => !s.is_empty() && s.parse::<i64>().is_ok() || s.parse::<u64>().is_ok(),
        "double" => matches!(s, "nan" | "inf" | "-inf") || s.parse::<f64>().is_ok() && !s.is_empty(),
        _ => false,
    }
}

impl<W: Write> Formatter for JsonFormatter<W> {
    fn add_value(
        &mut self,
        name: &str,
        type_name: &str,
        value: &ScalarValue,
        _id: &str,
    ) -> Result<(), SerError> {
        self.separate(name.is_empty())?;
        if !name.is_empty() {
            self.key_out(name)?;
        }
        match value {
            ScalarValue::Empty => self.out.write_all(b"null")?,
            ScalarValue::Int(_) | ScalarValue::UInt(_) | ScalarValue::Bool(_) => {
                self.raw_number(value)?;
            }
            ScalarValue::Float(f) => {
                if f.is_finite() {
                    write!(self.out, "{}", value.to_canonical())?;
                } else {
                    self.out.write_all(b"null")?;
                }
            }
            ScalarValue::Str(s) => {
                if numeric_string(type_name, s) {
                    if matches!(s.as_str(), "nan" | "inf" | "-inf") {
                        self.out.write_all(b"null")?;
                    } else {
                        write!(self.out, "{s}")?;
                    }
                } else {
                    self.out.write_all(b"\"")?;
                    self.string_out(s)?;
                    self.out.write_all(b"\"")?;
                }
            }
        }
        Ok(())
    }

    fn add_reference(&mut self, name: &str, target: &str) -> Result<(), SerError> {
        self.add_value(name, "string", &ScalarValue::Str(target.to_string()), "")
    }

    fn begin_object(&mut self, name: &str, _type_name: &str, _id: &str) -> Result<(), SerError> {
        self.separate(false)?;
        if !name.is_empty() {
            self.key_out(name)?;
        }
        self.level += 1;
        self.out.write_all(b"{")?;
        if self.beautify {
            self.out.write_all(b"\n")?;
        }
        Ok(())
    }

    fn begin_member(&mut self, _name: &str) -> Result<(), SerError> {
        Ok(())
    }

    fn finish_member(&mut self) -> Result<(), SerError> {
        Ok(())
    }

    fn finish_object(&mut self) -> Result<(), SerError> {
        self.level -= 1;
        self.last_level = self.level;
        if self.beautify {
            self.out.write_all(b"\n")?;
            self.indent()?;
        }
        self.out.write_all(b"}")?;
        Ok(())
    }

    fn begin_array(&mut self, name: &str, _type_name: &str, _id: &str) -> Result<(), SerError> {
        self.separate(false)?;
        if !name.is_empty() {
            self.key_out(name)?;
        }
        self.level += 1;
        self.out.write_all(b"[")?;
        if self.beautify {
            self.out.write_all(b"\n")?;
            self.indent()?;
        }
        Ok(())
    }

    fn finish_array(&mut self) -> Result<(), SerError> {
        self.level -= 1;
        self.last_level = self.level;
        if self.beautify {
            self.out.write_all(b"\n")?;
            self.indent()?;
        }
        self.out.write_all(b"]")?;
        Ok(())
    }

    fn finish(&mut self) -> Result<(), SerError> {
        self.out.flush()?;
        Ok(())
    }
}

/// Serializes `si` to a canonical JSON string.
pub fn to_json(si: &SerializationInfo, beautify: bool) -> Result<String, SerError> {
    let mut fmt = JsonFormatter::new(Vec::new()).beautify(beautify);
    crate::format_si(si, &mut fmt)?;
    Ok(String::from_utf8(fmt.into_inner()).expect("formatter emits utf-8"))
}

/// Hand-rolled JSON parser.
///
/// Walks the text token by token and pushes formatter events into the
/// builder that reconstructs the tree, like every other codec in this
/// crate. Strings decode the full escape set including surrogate pairs;
/// numbers keep the narrowest representation (signed, unsigned, then
/// float). Nesting is bounded so hostile input cannot exhaust the stack.
struct JsonParser<'a> {
    input: &'a [u8],
    pos: usize,
    depth: usize,
}

const MAX_DEPTH: usize = 128;

impl<'a> JsonParser<'a> {
    fn new(input: &'a str) -> Self {
        JsonParser { input: input.as_bytes(), pos: 0, depth: 0 }
    }

    fn fail(&self, message: impl Into<String>) -> SerError {
        SerError::parse("json", self.pos, message)
    }

    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let b = self.peek()?;
        self.pos += 1;
        Some(b)
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(b' ' | b'\t' | b'\r' | b'\n')) {
            self.pos += 1;
        }
    }

    fn at_end(&mut self) -> bool {
        self.skip_ws();
        self.pos >= self.input.len()
    }

    fn expect(&mut self, b: u8) -> Result<(), SerError> {
        if self.bump() == Some(b) {
            Ok(())
        } else {
            Err(self.fail(format!("expected '{}'", b as char)))
        }
    }

    fn keyword(&mut self, kw: &str) -> Result<(), SerError> {
        if self.input[self.pos..].starts_with(kw.as_bytes()) {
            self.pos += kw.len();
            Ok(())
        } else {
            Err(self.fail(format!("expected \"{kw}\"")))
        }
    }

    /// One value, emitted into `builder` under `name`.
    fn value(&mut self, name: &str, builder: &mut SiBuilder) -> Result<(), SerError> {
        self.skip_ws();
        match self.peek() {
            None => Err(SerError::UnexpectedEnd("json")),
            Some(b'{') => self.object(name, builder),
            Some(b'[') => self.array(name, builder),
            Some(b'"') => {
                let s = self.string()?;
                builder.add_value(name, "string", &ScalarValue::Str(s), "")
            }
            Some(b't') => {
                self.keyword("true")?;
                builder.add_value(name, "bool", &ScalarValue::Bool(true), "")
            }
            Some(b'f') => {
                self.keyword("false")?;
                builder.add_value(name, "bool", &ScalarValue::Bool(false), "")
            }
            Some(b'n') => {
                self.keyword("null")?;
                builder.add_value(name, "", &ScalarValue::Empty, "")
            }
            Some(b) if b == b'-' || b.is_ascii_digit() => {
                let (value, type_name) = self.number()?;
                builder.add_value(name, type_name, &value, "")
            }
            Some(b) => Err(self.fail(format!("unexpected character '{}'", b as char))),
        }
    }

    fn enter(&mut self) -> Result<(), SerError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(self.fail("nesting too deep"));
        }
        Ok(())
    }

    fn object(&mut self, name: &str, builder: &mut SiBuilder) -> Result<(), SerError> {
        self.expect(b'{')?;
        self.enter()?;
        builder.begin_object(name, "", "")?;
        self.skip_ws();
        if self.peek() == Some(b'}') {
            self.pos += 1;
            self.depth -= 1;
            return builder.finish_object();
        }
        loop {
            self.skip_ws();
            if self.peek() != Some(b'"') {
                return Err(self.fail("expected a member name"));
            }
            let key = self.string()?;
            self.skip_ws();
            self.expect(b':')?;
            builder.begin_member(&key)?;
            self.value(&key, builder)?;
            builder.finish_member()?;
            self.skip_ws();
            match self.bump() {
                Some(b',') => {}
                Some(b'}') => break,
                Some(b) => return Err(self.fail(format!("expected ',' or '}}', got '{}'", b as char))),
                None => return Err(SerError::UnexpectedEnd("json")),
            }
        }
        self.depth -= 1;
        builder.finish_object()
    }

    fn array(&mut self, name: &str, builder: &mut SiBuilder) -> Result<(), SerError> {
        self.expect(b'[')?;
        self.enter()?;
        builder.begin_array(name, "", "")?;
        self.skip_ws();
        if self.peek() == Some(b']') {
            self.pos += 1;
            self.depth -= 1;
            return builder.finish_array();
        }
        loop {
            self.value("", builder)?;
            self.skip_ws();
            match self.bump() {
                Some(b',') => {}
                Some(b']') => break,
                Some(b) => return Err(self.fail(format!("expected ',' or ']', got '{}'", b as char))),
                None => return Err(SerError::UnexpectedEnd("json")),
            }
        }
        self.depth -= 1;
        builder.finish_array()
    }

    fn hex4(&mut self) -> Result<u32, SerError> {
        let mut cp = 0u32;
        for _ in 0..4 {
            let d = self
                .bump()
                .and_then(|b| (b as char).to_digit(16))
                .ok_or_else(|| self.fail("bad \\u escape"))?;
            cp = cp << 4 | d;
        }
        Ok(cp)
    }

    fn string(&mut self) -> Result<String, SerError> {
        self.expect(b'"')?;
        let mut out = String::new();
        loop {
            match self.bump() {
                None => return Err(SerError::UnexpectedEnd("json")),
                Some(b'"') => return Ok(out),
                Some(b'\\') => match self.bump() {
                    Some(b'"') => out.push('"'),
                    Some(b'\\') => out.push('\\'),
                    Some(b'/') => out.push('/'),
                    Some(b'b') => out.push('\u{8}'),
                    Some(b'f') => out.push('\u{c}'),
                    Some(b'n') => out.push('\n'),
                    Some(b'r') => out.push('\r'),
                    Some(b't') => out.push('\t'),
                    Some(b'u') => {
                        let hi = self.hex4()?;
                        let cp = if (0xd800..0xdc00).contains(&hi) {
                            // surrogate pair
                            if self.bump() != Some(b'\\') || self.bump() != Some(b'u') {
                                return Err(self.fail("unpaired surrogate"));
                            }
                            let lo = self.hex4()?;
                            if !(0xdc00..0xe000).contains(&lo) {
                                return Err(self.fail("unpaired surrogate"));
                            }
                            0x10000 + ((hi - 0xd800) << 10) + (lo - 0xdc00)
                        } else if (0xdc00..0xe000).contains(&hi) {
                            return Err(self.fail("unpaired surrogate"));
                        } else {
                            hi
                        };
                        out.push(
                            char::from_u32(cp).ok_or_else(|| self.fail("bad \\u escape"))?,
                        );
                    }
                    Some(b) => {
                        return Err(self.fail(format!("bad escape '\\{}'", b as char)));
                    }
                    None => return Err(SerError::UnexpectedEnd("json")),
                },
                Some(b) if b < 0x20 => {
                    return Err(self.fail("raw control character in string"));
                }
                Some(b) if b < 0x80 => out.push(b as char),
                Some(_) => {
                    // multi-byte utf-8 sequence
                    self.pos -= 1;
                    let rest = &self.input[self.pos..];
                    let mut decoded = None;
                    for len in 2..=rest.len().min(4) {
                        if let Ok(s) = std::str::from_utf8(&rest[..len]) {
                            decoded = s.chars().next();
                            break;
                        }
                    }
                    let ch = decoded.ok_or_else(|| self.fail("invalid utf-8"))?;
                    out.push(ch);
                    self.pos += ch.len_utf8();
                }
            }
        }
    }

    fn number(&mut self) -> Result<(ScalarValue, &'static str), SerError> {
        let start = self.pos;
        let mut float = false;
        if self.peek() == Some(b'-') {
            self.pos += 1;
        }
        let digits = self.pos;
        while self.peek().is_some_and(|b| b.is_ascii_digit()) {
            self.pos += 1;
        }
        if self.pos == digits {
            return Err(self.fail("expected a digit"));
        }
        if self.peek() == Some(b'.') {
            float = true;
            self.pos += 1;
            let frac = self.pos;
            while self.peek().is_some_and(|b| b.is_ascii_digit()) {
                self.pos += 1;
            }
            if self.pos == frac {
                return Err(self.fail("expected a fraction digit"));
            }
        }
        if matches!(self.peek(), Some(b'e' | b'E')) {
            float = true;
            self.pos += 1;
            if matches!(self.peek(), Some(b'+' | b'-')) {
                self.pos += 1;
            }
            let exp = self.pos;
            while self.peek().is_some_and(|b| b.is_ascii_digit()) {
                self.pos += 1;
            }
            if self.pos == exp {
                return Err(self.fail("expected an exponent digit"));
            }
        }
        let text = std::str::from_utf8(&self.input[start..self.pos]).expect("ascii number");
        if !float {
            if let Ok(v) = text.parse::<i64>() {
                return Ok((ScalarValue::Int(v), "int"));
            }
            if let Ok(v) = text.parse::<u64>() {
                return Ok((ScalarValue::UInt(v), "int"));
            }
        }
        let v: f64 =
            text.parse().map_err(|_| self.fail(format!("bad number \"{text}\"")))?;
        Ok((ScalarValue::Float(v), "double"))
    }

    /// Parses one document into a fresh builder.
    fn document(&mut self) -> Result<SerializationInfo, SerError> {
        let mut builder = SiBuilder::new();
        self.value("", &mut builder)?;
        builder.finish()?;
        builder.take()
    }
}

/// Parses one JSON document into an SI tree.
pub fn parse_json(input: &str) -> Result<SerializationInfo, SerError> {
    let mut parser = JsonParser::new(input);
    let si = parser.document()?;
    if !parser.at_end() {
        return Err(parser.fail("trailing characters after the document"));
    }
    Ok(si)
}

/// Parses a stream of whitespace-separated JSON documents.
pub fn parse_json_stream(input: &str) -> Result<Vec<SerializationInfo>, SerError> {
    let mut parser = JsonParser::new(input);
    let mut out = Vec::new();
    while !parser.at_end() {
        out.push(parser.document()?);
    }
    Ok(out)
}
