use std::io::Write;

use crate::{
    Category, Formatter, ScalarValue, SerError, SerializationInfo, formatter::SiBuilder,
};

/// Emits XML from the formatter event stream.
///
/// Two shapes are supported. In attribute mode (the default) scalar
/// members of an object become attributes of the enclosing element; in
/// element-only mode every member becomes a child element, with a `type`
/// attribute keeping the scalar type. [`parse_xml`] reconstructs the same
/// tree from either shape.
///
/// Events are collected first and written on `finish`; attribute
/// placement needs the member list before the start tag closes.
pub struct XmlFormatter<W: Write> {
    out: W,
    builder: SiBuilder,
    root_name: String,
    beautify: bool,
    use_attributes: bool,
}

impl<W: Write> XmlFormatter<W> {
    pub fn new(out: W) -> Self {
        XmlFormatter {
            out,
            builder: SiBuilder::new(),
            root_name: "root".to_string(),
            beautify: false,
            use_attributes: true,
        }
    }

    pub fn root_name(mut self, name: impl Into<String>) -> Self {
        self.root_name = name.into();
        self
    }

    pub fn beautify(mut self, on: bool) -> Self {
        self.beautify = on;
        self
    }

    pub fn use_attributes(mut self, on: bool) -> Self {
        self.use_attributes = on;
        self
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn newline(&mut self, depth: usize) -> Result<(), SerError> {
        if self.beautify {
            self.out.write_all(b"\n")?;
            for _ in 0..depth {
                self.out.write_all(b"  ")?;
            }
        }
        Ok(())
    }

    fn text_out(&mut self, s: &str) -> Result<(), SerError> {
        for ch in s.chars() {
            match ch {
                '&' => self.out.write_all(b"&amp;")?,
                '<' => self.out.write_all(b"&lt;")?,
                '>' => self.out.write_all(b"&gt;")?,
                c => write!(self.out, "{c}")?,
            }
        }
        Ok(())
    }

    fn attr_out(&mut self, s: &str) -> Result<(), SerError> {
        for ch in s.chars() {
            match ch {
                '&' => self.out.write_all(b"&amp;")?,
                '<' => self.out.write_all(b"&lt;")?,
                '"' => self.out.write_all(b"&quot;")?,
                '\n' => self.out.write_all(b"&#10;")?,
                c => write!(self.out, "{c}")?,
            }
        }
        Ok(())
    }

    fn scalar_attr_type(si: &SerializationInfo) -> bool {
        matches!(si.category(), Category::Value | Category::Void)
    }

    fn write_node(&mut self, si: &SerializationInfo, depth: usize, root: bool) -> Result<(), SerError> {
        let name = if !si.name().is_empty() {
            si.name().to_string()
        } else if root {
            self.root_name.clone()
        } else {
            "item".to_string()
        };

        if !root {
            self.newline(depth)?;
        }
        write!(self.out, "<{name}")?;

        match si.category() {
            Category::Void | Category::Value => {
                if !si.type_name().is_empty() && si.type_name() != "string" {
                    write!(self.out, " type=\"")?;
                    self.attr_out(si.type_name())?;
                    self.out.write_all(b"\"")?;
                }
                let text = si.as_str();
                if text.is_empty() {
                    self.out.write_all(b"/>")?;
                } else {
                    self.out.write_all(b">")?;
                    self.text_out(&text)?;
                    write!(self.out, "</{name}>")?;
                }
            }
            Category::Reference => {
                self.out.write_all(b" category=\"ref\">")?;
                self.text_out(&si.as_str())?;
                write!(self.out, "</{name}>")?;
            }
            Category::Object => {
                let mut children: Vec<&SerializationInfo> = Vec::new();
                if self.use_attributes {
                    for member in si.members() {
                        if Self::scalar_attr_type(member) && !member.name().is_empty() {
                            write!(self.out, " {}=\"", member.name())?;
                            self.attr_out(&member.as_str())?;
                            self.out.write_all(b"\"")?;
                        } else {
                            children.push(member);
                        }
                    }
                } else {
                    children.extend(si.members());
                }
                if children.is_empty() {
                    if si.members().is_empty() {
                        self.out.write_all(b" category=\"struct\"")?;
                    }
                    self.out.write_all(b"/>")?;
                } else {
                    self.out.write_all(b">")?;
                    for child in children {
                        self.write_node(child, depth + 1, false)?;
                    }
                    self.newline(depth)?;
                    write!(self.out, "</{name}>")?;
                }
            }
            Category::Array => {
                self.out.write_all(b" category=\"array\"")?;
                if si.members().is_empty() {
                    self.out.write_all(b"/>")?;
                } else {
                    self.out.write_all(b">")?;
                    for child in si.members() {
                        self.write_node(child, depth + 1, false)?;
                    }
                    self.newline(depth)?;
                    write!(self.out, "</{name}>")?;
                }
            }
        }
        Ok(())
    }
}

impl<W: Write> Formatter for XmlFormatter<W> {
    fn add_value(
        &mut self,
        name: &str,
        type_name: &str,
        value: &ScalarValue,
        id: &str,
    ) -> Result<(), SerError> {
        self.builder.add_value(name, type_name, value, id)
    }

    fn add_reference(&mut self, name: &str, target: &str) -> Result<(), SerError> {
        self.builder.add_reference(name, target)
    }

    fn begin_object(&mut self, name: &str, type_name: &str, id: &str) -> Result<(), SerError> {
        self.builder.begin_object(name, type_name, id)
    }

    fn begin_member(&mut self, name: &str) -> Result<(), SerError> {
        self.builder.begin_member(name)
    }

    fn finish_member(&mut self) -> Result<(), SerError> {
        self.builder.finish_member()
    }

    fn finish_object(&mut self) -> Result<(), SerError> {
        self.builder.finish_object()
    }

    fn begin_array(&mut self, name: &str, type_name: &str, id: &str) -> Result<(), SerError> {
        self.builder.begin_array(name, type_name, id)
    }

    fn finish_array(&mut self) -> Result<(), SerError> {
        self.builder.finish_array()
    }

    fn finish(&mut self) -> Result<(), SerError> {
        let si = self.builder.take()?;
        self.write_node(&si, 0, true)?;
        if self.beautify {
            self.out.write_all(b"\n")?;
        }
        self.out.flush()?;
        Ok(())
    }
}

/// Serializes `si` to an XML string.
pub fn to_xml(
    si: &SerializationInfo,
    root_name: &str,
    beautify: bool,
    use_attributes: bool,
) -> Result<String, SerError> {
    let mut fmt = XmlFormatter::new(Vec::new())
        .root_name(root_name)
        .beautify(beautify)
        .use_attributes(use_attributes);
    crate::format_si(si, &mut fmt)?;
    Ok(String::from_utf8(fmt.into_inner()).expect("formatter emits utf-8"))
}

// ---------------------------------------------------------------------------
// parsing

struct XmlParser<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> XmlParser<'a> {
    fn fail(&self, message: impl Into<String>) -> SerError {
        SerError::parse("xml", self.pos, message)
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

    fn eat(&mut self, s: &str) -> bool {
        if self.input[self.pos..].starts_with(s.as_bytes()) {
            self.pos += s.len();
            true
        } else {
            false
        }
    }

    fn skip_until(&mut self, s: &str) -> Result<(), SerError> {
        match self.input[self.pos..]
            .windows(s.len())
            .position(|w| w == s.as_bytes())
        {
            Some(i) => {
                self.pos += i + s.len();
                Ok(())
            }
            None => Err(self.fail(format!("missing \"{s}\""))),
        }
    }

    fn skip_misc(&mut self) -> Result<(), SerError> {
        loop {
            self.skip_ws();
            if self.eat("<?") {
                self.skip_until("?>")?;
            } else if self.eat("<!--") {
                self.skip_until("-->")?;
            } else if self.eat("<!") {
                self.skip_until(">")?;
            } else {
                return Ok(());
            }
        }
    }

    fn name(&mut self) -> Result<String, SerError> {
        let start = self.pos;
        while let Some(b) = self.peek() {
            if b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'.' | b':') {
                self.pos += 1;
            } else {
                break;
            }
        }
        if self.pos == start {
            return Err(self.fail("expected a name"));
        }
        Ok(String::from_utf8_lossy(&self.input[start..self.pos]).into_owned())
    }

    fn entity(&mut self) -> Result<char, SerError> {
        // positioned after '&'
        let end = self.input[self.pos..]
            .iter()
            .position(|&b| b == b';')
            .ok_or_else(|| self.fail("unterminated entity"))?;
        let ent = &self.input[self.pos..self.pos + end];
        self.pos += end + 1;
        let ent = std::str::from_utf8(ent).map_err(|_| self.fail("bad entity"))?;
        match ent {
            "amp" => Ok('&'),
            "lt" => Ok('<'),
            "gt" => Ok('>'),
            "quot" => Ok('"'),
            "apos" => Ok('\''),
            _ => {
                let cp = if let Some(hex) = ent.strip_prefix("#x") {
                    u32::from_str_radix(hex, 16).ok()
                } else if let Some(dec) = ent.strip_prefix('#') {
                    dec.parse().ok()
                } else {
                    None
                };
                cp.and_then(char::from_u32).ok_or_else(|| self.fail(format!("bad entity &{ent};")))
            }
        }
    }

    fn text_until(&mut self, stop: u8) -> Result<String, SerError> {
        let mut out = String::new();
        loop {
            match self.peek() {
                None => return Err(self.fail("unexpected end of input")),
                Some(b) if b == stop => return Ok(out),
                Some(b'&') => {
                    self.pos += 1;
                    out.push(self.entity()?);
                }
                Some(b) if b < 0x80 => {
                    out.push(b as char);
                    self.pos += 1;
                }
                Some(_) => {
                    // multi-byte utf-8 sequence
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

    fn element(&mut self, in_array: bool) -> Result<SerializationInfo, SerError> {
        if self.bump() != Some(b'<') {
            return Err(self.fail("expected an element"));
        }
        let name = self.name()?;

        let mut attrs: Vec<(String, String)> = Vec::new();
        loop {
            self.skip_ws();
            match self.peek() {
                Some(b'/') => {
                    self.pos += 1;
                    if self.bump() != Some(b'>') {
                        return Err(self.fail("malformed empty-element tag"));
                    }
                    return self.build(name, attrs, Vec::new(), String::new(), in_array);
                }
                Some(b'>') => {
                    self.pos += 1;
                    break;
                }
                Some(_) => {
                    let key = self.name()?;
                    self.skip_ws();
                    if self.bump() != Some(b'=') {
                        return Err(self.fail("expected '='"));
                    }
                    self.skip_ws();
                    let quote = self.bump().ok_or_else(|| self.fail("expected a quote"))?;
                    if quote != b'"' && quote != b'\'' {
                        return Err(self.fail("expected a quote"));
                    }
                    let value = self.text_until(quote)?;
                    self.pos += 1;
                    attrs.push((key, value));
                }
                None => return Err(self.fail("unexpected end of tag")),
            }
        }

        let child_array = attrs.iter().any(|(k, v)| k == "category" && v == "array");
        let mut children = Vec::new();
        let mut text = String::new();
        loop {
            let chunk = self.text_until(b'<')?;
            text.push_str(&chunk);
            if self.eat("</") {
                let close = self.name()?;
                self.skip_ws();
                if self.bump() != Some(b'>') {
                    return Err(self.fail("malformed end tag"));
                }
                if close != name {
                    return Err(self.fail(format!("mismatched </{close}>, expected </{name}>")));
                }
                return self.build(name, attrs, children, text, in_array);
            }
            if self.eat("<!--") {
                self.skip_until("-->")?;
                continue;
            }
            children.push(self.element(child_array)?);
        }
    }

    fn build(
        &self,
        name: String,
        attrs: Vec<(String, String)>,
        children: Vec<SerializationInfo>,
        text: String,
        in_array: bool,
    ) -> Result<SerializationInfo, SerError> {
        let mut category = None;
        let mut type_name = String::new();
        let mut members = Vec::new();
        for (key, value) in attrs {
            match key.as_str() {
                "category" => category = Some(value),
                "type" => type_name = value,
                _ => {
                    let mut m = SerializationInfo::value(value);
                    m.set_name(key);
                    members.push(m);
                }
            }
        }
        // array items written as <item> map back to unnamed members
        let name = if in_array && name == "item" { String::new() } else { name };

        let mut si = SerializationInfo::new();
        si.set_name(name);

        match category.as_deref() {
            Some("ref") => {
                si.set_category(Category::Reference).set_value(text.trim().to_string());
                return Ok(si);
            }
            Some("array") => {
                si.set_category(Category::Array);
                si.set_type_name(type_name);
                for child in children {
                    si.push_member(child);
                }
                return Ok(si);
            }
            Some("struct") => {
                si.set_category(Category::Object);
                si.set_type_name(type_name);
                for m in members.into_iter().chain(children) {
                    si.push_member(m);
                }
                return Ok(si);
            }
            _ => {}
        }

        if members.is_empty() && children.is_empty() {
            let trimmed = text.trim();
            si.set_category(Category::Value);
            si.set_value(typed_scalar(&type_name, trimmed)?);
            si.set_type_name(if type_name.is_empty() { "string".to_string() } else { type_name });
        } else {
            if !text.trim().is_empty() {
                return Err(self.fail("mixed element and text content"));
            }
            si.set_category(Category::Object);
            si.set_type_name(type_name);
            for m in members.into_iter().chain(children) {
                si.push_member(m);
            }
        }
        Ok(si)
    }
}

fn typed_scalar(type_name: &str, text: &str) -> Result<ScalarValue, SerError> {
    Ok(match type_name {
        "int" => {
            if let Ok(v) = text.parse::<i64>() {
                ScalarValue::Int(v)
            } else if let Ok(v) = text.parse::<u64>() {
                ScalarValue::UInt(v)
            } else {
                return Err(SerError::NotConvertible { value: text.to_string(), target: "int" });
            }
        }
        "double" => match text {
            "nan" => ScalarValue::Float(f64::NAN),
            "inf" => ScalarValue::Float(f64::INFINITY),
            "-inf" => ScalarValue::Float(f64::NEG_INFINITY),
            _ => ScalarValue::Float(text.parse().map_err(|_| SerError::NotConvertible {
                value: text.to_string(),
                target: "double",
            })?),
        },
        "bool" => ScalarValue::Bool(text == "true" || text == "1"),
        _ if text.is_empty() => ScalarValue::Empty,
        _ => ScalarValue::Str(text.to_string()),
    })
}

/// Parses an XML document into an SI tree. Handles both output shapes of
/// [`XmlFormatter`].
pub fn parse_xml(input: &str) -> Result<SerializationInfo, SerError> {
    let mut parser = XmlParser { input: input.as_bytes(), pos: 0 };
    parser.skip_misc()?;
    let si = parser.element(false)?;
    parser.skip_misc()?;
    Ok(si)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SerializationInfo {
        let mut si = SerializationInfo::object();
        si.set_name("root");
        si.add_member("a").set_value(1i64);
        si.add_member("b").set_value("x<y&z");
        let arr = si.add_member("list");
        arr.set_category(Category::Array);
        arr.push_member(SerializationInfo::value(10i64));
        arr.push_member(SerializationInfo::value(20i64));
        si
    }

    #[test]
    fn element_mode_roundtrip() {
        let xml = to_xml(&sample(), "root", false, false).unwrap();
        let back = parse_xml(&xml).unwrap();
        assert!(sample().structurally_eq(&back), "{xml}\n{back:?}");
    }

    #[test]
    fn attribute_mode_roundtrip() {
        let xml = to_xml(&sample(), "root", false, true).unwrap();
        assert!(xml.contains("a=\"1\""));
        let back = parse_xml(&xml).unwrap();
        assert!(sample().structurally_eq(&back), "{xml}\n{back:?}");
    }

    #[test]
    fn both_modes_parse_to_the_same_tree() {
        let a = parse_xml(&to_xml(&sample(), "root", false, true).unwrap()).unwrap();
        let b = parse_xml(&to_xml(&sample(), "root", true, false).unwrap()).unwrap();
        assert!(a.structurally_eq(&b));
    }

    #[test]
    fn escaping() {
        let mut si = SerializationInfo::object();
        si.set_name("root");
        si.add_member("t").set_value("a<b>&\"c\"");
        let xml = to_xml(&si, "root", false, false).unwrap();
        assert!(xml.contains("a&lt;b&gt;&amp;"));
        let back = parse_xml(&xml).unwrap();
        assert_eq!(back.member("t").unwrap().as_str(), "a<b>&\"c\"");
    }

    #[test]
    fn unnamed_array_items_restore_empty_names() {
        let mut si = SerializationInfo::array();
        si.set_name("root");
        si.push_member(SerializationInfo::value("x"));
        si.push_member(SerializationInfo::value("y"));
        let xml = to_xml(&si, "root", false, false).unwrap();
        assert!(xml.contains("<item>"));
        let back = parse_xml(&xml).unwrap();
        assert!(si.structurally_eq(&back));
    }

    #[test]
    fn declaration_and_comments_are_skipped() {
        let xml = "<?xml version=\"1.0\"?>\n<!-- hi -->\n<root><a type=\"int\">5</a></root>";
        let si = parse_xml(xml).unwrap();
        assert_eq!(si.member("a").unwrap().as_i64().unwrap(), 5);
    }

    #[test]
    fn mismatched_tag_is_an_error() {
        assert!(parse_xml("<a><b>1</c></a>").is_err());
    }

    #[test]
    fn beautify_emits_indentation() {
        let xml = to_xml(&sample(), "root", true, false).unwrap();
        assert!(xml.contains("\n  <"));
        let back = parse_xml(&xml).unwrap();
        assert!(sample().structurally_eq(&back));
    }
}
