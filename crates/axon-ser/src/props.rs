use std::io::Write;

use crate::{Category, Formatter, ScalarValue, SerError, SerializationInfo, formatter::SiBuilder};

/// Emits the flattened `key = value` properties format.
///
/// Member paths join with dots, array elements use their index as the path
/// segment. Values are backslash-escaped, non-ASCII and control characters
/// as `\uXXXX`.
pub struct PropertiesFormatter<W: Write> {
    out: W,
    builder: SiBuilder,
}

impl<W: Write> PropertiesFormatter<W> {
    pub fn new(out: W) -> Self {
        PropertiesFormatter { out, builder: SiBuilder::new() }
    }

    pub fn into_inner(self) -> W {
        self.out
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
                c if (c as u32) >= 0x80 || (c as u32) < 0x20 => {
                    write!(self.out, "\\u{:04x}", c as u32)?
                }
                c => write!(self.out, "{c}")?,
            }
        }
        Ok(())
    }

    fn join(prefix: &str, segment: &str) -> String {
        if prefix.is_empty() {
            segment.to_string()
        } else if segment.is_empty() {
            prefix.to_string()
        } else {
            format!("{prefix}.{segment}")
        }
    }

    fn write_node(&mut self, si: &SerializationInfo, key: &str) -> Result<(), SerError> {
        match si.category() {
            Category::Void => {
                if !key.is_empty() {
                    writeln!(self.out, "{key} =")?;
                }
            }
            Category::Value | Category::Reference => {
                if key.is_empty() {
                    // a bare top-level scalar has no key to flatten under
                    self.string_out(&si.as_str())?;
                    self.out.write_all(b"\n")?;
                } else {
                    write!(self.out, "{key} = ")?;
                    self.string_out(&si.as_str())?;
                    self.out.write_all(b"\n")?;
                }
            }
            Category::Object => {
                for member in si.members() {
                    let child = Self::join(key, member.name());
                    self.write_node(member, &child)?;
                }
            }
            Category::Array => {
                for (n, member) in si.members().iter().enumerate() {
                    let child = Self::join(key, &n.to_string());
                    self.write_node(member, &child)?;
                }
            }
        }
        Ok(())
    }
}

impl<W: Write> Formatter for PropertiesFormatter<W> {
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
        let root = si.name().to_string();
        self.write_node(&si, &root)?;
        self.out.flush()?;
        Ok(())
    }
}

/// Serializes `si` to the properties format.
pub fn to_properties(si: &SerializationInfo) -> Result<String, SerError> {
    let mut fmt = PropertiesFormatter::new(Vec::new());
    crate::format_si(si, &mut fmt)?;
    Ok(String::from_utf8(fmt.into_inner()).expect("formatter emits utf-8"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flattens_nested_structure() {
        let mut si = SerializationInfo::object();
        si.add_member("a").set_value(1i64);
        let inner = si.add_member("obj");
        inner.set_category(Category::Object);
        inner.add_member("x").set_value("v");
        let arr = si.add_member("list");
        arr.set_category(Category::Array);
        arr.push_member(SerializationInfo::value("p"));
        arr.push_member(SerializationInfo::value("q"));

        let out = to_properties(&si).unwrap();
        assert_eq!(out, "a = 1\nobj.x = v\nlist.0 = p\nlist.1 = q\n");
    }

    #[test]
    fn named_root_prefixes_keys() {
        let mut si = SerializationInfo::object();
        si.set_name("cfg");
        si.add_member("port").set_value(8080i64);
        assert_eq!(to_properties(&si).unwrap(), "cfg.port = 8080\n");
    }

    #[test]
    fn escapes_values() {
        let mut si = SerializationInfo::object();
        si.add_member("s").set_value("a\nb\tc\\d\u{e9}");
        assert_eq!(to_properties(&si).unwrap(), "s = a\\nb\\tc\\\\d\\u00e9\n");
    }

    #[test]
    fn void_member_emits_empty_value() {
        let mut si = SerializationInfo::object();
        si.add_member("unset");
        assert_eq!(to_properties(&si).unwrap(), "unset =\n");
    }

    #[test]
    fn key_paths_split_and_rejoin() {
        // key paths are dot-joined segments; splitting a flattened key
        // and rejoining it must give back the original key
        let mut si = SerializationInfo::object();
        let deep = si.add_member("a");
        deep.set_category(Category::Object);
        let deeper = deep.add_member("b");
        deeper.set_category(Category::Object);
        deeper.add_member("c").set_value(1i64);

        let out = to_properties(&si).unwrap();
        let key = out.split(" = ").next().unwrap();
        assert_eq!(key, "a.b.c");
        let segments: Vec<&str> = key.split('.').collect();
        assert_eq!(segments.join("."), key);
    }
}
