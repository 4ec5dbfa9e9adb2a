use crate::{Category, SerError, SerializationInfo};

fn hex_val(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// Percent-decodes one query-string token; `+` decodes to a space.
fn decode(input: &str, base: usize) -> Result<String, SerError> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' => {
                let (hi, lo) = match (bytes.get(i + 1), bytes.get(i + 2)) {
                    (Some(&h), Some(&l)) => (hex_val(h), hex_val(l)),
                    _ => (None, None),
                };
                match (hi, lo) {
                    (Some(h), Some(l)) => {
                        out.push(h << 4 | l);
                        i += 3;
                    }
                    _ => {
                        return Err(SerError::parse(
                            "query-string",
                            base + i,
                            "malformed percent escape",
                        ));
                    }
                }
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8(out)
        .map_err(|_| SerError::parse("query-string", base, "escape decodes to invalid utf-8"))
}

/// Parses an HTTP query string (`a=1&b=x%20y`) into an object tree.
///
/// A key that repeats becomes an array of its values. Keys without `=`
/// become members with an empty value.
pub fn parse_query_string(input: &str) -> Result<SerializationInfo, SerError> {
    let mut si = SerializationInfo::object();
    let input = input.trim().trim_start_matches('?');
    let mut offset = 0usize;
    for part in input.split('&') {
        if part.is_empty() {
            offset += 1;
            continue;
        }
        let (raw_key, raw_value) = match part.split_once('=') {
            Some((k, v)) => (k, v),
            None => (part, ""),
        };
        let key = decode(raw_key, offset)?;
        let value = decode(raw_value, offset + raw_key.len() + 1)?;
        offset += part.len() + 1;

        match si.member_mut(&key) {
            None => {
                si.add_member(key).set_value(value).set_type_name("string");
            }
            Some(existing) => {
                if existing.category() != Category::Array {
                    let prior = existing.as_str();
                    existing.clear();
                    existing.set_category(Category::Array);
                    existing.push_member(SerializationInfo::value(prior));
                }
                existing.push_member(SerializationInfo::value(value));
                let name = key;
                existing.set_name(name);
            }
        }
    }
    Ok(si)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_pairs() {
        let si = parse_query_string("a=1&b=two").unwrap();
        assert_eq!(si.member("a").unwrap().as_str(), "1");
        assert_eq!(si.member("b").unwrap().as_str(), "two");
    }

    #[test]
    fn percent_and_plus_decoding() {
        let si = parse_query_string("msg=hello%20world&sp=a+b&eur=%E2%82%AC").unwrap();
        assert_eq!(si.member("msg").unwrap().as_str(), "hello world");
        assert_eq!(si.member("sp").unwrap().as_str(), "a b");
        assert_eq!(si.member("eur").unwrap().as_str(), "€");
    }

    #[test]
    fn repeated_key_becomes_array() {
        let si = parse_query_string("v=1&v=2&v=3").unwrap();
        let v = si.member("v").unwrap();
        assert_eq!(v.category(), Category::Array);
        let values: Vec<String> = v.members().iter().map(|m| m.as_str()).collect();
        assert_eq!(values, ["1", "2", "3"]);
    }

    #[test]
    fn flag_without_value() {
        let si = parse_query_string("debug&x=1").unwrap();
        assert_eq!(si.member("debug").unwrap().as_str(), "");
    }

    #[test]
    fn leading_question_mark_is_tolerated() {
        let si = parse_query_string("?a=1").unwrap();
        assert_eq!(si.member("a").unwrap().as_str(), "1");
    }

    #[test]
    fn bad_escape_is_an_error() {
        assert!(parse_query_string("a=%zz").is_err());
        assert!(parse_query_string("a=%2").is_err());
    }
}
