use std::{collections::HashMap, io::Write};

use crate::{Category, Formatter, ScalarValue, SerError, SerializationInfo};

/// Wire tags of the binary format.
///
/// Tags below 0x40 start a named record; the 0x40..0x7f range mirrors them
/// for anonymous values. Containers are bracketed by a category tag and
/// [`Tag::Eod`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Tag {
    Empty = 0x00,
    Bool = 0x01,
    Char = 0x02,
    String = 0x03,
    Int = 0x04,
    Binary2 = 0x06,
    Binary4 = 0x07,
    Int8 = 0x10,
    Int16 = 0x11,
    Int32 = 0x12,
    Int64 = 0x13,
    UInt8 = 0x18,
    UInt16 = 0x19,
    UInt32 = 0x1a,
    UInt64 = 0x1b,
    BcdFloat = 0x20,
    /// 1 bit sign, 7 bit exponent, 16 bit mantissa (3 bytes).
    ShortFloat = 0x21,
    /// 1 bit sign, 7 bit exponent, 32 bit mantissa (5 bytes).
    MediumFloat = 0x22,
    /// 1 bit sign, 15 bit exponent, 64 bit mantissa (10 bytes).
    LongFloat = 0x23,
    Pair = 0x30,
    Array = 0x31,
    Vector = 0x32,
    List = 0x33,
    Deque = 0x34,
    Set = 0x35,
    Multiset = 0x36,
    Map = 0x37,
    Multimap = 0x38,
    Bcd = 0x3e,
    /// Free-form type name, zero-terminated, follows the tag.
    Other = 0x3f,
    CategoryObject = 0xa0,
    CategoryArray = 0xa1,
    CategoryReference = 0xa2,
    RpcRequest = 0xc0,
    RpcResponse = 0xc1,
    RpcException = 0xc2,
    Eod = 0xff,
}

const PLAIN: u8 = 0x40;
/// Dictionary back-reference marker inside a name position.
const DICT_MARKER: u8 = 0x01;

fn container_type_code(type_name: &str) -> Option<u8> {
    Some(match type_name {
        "" => Tag::Empty as u8,
        "bool" => Tag::Bool as u8,
        "char" => Tag::Char as u8,
        "string" => Tag::String as u8,
        "int" => Tag::Int as u8,
        "pair" => Tag::Pair as u8,
        "array" => Tag::Array as u8,
        "vector" => Tag::Vector as u8,
        "list" => Tag::List as u8,
        "deque" => Tag::Deque as u8,
        "set" => Tag::Set as u8,
        "multiset" => Tag::Multiset as u8,
        "map" => Tag::Map as u8,
        "multimap" => Tag::Multimap as u8,
        _ => return None,
    })
}

fn type_code_name(code: u8) -> Option<&'static str> {
    Some(match code {
        0x00 => "",
        0x01 => "bool",
        0x02 => "char",
        0x03 => "string",
        0x04 => "int",
        0x30 => "pair",
        0x31 => "array",
        0x32 => "vector",
        0x33 => "list",
        0x34 => "deque",
        0x35 => "set",
        0x36 => "multiset",
        0x37 => "map",
        0x38 => "multimap",
        _ => return None,
    })
}

// Float packing. A f64 is sign(1) / biased exponent e(11) / fraction f(52).
// ShortFloat keeps the top 16 fraction bits, MediumFloat the top 32, both
// with the exponent re-biased into 7 bits; LongFloat stores e and f
// verbatim in 15+64 bits and is always lossless.

fn short_float_fits(bits: u64) -> bool {
    let e = (bits >> 52) & 0x7ff;
    let f = bits & 0xf_ffff_ffff_ffff;
    if e == 0 {
        return f == 0; // ±0 only
    }
    if e == 0x7ff {
        return false; // nan/inf go long
    }
    let exp = e as i64 - 1023;
    (-62..=63).contains(&exp) && f & 0xf_ffff_ffff == 0
}

fn medium_float_fits(bits: u64) -> bool {
    let e = (bits >> 52) & 0x7ff;
    let f = bits & 0xf_ffff_ffff_ffff;
    if e == 0 {
        return f == 0;
    }
    if e == 0x7ff {
        return false;
    }
    let exp = e as i64 - 1023;
    (-62..=63).contains(&exp) && f & 0xf_ffff == 0
}

fn pack_short(bits: u64) -> [u8; 3] {
    let sign = ((bits >> 63) as u8) << 7;
    let e = (bits >> 52) & 0x7ff;
    let f = bits & 0xf_ffff_ffff_ffff;
    if e == 0 {
        return [sign, 0, 0];
    }
    let e7 = (e as i64 - 1023 + 63) as u8;
    let mant = (f >> 36) as u16;
    [sign | e7, mant as u8, (mant >> 8) as u8]
}

fn unpack_short(b: &[u8]) -> f64 {
    let sign = u64::from(b[0] >> 7) << 63;
    let e7 = b[0] & 0x7f;
    let mant = u64::from(b[1]) | u64::from(b[2]) << 8;
    if e7 == 0 && mant == 0 {
        return f64::from_bits(sign);
    }
    let e = (i64::from(e7) - 63 + 1023) as u64;
    f64::from_bits(sign | e << 52 | mant << 36)
}

fn pack_medium(bits: u64) -> [u8; 5] {
    let sign = ((bits >> 63) as u8) << 7;
    let e = (bits >> 52) & 0x7ff;
    let f = bits & 0xf_ffff_ffff_ffff;
    if e == 0 {
        return [sign, 0, 0, 0, 0];
    }
    let e7 = (e as i64 - 1023 + 63) as u8;
    let mant = (f >> 20) as u32;
    let m = mant.to_le_bytes();
    [sign | e7, m[0], m[1], m[2], m[3]]
}

fn unpack_medium(b: &[u8]) -> f64 {
    let sign = u64::from(b[0] >> 7) << 63;
    let e7 = b[0] & 0x7f;
    let mant = u64::from(u32::from_le_bytes([b[1], b[2], b[3], b[4]]));
    if e7 == 0 && mant == 0 {
        return f64::from_bits(sign);
    }
    let e = (i64::from(e7) - 63 + 1023) as u64;
    f64::from_bits(sign | e << 52 | mant << 20)
}

fn pack_long(bits: u64) -> [u8; 10] {
    let sign = ((bits >> 63) as u8) << 7;
    let e = ((bits >> 52) & 0x7ff) as u16;
    let f = bits & 0xf_ffff_ffff_ffff;
    let mut out = [0u8; 10];
    out[0] = sign | (e >> 8) as u8;
    out[1] = (e & 0xff) as u8;
    out[2..10].copy_from_slice(&f.to_le_bytes());
    out
}

fn unpack_long(b: &[u8]) -> f64 {
    let sign = u64::from(b[0] >> 7) << 63;
    let e = (u64::from(b[0] & 0x7f) << 8 | u64::from(b[1])) & 0x7ff;
    let f = u64::from_le_bytes(b[2..10].try_into().unwrap()) & 0xf_ffff_ffff_ffff;
    f64::from_bits(sign | e << 52 | f)
}

/// Emits the binary format from the formatter event stream.
///
/// The member-name dictionary persists for the life of the formatter, so
/// one formatter instance per message keeps repeated names at two bytes.
pub struct BinFormatter<W: Write> {
    out: W,
    dict: HashMap<String, u16>,
}

impl<W: Write> BinFormatter<W> {
    pub fn new(out: W) -> Self {
        BinFormatter { out, dict: HashMap::new() }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.out
    }

    fn put_name(&mut self, name: &str) -> Result<(), SerError> {
        if name.is_empty() {
            self.out.write_all(&[0])?;
            return Ok(());
        }
        if let Some(&idx) = self.dict.get(name) {
            self.out.write_all(&[DICT_MARKER, (idx >> 8) as u8, idx as u8])?;
            return Ok(());
        }
        if self.dict.len() < u16::MAX as usize {
            self.dict.insert(name.to_string(), self.dict.len() as u16);
        }
        self.out.write_all(name.as_bytes())?;
        self.out.write_all(&[0])?;
        Ok(())
    }

    fn put_cstr(&mut self, s: &str) -> Result<(), SerError> {
        self.out.write_all(s.as_bytes())?;
        self.out.write_all(&[0])?;
        Ok(())
    }

    fn put_type_code(&mut self, type_name: &str) -> Result<(), SerError> {
        match container_type_code(type_name) {
            Some(code) => self.out.write_all(&[code])?,
            None => {
                self.out.write_all(&[Tag::Other as u8])?;
                self.put_cstr(type_name)?;
            }
        }
        Ok(())
    }

    fn put_tag(&mut self, tag: u8, name: &str) -> Result<(), SerError> {
        if name.is_empty() {
            self.out.write_all(&[tag | PLAIN])?;
        } else {
            self.out.write_all(&[tag])?;
            self.put_name(name)?;
        }
        Ok(())
    }

    fn put_int(&mut self, name: &str, v: i64) -> Result<(), SerError> {
        if v >= 0 {
            return self.put_uint(name, v as u64);
        }
        if v >= i64::from(i8::MIN) {
            self.put_tag(Tag::Int8 as u8, name)?;
            self.out.write_all(&(v as i8).to_le_bytes())?;
        } else if v >= i64::from(i16::MIN) {
            self.put_tag(Tag::Int16 as u8, name)?;
            self.out.write_all(&(v as i16).to_le_bytes())?;
        } else if v >= i64::from(i32::MIN) {
            self.put_tag(Tag::Int32 as u8, name)?;
            self.out.write_all(&(v as i32).to_le_bytes())?;
        } else {
            self.put_tag(Tag::Int64 as u8, name)?;
            self.out.write_all(&v.to_le_bytes())?;
        }
        Ok(())
    }

    fn put_uint(&mut self, name: &str, v: u64) -> Result<(), SerError> {
        if v <= u64::from(u8::MAX) {
            self.put_tag(Tag::UInt8 as u8, name)?;
            self.out.write_all(&(v as u8).to_le_bytes())?;
        } else if v <= u64::from(u16::MAX) {
            self.put_tag(Tag::UInt16 as u8, name)?;
            self.out.write_all(&(v as u16).to_le_bytes())?;
        } else if v <= u64::from(u32::MAX) {
            self.put_tag(Tag::UInt32 as u8, name)?;
            self.out.write_all(&(v as u32).to_le_bytes())?;
        } else {
            self.put_tag(Tag::UInt64 as u8, name)?;
            self.out.write_all(&v.to_le_bytes())?;
        }
        Ok(())
    }

    fn put_float(&mut self, name: &str, v: f64) -> Result<(), SerError> {
        let bits = v.to_bits();
        if short_float_fits(bits) {
            self.put_tag(Tag::ShortFloat as u8, name)?;
            self.out.write_all(&pack_short(bits))?;
        } else if medium_float_fits(bits) {
            self.put_tag(Tag::MediumFloat as u8, name)?;
            self.out.write_all(&pack_medium(bits))?;
        } else {
            self.put_tag(Tag::LongFloat as u8, name)?;
            self.out.write_all(&pack_long(bits))?;
        }
        Ok(())
    }

    fn put_bool(&mut self, name: &str, v: bool) -> Result<(), SerError> {
        self.put_tag(Tag::Bool as u8, name)?;
        self.out.write_all(&[u8::from(v)])?;
        Ok(())
    }
}

impl<W: Write> Formatter for BinFormatter<W> {
    fn add_value(
        &mut self,
        name: &str,
        type_name: &str,
        value: &ScalarValue,
        _id: &str,
    ) -> Result<(), SerError> {
        match value {
            ScalarValue::Empty => self.put_tag(Tag::Empty as u8, name)?,
            ScalarValue::Bool(b) => self.put_bool(name, *b)?,
            ScalarValue::Int(v) => self.put_int(name, *v)?,
            ScalarValue::UInt(v) => self.put_uint(name, *v)?,
            ScalarValue::Float(v) => self.put_float(name, *v)?,
            ScalarValue::Str(s) => match type_name {
                "int" => {
                    if let Ok(v) = s.trim().parse::<i64>() {
                        self.put_int(name, v)?;
                    } else if let Ok(v) = s.trim().parse::<u64>() {
                        self.put_uint(name, v)?;
                    } else {
                        return Err(SerError::NotConvertible { value: s.clone(), target: "int" });
                    }
                }
                "double" => {
                    let v = match s.as_str() {
                        "nan" => f64::NAN,
                        "inf" => f64::INFINITY,
                        "-inf" => f64::NEG_INFINITY,
                        other => other.trim().parse::<f64>().map_err(|_| {
                            SerError::NotConvertible { value: s.clone(), target: "double" }
                        })?,
                    };
                    self.put_float(name, v)?;
                }
                "bool" => self.put_bool(name, s == "true" || s == "1")?,
                "char" if s.chars().count() == 1 && s.is_ascii() => {
                    self.put_tag(Tag::Char as u8, name)?;
                    self.out.write_all(s.as_bytes())?;
                }
                "" | "string" => {
                    self.put_tag(Tag::String as u8, name)?;
                    self.put_cstr(s)?;
                }
                other => {
                    self.put_tag(Tag::Other as u8, name)?;
                    self.put_cstr(other)?;
                    self.put_cstr(s)?;
                }
            },
        }
        Ok(())
    }

    fn add_reference(&mut self, name: &str, target: &str) -> Result<(), SerError> {
        self.out.write_all(&[Tag::CategoryReference as u8])?;
        self.put_name(name)?;
        self.put_cstr(target)?;
        Ok(())
    }

    fn begin_object(&mut self, name: &str, type_name: &str, id: &str) -> Result<(), SerError> {
        self.out.write_all(&[Tag::CategoryObject as u8])?;
        self.put_name(name)?;
        self.put_type_code(type_name)?;
        self.put_cstr(id)?;
        Ok(())
    }

    fn begin_member(&mut self, _name: &str) -> Result<(), SerError> {
        // names travel with the member's own record
        Ok(())
    }

    fn finish_member(&mut self) -> Result<(), SerError> {
        Ok(())
    }

    fn finish_object(&mut self) -> Result<(), SerError> {
        self.out.write_all(&[Tag::Eod as u8])?;
        Ok(())
    }

    fn begin_array(&mut self, name: &str, type_name: &str, id: &str) -> Result<(), SerError> {
        self.out.write_all(&[Tag::CategoryArray as u8])?;
        self.put_name(name)?;
        self.put_type_code(type_name)?;
        self.put_cstr(id)?;
        Ok(())
    }

    fn finish_array(&mut self) -> Result<(), SerError> {
        self.out.write_all(&[Tag::Eod as u8])?;
        Ok(())
    }

    fn finish(&mut self) -> Result<(), SerError> {
        self.out.flush()?;
        Ok(())
    }
}

/// Serializes one tree to bytes.
pub fn to_bin(si: &SerializationInfo) -> Result<Vec<u8>, SerError> {
    let mut fmt = BinFormatter::new(Vec::new());
    crate::format_si(si, &mut fmt)?;
    Ok(fmt.into_inner())
}

/// Result of feeding bytes to a [`BinParser`].
#[derive(Debug, PartialEq, Eq)]
pub enum BinStatus {
    /// A complete top-level node was parsed; `consumed` bytes were taken
    /// from the input.
    Complete { consumed: usize },
    /// All input consumed, node not finished yet.
    NeedMore,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum State {
    Type,
    Name0,
    NameLit,
    NameIdx0,
    NameIdx1,
    TypeCode,
    TypeCodeOther,
    Id,
    OtherTypeName,
    ValueStr,
    ValueFixed,
    CharValue,
    Done,
}

/// Incremental parser for the binary format.
///
/// Feed it byte slices as they arrive; it reports how much it consumed and
/// whether a top-level node is complete, so one stream can carry a
/// sequence of nodes (the RPC transports depend on this). `reset` keeps
/// the name dictionary, which persists across the values of one message.
pub struct BinParser {
    state: State,
    stack: Vec<SerializationInfo>,
    root: Option<SerializationInfo>,
    dict: Vec<String>,
    token: Vec<u8>,
    tag: u8,
    name: String,
    other_type: String,
    fixed: [u8; 10],
    have: usize,
    need: usize,
    dict_idx: u16,
    offset: usize,
}

impl Default for BinParser {
    fn default() -> Self {
        Self::new()
    }
}

impl BinParser {
    pub fn new() -> Self {
        BinParser {
            state: State::Type,
            stack: Vec::new(),
            root: None,
            dict: Vec::new(),
            token: Vec::new(),
            tag: 0,
            name: String::new(),
            other_type: String::new(),
            fixed: [0; 10],
            have: 0,
            need: 0,
            dict_idx: 0,
            offset: 0,
        }
    }

    /// Prepares for the next node, keeping the dictionary.
    pub fn reset(&mut self) {
        self.state = State::Type;
        self.stack.clear();
        self.root = None;
        self.token.clear();
        self.offset = 0;
    }

    /// The parsed tree once `advance` reported completion.
    pub fn take(&mut self) -> Result<SerializationInfo, SerError> {
        if self.state != State::Done {
            return Err(SerError::UnexpectedEnd("binary"));
        }
        self.state = State::Type;
        self.root.take().ok_or(SerError::UnexpectedEnd("binary"))
    }

    fn fail(&self, message: impl Into<String>) -> SerError {
        SerError::parse("binary", self.offset, message)
    }

    fn token_string(&mut self) -> Result<String, SerError> {
        let s = std::str::from_utf8(&self.token)
            .map_err(|_| self.fail("invalid utf-8"))?
            .to_string();
        self.token.clear();
        Ok(s)
    }

    fn attach(&mut self, si: SerializationInfo) {
        match self.stack.last_mut() {
            Some(parent) => {
                parent.push_member(si);
                self.state = State::Type;
            }
            None => {
                self.root = Some(si);
                self.state = State::Done;
            }
        }
    }

    fn finish_scalar(&mut self) -> Result<(), SerError> {
        let name = std::mem::take(&mut self.name);
        let base = self.tag & !PLAIN;
        let mut si = SerializationInfo::new();
        si.set_name(name).set_category(Category::Value);
        match base {
            0x00 => {
                si.set_value(ScalarValue::Empty);
            }
            0x01 => {
                si.set_value(self.fixed[0] != 0).set_type_name("bool");
            }
            0x02 => {
                si.set_value((self.fixed[0] as char).to_string()).set_type_name("char");
            }
            0x03 => {
                let s = self.token_string()?;
                si.set_value(s).set_type_name("string");
            }
            0x04 => {
                // textual integer, as older writers emit it
                let s = self.token_string()?;
                if let Ok(v) = s.parse::<i64>() {
                    si.set_value(v).set_type_name("int");
                } else if let Ok(v) = s.parse::<u64>() {
                    si.set_value(v).set_type_name("int");
                } else {
                    return Err(self.fail(format!("bad integer literal \"{s}\"")));
                }
            }
            0x10 => {
                si.set_value(i64::from(self.fixed[0] as i8)).set_type_name("int");
            }
            0x11 => {
                si.set_value(i64::from(i16::from_le_bytes(self.fixed[..2].try_into().unwrap())))
                    .set_type_name("int");
            }
            0x12 => {
                si.set_value(i64::from(i32::from_le_bytes(self.fixed[..4].try_into().unwrap())))
                    .set_type_name("int");
            }
            0x13 => {
                si.set_value(i64::from_le_bytes(self.fixed[..8].try_into().unwrap()))
                    .set_type_name("int");
            }
            0x18 => {
                si.set_value(u64::from(self.fixed[0])).set_type_name("int");
            }
            0x19 => {
                si.set_value(u64::from(u16::from_le_bytes(self.fixed[..2].try_into().unwrap())))
                    .set_type_name("int");
            }
            0x1a => {
                si.set_value(u64::from(u32::from_le_bytes(self.fixed[..4].try_into().unwrap())))
                    .set_type_name("int");
            }
            0x1b => {
                si.set_value(u64::from_le_bytes(self.fixed[..8].try_into().unwrap()))
                    .set_type_name("int");
            }
            0x21 => {
                si.set_value(unpack_short(&self.fixed[..3])).set_type_name("double");
            }
            0x22 => {
                si.set_value(unpack_medium(&self.fixed[..5])).set_type_name("double");
            }
            0x23 => {
                si.set_value(unpack_long(&self.fixed[..10])).set_type_name("double");
            }
            0x3f => {
                let s = self.token_string()?;
                let tn = std::mem::take(&mut self.other_type);
                si.set_value(s).set_type_name(tn);
            }
            other => return Err(self.fail(format!("unhandled scalar tag {other:#04x}"))),
        }
        self.attach(si);
        Ok(())
    }

    fn valid_tag(b: u8) -> bool {
        if b >= 0x80 {
            return (Tag::CategoryObject as u8..=Tag::CategoryReference as u8).contains(&b);
        }
        let base = b & !PLAIN;
        Self::fixed_len(base).is_some() || matches!(base, 0x00 | 0x02 | 0x03 | 0x04 | 0x3f)
    }

    fn fixed_len(tag: u8) -> Option<usize> {
        Some(match tag & !PLAIN {
            0x01 => 1,
            0x10 | 0x18 => 1,
            0x11 | 0x19 => 2,
            0x12 | 0x1a => 4,
            0x13 | 0x1b => 8,
            0x21 => 3,
            0x22 => 5,
            0x23 => 10,
            _ => return None,
        })
    }

    /// After the name (if any) is known, route to the payload state.
    fn enter_payload(&mut self) -> Result<(), SerError> {
        let base = self.tag & !PLAIN;
        match self.tag {
            t if t == Tag::CategoryObject as u8 || t == Tag::CategoryArray as u8 => {
                self.state = State::TypeCode;
                Ok(())
            }
            t if t == Tag::CategoryReference as u8 => {
                self.state = State::ValueStr;
                Ok(())
            }
            _ => match base {
                0x00 => self.finish_scalar(),
                0x02 => {
                    self.state = State::CharValue;
                    Ok(())
                }
                0x03 | 0x04 => {
                    self.state = State::ValueStr;
                    Ok(())
                }
                0x3f => {
                    self.state = State::OtherTypeName;
                    Ok(())
                }
                _ => match Self::fixed_len(self.tag) {
                    Some(n) => {
                        self.need = n;
                        self.have = 0;
                        self.state = State::ValueFixed;
                        Ok(())
                    }
                    None => Err(self.fail(format!("unknown tag {:#04x}", self.tag))),
                },
            },
        }
    }

    fn dict_lookup(&self, idx: u16) -> Result<String, SerError> {
        self.dict
            .get(idx as usize)
            .cloned()
            .ok_or_else(|| self.fail(format!("dictionary index {idx} out of range")))
    }

    /// Consumes bytes from `input`; stops early when a top-level node
    /// completes.
    pub fn advance(&mut self, input: &[u8]) -> Result<BinStatus, SerError> {
        for (pos, &b) in input.iter().enumerate() {
            self.offset += 1;
            match self.state {
                State::Done => {
                    return Ok(BinStatus::Complete { consumed: pos });
                }
                State::Type => {
                    if b == Tag::Eod as u8 {
                        let si = self
                            .stack
                            .pop()
                            .ok_or_else(|| self.fail("end-of-data outside a container"))?;
                        self.attach(si);
                        if self.state == State::Done {
                            return Ok(BinStatus::Complete { consumed: pos + 1 });
                        }
                        continue;
                    }
                    if !Self::valid_tag(b) {
                        return Err(self.fail(format!("unknown tag {b:#04x}")));
                    }
                    self.tag = b;
                    if b >= PLAIN && b < 0x80 {
                        // plain range: no name follows
                        self.name.clear();
                        self.enter_payload()?;
                    } else {
                        self.state = State::Name0;
                    }
                    if self.state == State::Done {
                        return Ok(BinStatus::Complete { consumed: pos + 1 });
                    }
                }
                State::Name0 => match b {
                    0 => {
                        self.name.clear();
                        self.enter_payload()?;
                        if self.state == State::Done {
                            return Ok(BinStatus::Complete { consumed: pos + 1 });
                        }
                    }
                    DICT_MARKER => self.state = State::NameIdx0,
                    _ => {
                        self.token.push(b);
                        self.state = State::NameLit;
                    }
                },
                State::NameLit => {
                    if b == 0 {
                        self.name = self.token_string()?;
                        if self.dict.len() < u16::MAX as usize {
                            self.dict.push(self.name.clone());
                        }
                        self.enter_payload()?;
                        if self.state == State::Done {
                            return Ok(BinStatus::Complete { consumed: pos + 1 });
                        }
                    } else {
                        self.token.push(b);
                    }
                }
                State::NameIdx0 => {
                    self.dict_idx = u16::from(b) << 8;
                    self.state = State::NameIdx1;
                }
                State::NameIdx1 => {
                    self.dict_idx |= u16::from(b);
                    self.name = self.dict_lookup(self.dict_idx)?;
                    self.enter_payload()?;
                    if self.state == State::Done {
                        return Ok(BinStatus::Complete { consumed: pos + 1 });
                    }
                }
                State::TypeCode => {
                    if b == Tag::Other as u8 {
                        self.state = State::TypeCodeOther;
                    } else {
                        let tn = type_code_name(b)
                            .ok_or_else(|| self.fail(format!("bad type code {b:#04x}")))?;
                        self.other_type = tn.to_string();
                        self.state = State::Id;
                    }
                }
                State::TypeCodeOther => {
                    if b == 0 {
                        self.other_type = self.token_string()?;
                        self.state = State::Id;
                    } else {
                        self.token.push(b);
                    }
                }
                State::Id => {
                    if b == 0 {
                        let id = self.token_string()?;
                        let mut si = if self.tag == Tag::CategoryObject as u8 {
                            SerializationInfo::object()
                        } else {
                            SerializationInfo::array()
                        };
                        si.set_name(std::mem::take(&mut self.name))
                            .set_type_name(std::mem::take(&mut self.other_type))
                            .set_id(id);
                        self.stack.push(si);
                        self.state = State::Type;
                    } else {
                        self.token.push(b);
                    }
                }
                State::OtherTypeName => {
                    if b == 0 {
                        self.other_type = self.token_string()?;
                        self.state = State::ValueStr;
                    } else {
                        self.token.push(b);
                    }
                }
                State::ValueStr => {
                    if b == 0 {
                        if self.tag == Tag::CategoryReference as u8 {
                            let target = self.token_string()?;
                            let name = std::mem::take(&mut self.name);
                            let si = SerializationInfo::reference(target).with_name(name);
                            self.attach(si);
                        } else {
                            self.finish_scalar()?;
                        }
                        if self.state == State::Done {
                            return Ok(BinStatus::Complete { consumed: pos + 1 });
                        }
                    } else {
                        self.token.push(b);
                    }
                }
                State::CharValue => {
                    self.fixed[0] = b;
                    self.finish_scalar()?;
                    if self.state == State::Done {
                        return Ok(BinStatus::Complete { consumed: pos + 1 });
                    }
                }
                State::ValueFixed => {
                    self.fixed[self.have] = b;
                    self.have += 1;
                    if self.have == self.need {
                        self.finish_scalar()?;
                        if self.state == State::Done {
                            return Ok(BinStatus::Complete { consumed: pos + 1 });
                        }
                    }
                }
            }
        }
        if self.state == State::Done {
            Ok(BinStatus::Complete { consumed: input.len() })
        } else {
            Ok(BinStatus::NeedMore)
        }
    }
}

/// Parses one complete binary document.
pub fn parse_bin(input: &[u8]) -> Result<SerializationInfo, SerError> {
    let mut parser = BinParser::new();
    match parser.advance(input)? {
        BinStatus::Complete { .. } => parser.take(),
        BinStatus::NeedMore => Err(SerError::UnexpectedEnd("binary")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SerializationInfo {
        let mut si = SerializationInfo::object();
        si.set_type_name("TestObject");
        si.add_member("small").set_value(7i64);
        si.add_member("negative").set_value(-40_000i64);
        si.add_member("big").set_value(u64::from(u32::MAX) + 10);
        si.add_member("text").set_value("hello");
        si.add_member("flag").set_value(false);
        let arr = si.add_member("values");
        arr.set_category(Category::Array).set_type_name("vector");
        arr.push_member(SerializationInfo::value(1.5f64));
        arr.push_member(SerializationInfo::value(2.5f64));
        si
    }

    #[test]
    fn roundtrip() {
        let si = sample();
        let bytes = to_bin(&si).unwrap();
        let back = parse_bin(&bytes).unwrap();
        assert!(si.structurally_eq(&back));
    }

    #[test]
    fn roundtrip_byte_at_a_time() {
        let si = sample();
        let bytes = to_bin(&si).unwrap();

        let mut parser = BinParser::new();
        let mut done = false;
        for b in &bytes {
            match parser.advance(std::slice::from_ref(b)).unwrap() {
                BinStatus::Complete { .. } => {
                    done = true;
                    break;
                }
                BinStatus::NeedMore => {}
            }
        }
        assert!(done);
        assert!(si.structurally_eq(&parser.take().unwrap()));
    }

    #[test]
    fn int_width_selection() {
        assert_eq!(to_bin(&SerializationInfo::value(7i64)).unwrap()[0], Tag::UInt8 as u8 | 0x40);
        assert_eq!(to_bin(&SerializationInfo::value(300i64)).unwrap()[0], Tag::UInt16 as u8 | 0x40);
        assert_eq!(to_bin(&SerializationInfo::value(-1i64)).unwrap()[0], Tag::Int8 as u8 | 0x40);
        assert_eq!(
            to_bin(&SerializationInfo::value(-130i64)).unwrap()[0],
            Tag::Int16 as u8 | 0x40
        );
        assert_eq!(
            to_bin(&SerializationInfo::value(u64::MAX)).unwrap()[0],
            Tag::UInt64 as u8 | 0x40
        );
    }

    #[test]
    fn float_width_selection() {
        // 1.5 = 1.1b: fits the 16-bit mantissa
        assert_eq!(to_bin(&SerializationInfo::value(1.5f64)).unwrap()[0], 0x61);
        // needs more than 16 but at most 32 mantissa bits
        let medium = f64::from_bits(0x3ff0_0000_1000_0000);
        assert_eq!(to_bin(&SerializationInfo::value(medium)).unwrap()[0], 0x62);
        // irrational-ish: full mantissa
        assert_eq!(
            to_bin(&SerializationInfo::value(std::f64::consts::PI)).unwrap()[0],
            0x63
        );
    }

    #[test]
    fn float_roundtrips_losslessly() {
        for v in [0.0, -0.0, 1.5, -2.25, 1e300, -1e-300, std::f64::consts::PI, f64::MAX] {
            let bytes = to_bin(&SerializationInfo::value(v)).unwrap();
            let back = parse_bin(&bytes).unwrap();
            assert_eq!(back.as_f64().unwrap().to_bits(), v.to_bits(), "value {v}");
        }
    }

    #[test]
    fn non_finite_floats() {
        for v in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let bytes = to_bin(&SerializationInfo::value(v)).unwrap();
            let back = parse_bin(&bytes).unwrap().as_f64().unwrap();
            assert_eq!(back.is_nan(), v.is_nan());
            if !v.is_nan() {
                assert_eq!(back, v);
            }
        }
    }

    #[test]
    fn plain_string_encoding() {
        // anonymous strings use the plain tag range
        let bytes = to_bin(&SerializationInfo::value("hello")).unwrap();
        assert_eq!(bytes, b"\x43hello\0");
    }

    #[test]
    fn named_string_encoding() {
        let mut si = SerializationInfo::value("hello");
        si.set_name("greeting");
        let bytes = to_bin(&si).unwrap();
        assert_eq!(bytes, b"\x03greeting\0hello\0");
    }

    #[test]
    fn dictionary_compresses_repeated_names() {
        let mut si = SerializationInfo::array();
        for i in 0..3 {
            let mut obj = SerializationInfo::object();
            obj.add_member("alpha").set_value(i as i64);
            obj.add_member("beta").set_value("x");
            si.push_member(obj);
        }
        let bytes = to_bin(&si).unwrap();
        // "alpha" spelled out once, then referenced as 0x01 idx idx
        let spelled = bytes.windows(5).filter(|w| **w == b"alpha"[..]).count();
        assert_eq!(spelled, 1);
        let back = parse_bin(&bytes).unwrap();
        assert!(si.structurally_eq(&back));
    }

    #[test]
    fn custom_typed_value() {
        let mut si = SerializationInfo::value("payload");
        si.set_type_name("Blob");
        let bytes = to_bin(&si).unwrap();
        assert_eq!(bytes[0], 0x7f); // plain Other
        let back = parse_bin(&bytes).unwrap();
        assert_eq!(back.type_name(), "Blob");
        assert_eq!(back.as_str(), "payload");
    }

    #[test]
    fn reference_roundtrip() {
        let mut si = SerializationInfo::object();
        si.add_member("first").set_value(1i64);
        si.push_member(SerializationInfo::reference("7").with_name("again"));
        let bytes = to_bin(&si).unwrap();
        let back = parse_bin(&bytes).unwrap();
        assert!(si.structurally_eq(&back));
        assert_eq!(back.member("again").unwrap().category(), Category::Reference);
    }

    #[test]
    fn truncated_input_is_incomplete_not_error() {
        let bytes = to_bin(&sample()).unwrap();
        let mut parser = BinParser::new();
        assert_eq!(parser.advance(&bytes[..bytes.len() - 1]).unwrap(), BinStatus::NeedMore);
        assert!(parser.take().is_err());
    }

    #[test]
    fn garbage_tag_is_an_error() {
        let mut parser = BinParser::new();
        assert!(parser.advance(&[0x9c]).is_err());
    }

    #[test]
    fn stray_eod_is_an_error() {
        let mut parser = BinParser::new();
        assert!(parser.advance(&[0xff]).is_err());
    }
}
