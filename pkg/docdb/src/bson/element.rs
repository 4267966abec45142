use common::errors::*;

use crate::bson::document::Document;
use crate::bson::objectid::ObjectId;

// Type tags, matching the fixed wire layout.
pub const TAG_DOUBLE: u8 = 0x01;
pub const TAG_STRING: u8 = 0x02;
pub const TAG_DOCUMENT: u8 = 0x03;
pub const TAG_ARRAY: u8 = 0x04;
pub const TAG_BINARY: u8 = 0x05;
pub const TAG_UNDEFINED: u8 = 0x06;
pub const TAG_OBJECT_ID: u8 = 0x07;
pub const TAG_BOOLEAN: u8 = 0x08;
pub const TAG_DATETIME: u8 = 0x09;
pub const TAG_NULL: u8 = 0x0A;
pub const TAG_REGEX: u8 = 0x0B;
pub const TAG_DB_POINTER: u8 = 0x0C;
pub const TAG_CODE: u8 = 0x0D;
pub const TAG_SYMBOL: u8 = 0x0E;
pub const TAG_CODE_WITH_SCOPE: u8 = 0x0F;
pub const TAG_INT32: u8 = 0x10;
pub const TAG_TIMESTAMP: u8 = 0x11;
pub const TAG_INT64: u8 = 0x12;
pub const TAG_MIN_KEY: u8 = 0xFF;
pub const TAG_MAX_KEY: u8 = 0x7F;

/// The closed set of value types an element may hold. Named values live one
/// level up in `Element`; `Value` only describes the payload.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Double(f64),
    String(String),
    Document(Document),
    Array(Vec<Value>),
    Binary { subtype: u8, data: Vec<u8> },
    Undefined,
    ObjectId(ObjectId),
    Boolean(bool),
    DateTimeMillis(i64),
    Null,
    Regex { pattern: String, options: String },
    DbPointer { namespace: String, id: ObjectId },
    Code(String),
    Symbol(String),
    CodeWithScope { code: String, scope: Document },
    Int32(i32),
    Timestamp { increment: u32, time: u32 },
    Int64(i64),
    MinKey,
    MaxKey,
}

impl Value {
    pub fn tag(&self) -> u8 {
        match self {
            Value::Double(_) => TAG_DOUBLE,
            Value::String(_) => TAG_STRING,
            Value::Document(_) => TAG_DOCUMENT,
            Value::Array(_) => TAG_ARRAY,
            Value::Binary { .. } => TAG_BINARY,
            Value::Undefined => TAG_UNDEFINED,
            Value::ObjectId(_) => TAG_OBJECT_ID,
            Value::Boolean(_) => TAG_BOOLEAN,
            Value::DateTimeMillis(_) => TAG_DATETIME,
            Value::Null => TAG_NULL,
            Value::Regex { .. } => TAG_REGEX,
            Value::DbPointer { .. } => TAG_DB_POINTER,
            Value::Code(_) => TAG_CODE,
            Value::Symbol(_) => TAG_SYMBOL,
            Value::CodeWithScope { .. } => TAG_CODE_WITH_SCOPE,
            Value::Int32(_) => TAG_INT32,
            Value::Timestamp { .. } => TAG_TIMESTAMP,
            Value::Int64(_) => TAG_INT64,
            Value::MinKey => TAG_MIN_KEY,
            Value::MaxKey => TAG_MAX_KEY,
        }
    }

    /// Size of just the value payload, excluding the type tag and name.
    pub fn encoded_len(&self) -> usize {
        match self {
            Value::Double(_) => 8,
            Value::String(s) => string_encoded_len(s),
            Value::Document(d) => d.encoded_len(),
            Value::Array(items) => array_encoded_len(items),
            Value::Binary { data, .. } => 4 + 1 + data.len(),
            Value::Undefined => 0,
            Value::ObjectId(_) => ObjectId::LEN,
            Value::Boolean(_) => 1,
            Value::DateTimeMillis(_) => 8,
            Value::Null => 0,
            Value::Regex { pattern, options } => cstring_len(pattern) + cstring_len(options),
            Value::DbPointer { namespace, .. } => string_encoded_len(namespace) + ObjectId::LEN,
            Value::Code(s) => string_encoded_len(s),
            Value::Symbol(s) => string_encoded_len(s),
            Value::CodeWithScope { code, scope } => {
                4 + string_encoded_len(code) + scope.encoded_len()
            }
            Value::Int32(_) => 4,
            Value::Timestamp { .. } => 8,
            Value::Int64(_) => 8,
            Value::MinKey => 0,
            Value::MaxKey => 0,
        }
    }

    pub fn encode(&self, out: &mut Vec<u8>) -> Result<()> {
        match self {
            Value::Double(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::String(s) => encode_string(s, out),
            Value::Document(d) => d.encode(out)?,
            Value::Array(items) => encode_array(items, out)?,
            Value::Binary { subtype, data } => {
                out.extend_from_slice(&(data.len() as i32).to_le_bytes());
                out.push(*subtype);
                out.extend_from_slice(data);
            }
            Value::Undefined => {}
            Value::ObjectId(id) => out.extend_from_slice(id.bytes()),
            Value::Boolean(b) => out.push(if *b { 1 } else { 0 }),
            Value::DateTimeMillis(ms) => out.extend_from_slice(&ms.to_le_bytes()),
            Value::Null => {}
            Value::Regex { pattern, options } => {
                encode_cstring(pattern, out)?;
                encode_cstring(options, out)?;
            }
            Value::DbPointer { namespace, id } => {
                encode_string(namespace, out);
                out.extend_from_slice(id.bytes());
            }
            Value::Code(s) => encode_string(s, out),
            Value::Symbol(s) => encode_string(s, out),
            Value::CodeWithScope { code, scope } => {
                let len = self.encoded_len() as i32;
                out.extend_from_slice(&len.to_le_bytes());
                encode_string(code, out);
                scope.encode(out)?;
            }
            Value::Int32(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::Timestamp { increment, time } => {
                out.extend_from_slice(&increment.to_le_bytes());
                out.extend_from_slice(&time.to_le_bytes());
            }
            Value::Int64(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::MinKey => {}
            Value::MaxKey => {}
        }

        Ok(())
    }

    pub fn decode(tag: u8, data: &[u8], pos: &mut usize) -> Result<Value> {
        Ok(match tag {
            TAG_DOUBLE => Value::Double(f64::from_le_bytes(take(data, pos, 8)?.try_into().unwrap())),
            TAG_STRING => Value::String(decode_string(data, pos)?),
            TAG_DOCUMENT => Value::Document(Document::decode(data, pos)?),
            TAG_ARRAY => Value::Array(decode_array(data, pos)?),
            TAG_BINARY => {
                let len = i32::from_le_bytes(take(data, pos, 4)?.try_into().unwrap());
                if len < 0 {
                    return Err(format_err!("negative binary length"));
                }
                let subtype = take(data, pos, 1)?[0];
                let bytes = take(data, pos, len as usize)?.to_vec();
                Value::Binary {
                    subtype,
                    data: bytes,
                }
            }
            TAG_UNDEFINED => Value::Undefined,
            TAG_OBJECT_ID => ObjectId::parse(take(data, pos, ObjectId::LEN)?)
                .map(Value::ObjectId)?,
            TAG_BOOLEAN => {
                let b = take(data, pos, 1)?[0];
                Value::Boolean(b != 0)
            }
            TAG_DATETIME => {
                Value::DateTimeMillis(i64::from_le_bytes(take(data, pos, 8)?.try_into().unwrap()))
            }
            TAG_NULL => Value::Null,
            TAG_REGEX => {
                let pattern = decode_cstring(data, pos)?;
                let options = decode_cstring(data, pos)?;
                Value::Regex { pattern, options }
            }
            TAG_DB_POINTER => {
                let namespace = decode_string(data, pos)?;
                let id = ObjectId::parse(take(data, pos, ObjectId::LEN)?)?;
                Value::DbPointer { namespace, id }
            }
            TAG_CODE => Value::Code(decode_string(data, pos)?),
            TAG_SYMBOL => Value::Symbol(decode_string(data, pos)?),
            TAG_CODE_WITH_SCOPE => {
                let _total_len = i32::from_le_bytes(take(data, pos, 4)?.try_into().unwrap());
                let code = decode_string(data, pos)?;
                let scope = Document::decode(data, pos)?;
                Value::CodeWithScope { code, scope }
            }
            TAG_INT32 => Value::Int32(i32::from_le_bytes(take(data, pos, 4)?.try_into().unwrap())),
            TAG_TIMESTAMP => {
                let increment = u32::from_le_bytes(take(data, pos, 4)?.try_into().unwrap());
                let time = u32::from_le_bytes(take(data, pos, 4)?.try_into().unwrap());
                Value::Timestamp { increment, time }
            }
            TAG_INT64 => Value::Int64(i64::from_le_bytes(take(data, pos, 8)?.try_into().unwrap())),
            TAG_MIN_KEY => Value::MinKey,
            TAG_MAX_KEY => Value::MaxKey,
            other => return Err(format_err!("unknown BSON type tag: 0x{:02x}", other)),
        })
    }

    /// Type ordinal used to order elements whose names compare equal, per
    /// the comparison rule (cross-numeric promotion, then by ordinal).
    fn order_class(&self) -> u8 {
        match self {
            Value::MinKey => 0,
            Value::Null | Value::Undefined => 1,
            Value::Double(_) | Value::Int32(_) | Value::Int64(_) => 2,
            Value::String(_) | Value::Symbol(_) | Value::Code(_) => 3,
            Value::Document(_) => 4,
            Value::Array(_) => 5,
            Value::Binary { .. } => 6,
            Value::ObjectId(_) => 7,
            Value::Boolean(_) => 8,
            Value::DateTimeMillis(_) => 9,
            Value::Timestamp { .. } => 10,
            Value::Regex { .. } => 11,
            Value::DbPointer { .. } => 12,
            Value::CodeWithScope { .. } => 13,
            Value::MaxKey => 14,
        }
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Value) -> Option<std::cmp::Ordering> {
        use std::cmp::Ordering;

        if let (Some(a), Some(b)) = (as_f64(self), as_f64(other)) {
            return a.partial_cmp(&b);
        }
        if let (Some(a), Some(b)) = (as_str(self), as_str(other)) {
            return a.partial_cmp(b);
        }

        let class_cmp = self.order_class().cmp(&other.order_class());
        if class_cmp != Ordering::Equal {
            return Some(class_cmp);
        }

        None
    }
}

fn as_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Double(d) => Some(*d),
        Value::Int32(i) => Some(*i as f64),
        Value::Int64(i) => Some(*i as f64),
        _ => None,
    }
}

fn as_str(v: &Value) -> Option<&str> {
    match v {
        Value::String(s) => Some(s.as_str()),
        Value::Symbol(s) => Some(s.as_str()),
        _ => None,
    }
}

/// A named value inside a `Document`.
#[derive(Clone, Debug, PartialEq)]
pub struct Element {
    name: String,
    value: Value,
}

impl Element {
    pub fn new(name: impl Into<String>, value: Value) -> Result<Self> {
        let name = name.into();
        if name.as_bytes().contains(&0) {
            return Err(format_err!("invalid-name: element name contains NUL"));
        }
        Ok(Self { name, value })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn into_value(self) -> Value {
        self.value
    }

    /// Exact encoded size: type tag + name + NUL + value payload.
    pub fn encoded_len(&self) -> usize {
        1 + cstring_len(&self.name) + self.value.encoded_len()
    }

    pub fn encode(&self, out: &mut Vec<u8>) -> Result<()> {
        out.push(self.value.tag());
        encode_cstring(&self.name, out)?;
        self.value.encode(out)
    }
}

impl PartialOrd for Element {
    fn partial_cmp(&self, other: &Element) -> Option<std::cmp::Ordering> {
        let name_cmp = self.name.cmp(&other.name);
        if name_cmp != std::cmp::Ordering::Equal {
            return Some(name_cmp);
        }
        self.value.partial_cmp(&other.value)
    }
}

pub(crate) fn cstring_len(s: &str) -> usize {
    s.len() + 1
}

pub(crate) fn encode_cstring(s: &str, out: &mut Vec<u8>) -> Result<()> {
    if s.as_bytes().contains(&0) {
        return Err(format_err!("invalid-name: CString contains interior NUL"));
    }
    out.extend_from_slice(s.as_bytes());
    out.push(0);
    Ok(())
}

pub(crate) fn decode_cstring(data: &[u8], pos: &mut usize) -> Result<String> {
    let start = *pos;
    let mut end = start;
    while end < data.len() && data[end] != 0 {
        end += 1;
    }
    if end >= data.len() {
        return Err(format_err!("decode-failure: unterminated CString"));
    }
    let s = std::str::from_utf8(&data[start..end])
        .map_err(|_| format_err!("decode-failure: invalid UTF-8 in CString"))?
        .to_string();
    *pos = end + 1;
    Ok(s)
}

pub(crate) fn string_encoded_len(s: &str) -> usize {
    4 + s.len() + 1
}

pub(crate) fn encode_string(s: &str, out: &mut Vec<u8>) {
    let len = (s.len() + 1) as i32;
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(s.as_bytes());
    out.push(0);
}

pub(crate) fn decode_string(data: &[u8], pos: &mut usize) -> Result<String> {
    let len = i32::from_le_bytes(take(data, pos, 4)?.try_into().unwrap());
    if len < 1 {
        return Err(format_err!("decode-failure: invalid string length"));
    }
    let bytes = take(data, pos, len as usize)?;
    if bytes.last() != Some(&0) {
        return Err(format_err!("decode-failure: string missing trailing NUL"));
    }
    std::str::from_utf8(&bytes[..bytes.len() - 1])
        .map(|s| s.to_string())
        .map_err(|_| format_err!("decode-failure: invalid UTF-8 in string"))
}

fn array_encoded_len(items: &[Value]) -> usize {
    let mut total = 4usize;
    for (i, v) in items.iter().enumerate() {
        total += 1 + cstring_len(&i.to_string()) + v.encoded_len();
    }
    total + 1
}

fn encode_array(items: &[Value], out: &mut Vec<u8>) -> Result<()> {
    let len = array_encoded_len(items) as i32;
    out.extend_from_slice(&len.to_le_bytes());
    for (i, v) in items.iter().enumerate() {
        out.push(v.tag());
        encode_cstring(&i.to_string(), out)?;
        v.encode(out)?;
    }
    out.push(0);
    Ok(())
}

fn decode_array(data: &[u8], pos: &mut usize) -> Result<Vec<Value>> {
    let start = *pos;
    let total_len = i32::from_le_bytes(take(data, pos, 4)?.try_into().unwrap());
    if total_len < 5 {
        return Err(format_err!("decode-failure: invalid array length"));
    }
    let end = start + total_len as usize;
    if end > data.len() {
        return Err(format_err!("decode-failure: array length exceeds buffer"));
    }

    let mut items = Vec::new();
    while *pos < end - 1 {
        let tag = take(data, pos, 1)?[0];
        let _index_name = decode_cstring(data, pos)?;
        let value = Value::decode(tag, data, pos)?;
        items.push(value);
    }

    if take(data, pos, 1)?[0] != 0 {
        return Err(format_err!("decode-failure: array missing terminator"));
    }

    Ok(items)
}

pub(crate) fn take<'a>(data: &'a [u8], pos: &mut usize, n: usize) -> Result<&'a [u8]> {
    if *pos + n > data.len() {
        return Err(format_err!("decode-failure: unexpected end of buffer"));
    }
    let out = &data[*pos..*pos + n];
    *pos += n;
    Ok(out)
}
