//! The `Record`: a named, typed, clock-stamped value held in the store.
//!
//! Scalars are stored inline; strings, arrays and blobs are held behind an
//! `Arc` so that handing a copy to a filter or a transport thread is cheap.
//! Mutating a shared payload triggers copy-on-write via `Arc::make_mut`.

use std::cmp::Ordering;
use std::convert::TryInto;
use std::sync::Arc;

use crate::error::{KnowledgeError, Result};

/// Wire type tag, in the order fixed by the wire format (§3.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum TypeTag {
    Empty = 0,
    Integer = 1,
    Double = 2,
    String = 3,
    IntegerArray = 4,
    DoubleArray = 5,
    BinaryFile = 6,
    TextFile = 7,
    Xml = 8,
    ImageJpeg = 9,
    Any = 10,
}

impl TypeTag {
    pub fn from_u32(v: u32) -> Result<Self> {
        Ok(match v {
            0 => TypeTag::Empty,
            1 => TypeTag::Integer,
            2 => TypeTag::Double,
            3 => TypeTag::String,
            4 => TypeTag::IntegerArray,
            5 => TypeTag::DoubleArray,
            6 => TypeTag::BinaryFile,
            7 => TypeTag::TextFile,
            8 => TypeTag::Xml,
            9 => TypeTag::ImageJpeg,
            10 => TypeTag::Any,
            other => return Err(KnowledgeError::Type(format!("unknown type tag {other}"))),
        })
    }
}

/// The payload half of a record. Text/array/blob variants are reference
/// counted so `Record::clone()` is O(1); a write that observes a shared
/// count > 1 clones-on-write before mutating.
#[derive(Debug, Clone)]
pub enum RecordValue {
    Empty,
    Integer(i64),
    Double(f64),
    String(Arc<String>),
    IntegerArray(Arc<Vec<i64>>),
    DoubleArray(Arc<Vec<f64>>),
    BinaryFile(Arc<Vec<u8>>),
    TextFile(Arc<String>),
    Xml(Arc<String>),
    ImageJpeg(Arc<Vec<u8>>),
    /// A user-registered type identifier plus its serialized bytes.
    Any { tag: u32, bytes: Arc<Vec<u8>> },
}

impl RecordValue {
    pub fn type_tag(&self) -> TypeTag {
        match self {
            RecordValue::Empty => TypeTag::Empty,
            RecordValue::Integer(_) => TypeTag::Integer,
            RecordValue::Double(_) => TypeTag::Double,
            RecordValue::String(_) => TypeTag::String,
            RecordValue::IntegerArray(_) => TypeTag::IntegerArray,
            RecordValue::DoubleArray(_) => TypeTag::DoubleArray,
            RecordValue::BinaryFile(_) => TypeTag::BinaryFile,
            RecordValue::TextFile(_) => TypeTag::TextFile,
            RecordValue::Xml(_) => TypeTag::Xml,
            RecordValue::ImageJpeg(_) => TypeTag::ImageJpeg,
            RecordValue::Any { .. } => TypeTag::Any,
        }
    }

    fn is_string_like(&self) -> bool {
        matches!(
            self,
            RecordValue::String(_) | RecordValue::TextFile(_) | RecordValue::Xml(_)
        )
    }

    fn is_array(&self) -> bool {
        matches!(self, RecordValue::IntegerArray(_) | RecordValue::DoubleArray(_))
    }
}

/// Lifecycle marker (§3.1). A record with status `Uncreated` must never
/// appear in a published message payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Uncreated,
    Modified,
}

/// A value plus its replication metadata.
#[derive(Debug, Clone)]
pub struct Record {
    pub value: RecordValue,
    pub clock: u64,
    pub quality: u32,
    pub write_quality: u32,
    pub status: Status,
}

impl Default for Record {
    fn default() -> Self {
        Self {
            value: RecordValue::Empty,
            clock: 0,
            quality: 0,
            write_quality: 0,
            status: Status::Uncreated,
        }
    }
}

/// Outcome of merging an inbound record into the store under last-writer-wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    DiscardedStaleClock,
    DiscardedLowQuality,
    DiscardedNullKey,
    NoChange,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_integer(v: i64) -> Self {
        Self { value: RecordValue::Integer(v), ..Self::default() }
    }

    pub fn from_double(v: f64) -> Self {
        Self { value: RecordValue::Double(v), ..Self::default() }
    }

    pub fn from_string(v: impl Into<String>) -> Self {
        Self { value: RecordValue::String(Arc::new(v.into())), ..Self::default() }
    }

    pub fn from_integer_array(v: Vec<i64>) -> Self {
        Self { value: RecordValue::IntegerArray(Arc::new(v)), ..Self::default() }
    }

    pub fn from_double_array(v: Vec<f64>) -> Self {
        Self { value: RecordValue::DoubleArray(Arc::new(v)), ..Self::default() }
    }

    pub fn is_empty_type(&self) -> bool {
        matches!(self.value, RecordValue::Empty)
    }

    /// Replace the payload and type. Clears the Uncreated status. Does
    /// *not* touch `clock` — the store owns clock assignment on a local
    /// write (§4.1).
    pub fn set_value(&mut self, value: RecordValue) {
        self.value = value;
        self.status = Status::Modified;
    }

    /// Number of elements: 1 for scalars, byte/char count for strings
    /// (including the implicit trailing zero), element count for arrays,
    /// 0 for `Empty`.
    pub fn size(&self) -> usize {
        match &self.value {
            RecordValue::Empty => 0,
            RecordValue::Integer(_) | RecordValue::Double(_) => 1,
            RecordValue::String(s) => s.len() + 1,
            RecordValue::TextFile(s) | RecordValue::Xml(s) => s.len() + 1,
            RecordValue::IntegerArray(a) => a.len(),
            RecordValue::DoubleArray(a) => a.len(),
            RecordValue::BinaryFile(b) => b.len(),
            RecordValue::ImageJpeg(b) => b.len(),
            RecordValue::Any { bytes, .. } => bytes.len(),
        }
    }

    /// Array read. Out-of-range reads return zero (§3.3).
    pub fn retrieve_index(&self, i: usize) -> Record {
        match &self.value {
            RecordValue::IntegerArray(a) => Record::from_integer(a.get(i).copied().unwrap_or(0)),
            RecordValue::DoubleArray(a) => Record::from_double(a.get(i).copied().unwrap_or(0.0)),
            other if other.is_string_like() => {
                let s = self.to_string_delim("");
                Record::from_integer(s.as_bytes().get(i).copied().unwrap_or(0) as i64)
            }
            _ => Record::from_integer(0),
        }
    }

    /// Array write. Growing writes reallocate and zero-pad intervening
    /// slots; promotion from integer-array to double-array occurs if `v`
    /// is a double and the array is currently integer (§3.3/§4.1).
    pub fn set_index(&mut self, i: usize, v: &Record) {
        let is_double_write = matches!(v.value, RecordValue::Double(_))
            || (matches!(self.value, RecordValue::DoubleArray(_)));

        if is_double_write {
            let mut arr = match &self.value {
                RecordValue::DoubleArray(a) => (**a).clone(),
                RecordValue::IntegerArray(a) => a.iter().map(|x| *x as f64).collect(),
                _ => Vec::new(),
            };
            if i >= arr.len() {
                arr.resize(i + 1, 0.0);
            }
            arr[i] = v.to_double();
            self.value = RecordValue::DoubleArray(Arc::new(arr));
        } else {
            let mut arr = match &self.value {
                RecordValue::IntegerArray(a) => (**a).clone(),
                _ => Vec::new(),
            };
            if i >= arr.len() {
                arr.resize(i + 1, 0);
            }
            arr[i] = v.to_integer();
            self.value = RecordValue::IntegerArray(Arc::new(arr));
        }
        self.status = Status::Modified;
    }

    pub fn to_integer(&self) -> i64 {
        match &self.value {
            RecordValue::Empty => 0,
            RecordValue::Integer(v) => *v,
            RecordValue::Double(v) => *v as i64,
            RecordValue::String(s) | RecordValue::TextFile(s) | RecordValue::Xml(s) => {
                s.trim().parse::<i64>().unwrap_or(0)
            }
            RecordValue::IntegerArray(a) => a.first().copied().unwrap_or(0),
            RecordValue::DoubleArray(a) => a.first().copied().unwrap_or(0.0) as i64,
            RecordValue::BinaryFile(_) | RecordValue::ImageJpeg(_) | RecordValue::Any { .. } => 0,
        }
    }

    pub fn to_double(&self) -> f64 {
        match &self.value {
            RecordValue::Empty => 0.0,
            RecordValue::Integer(v) => *v as f64,
            RecordValue::Double(v) => *v,
            RecordValue::String(s) | RecordValue::TextFile(s) | RecordValue::Xml(s) => {
                s.trim().parse::<f64>().unwrap_or(0.0)
            }
            RecordValue::IntegerArray(a) => a.first().copied().unwrap_or(0) as f64,
            RecordValue::DoubleArray(a) => a.first().copied().unwrap_or(0.0),
            RecordValue::BinaryFile(_) | RecordValue::ImageJpeg(_) | RecordValue::Any { .. } => 0.0,
        }
    }

    /// Textual coercion. `delim` separates array elements; ignored for
    /// scalars and strings.
    pub fn to_string_delim(&self, delim: &str) -> String {
        match &self.value {
            RecordValue::Empty => String::new(),
            RecordValue::Integer(v) => v.to_string(),
            RecordValue::Double(v) => v.to_string(),
            RecordValue::String(s) | RecordValue::TextFile(s) | RecordValue::Xml(s) => {
                (**s).clone()
            }
            RecordValue::IntegerArray(a) => a
                .iter()
                .map(|v| v.to_string())
                .collect::<Vec<_>>()
                .join(delim),
            RecordValue::DoubleArray(a) => a
                .iter()
                .map(|v| v.to_string())
                .collect::<Vec<_>>()
                .join(delim),
            RecordValue::BinaryFile(b) | RecordValue::ImageJpeg(b) => {
                String::from_utf8_lossy(b).into_owned()
            }
            RecordValue::Any { tag, .. } => format!("<any:{tag}>"),
        }
    }

    pub fn to_integers(&self) -> Vec<i64> {
        match &self.value {
            RecordValue::IntegerArray(a) => (**a).clone(),
            RecordValue::DoubleArray(a) => a.iter().map(|v| *v as i64).collect(),
            RecordValue::Empty => Vec::new(),
            other => vec![Record { value: other.clone(), ..Default::default() }.to_integer()],
        }
    }

    pub fn to_doubles(&self) -> Vec<f64> {
        match &self.value {
            RecordValue::DoubleArray(a) => (**a).clone(),
            RecordValue::IntegerArray(a) => a.iter().map(|v| *v as f64).collect(),
            RecordValue::Empty => Vec::new(),
            other => vec![Record { value: other.clone(), ..Default::default() }.to_double()],
        }
    }

    /// Slice of an array or string into a new record (`first..=last`,
    /// inclusive, clamped to bounds).
    pub fn fragment(&self, first: usize, last: usize) -> Record {
        match &self.value {
            RecordValue::IntegerArray(a) => {
                let end = last.min(a.len().saturating_sub(1));
                if first > end || a.is_empty() {
                    return Record::from_integer_array(Vec::new());
                }
                Record::from_integer_array(a[first..=end].to_vec())
            }
            RecordValue::DoubleArray(a) => {
                let end = last.min(a.len().saturating_sub(1));
                if first > end || a.is_empty() {
                    return Record::from_double_array(Vec::new());
                }
                Record::from_double_array(a[first..=end].to_vec())
            }
            other if other.is_string_like() => {
                let s = self.to_string_delim("");
                let bytes = s.as_bytes();
                let end = last.min(bytes.len().saturating_sub(1));
                if first > end || bytes.is_empty() {
                    return Record::from_string("");
                }
                Record::from_string(String::from_utf8_lossy(&bytes[first..=end]).into_owned())
            }
            _ => Record::new(),
        }
    }

    /// Hand out a cheap shared-ownership clone; a subsequent local mutation
    /// on either handle triggers copy-on-write via `Arc::make_mut`.
    pub fn share(&self) -> Record {
        self.clone()
    }

    fn numeric_add(a: &Record, b: &Record) -> Record {
        if matches!(a.value, RecordValue::Integer(_)) && matches!(b.value, RecordValue::Integer(_)) {
            Record::from_integer(a.to_integer() + b.to_integer())
        } else {
            Record::from_double(a.to_double() + b.to_double())
        }
    }

    /// `+`: string concatenation if either operand is string-like,
    /// otherwise numeric addition with integer/double promotion (§3.1).
    pub fn add(&self, other: &Record) -> Record {
        if self.value.is_string_like() || other.value.is_string_like() {
            Record::from_string(format!("{}{}", self.to_string_delim(","), other.to_string_delim(",")))
        } else {
            Self::numeric_add(self, other)
        }
    }

    fn numeric_binop(a: &Record, b: &Record, int_op: impl Fn(i64, i64) -> i64, dbl_op: impl Fn(f64, f64) -> f64) -> Record {
        if matches!(a.value, RecordValue::Integer(_)) && matches!(b.value, RecordValue::Integer(_)) {
            Record::from_integer(int_op(a.to_integer(), b.to_integer()))
        } else {
            Record::from_double(dbl_op(a.to_double(), b.to_double()))
        }
    }

    pub fn sub(&self, other: &Record) -> Record {
        Self::numeric_binop(self, other, |a, b| a - b, |a, b| a - b)
    }

    pub fn mul(&self, other: &Record) -> Record {
        Self::numeric_binop(self, other, |a, b| a * b, |a, b| a * b)
    }

    /// Division by zero yields the string `"Division by Zero"` rather than
    /// failing (§3.1).
    pub fn div(&self, other: &Record) -> Record {
        if matches!(other.value, RecordValue::Integer(_)) && other.to_integer() == 0 {
            return Record::from_string("Division by Zero");
        }
        if other.to_double() == 0.0 {
            return Record::from_string("Division by Zero");
        }
        Self::numeric_binop(self, other, |a, b| a / b, |a, b| a / b)
    }

    pub fn rem(&self, other: &Record) -> Record {
        if other.to_integer() == 0 {
            return Record::from_string("Division by Zero");
        }
        Self::numeric_binop(self, other, |a, b| a % b, |a, b| a % b)
    }

    /// Comparison following the promotion rules of §3.1: numeric↔numeric
    /// compares as double; anything involving a string compares the
    /// textual form.
    pub fn compare(&self, other: &Record) -> Ordering {
        if self.value.is_string_like() || other.value.is_string_like() {
            self.to_string_delim(",").cmp(&other.to_string_delim(","))
        } else {
            self.to_double().partial_cmp(&other.to_double()).unwrap_or(Ordering::Equal)
        }
    }

    pub fn is_truthy(&self) -> bool {
        match &self.value {
            RecordValue::Empty => false,
            RecordValue::Integer(v) => *v != 0,
            RecordValue::Double(v) => *v != 0.0,
            RecordValue::String(s) | RecordValue::TextFile(s) | RecordValue::Xml(s) => !s.is_empty(),
            RecordValue::IntegerArray(a) => !a.is_empty(),
            RecordValue::DoubleArray(a) => !a.is_empty(),
            RecordValue::BinaryFile(b) | RecordValue::ImageJpeg(b) => !b.is_empty(),
            RecordValue::Any { bytes, .. } => !bytes.is_empty(),
        }
    }

    /// Serialize this record's payload-only wire form (§3.4 "value
    /// bytes"). Scalars are big-endian; strings are raw UTF-8 plus a
    /// trailing NUL; arrays are packed element sequences.
    fn write_payload(&self, out: &mut Vec<u8>) {
        match &self.value {
            RecordValue::Empty => {}
            RecordValue::Integer(v) => out.extend_from_slice(&v.to_be_bytes()),
            RecordValue::Double(v) => out.extend_from_slice(&v.to_be_bytes()),
            RecordValue::String(s) | RecordValue::TextFile(s) | RecordValue::Xml(s) => {
                out.extend_from_slice(s.as_bytes());
                out.push(0);
            }
            RecordValue::IntegerArray(a) => {
                for v in a.iter() {
                    out.extend_from_slice(&v.to_be_bytes());
                }
            }
            RecordValue::DoubleArray(a) => {
                for v in a.iter() {
                    out.extend_from_slice(&v.to_be_bytes());
                }
            }
            RecordValue::BinaryFile(b) | RecordValue::ImageJpeg(b) => out.extend_from_slice(b),
            RecordValue::Any { tag, bytes } => {
                out.extend_from_slice(&tag.to_be_bytes());
                out.extend_from_slice(bytes);
            }
        }
    }

    /// Element count field (`size_`) for the wire record header.
    fn element_count(&self) -> u32 {
        match &self.value {
            RecordValue::Empty => 0,
            RecordValue::Integer(_) | RecordValue::Double(_) => 1,
            RecordValue::String(s) | RecordValue::TextFile(s) | RecordValue::Xml(s) => {
                s.len() as u32 + 1
            }
            RecordValue::IntegerArray(a) => a.len() as u32,
            RecordValue::DoubleArray(a) => a.len() as u32,
            RecordValue::BinaryFile(b) | RecordValue::ImageJpeg(b) => b.len() as u32,
            RecordValue::Any { bytes, .. } => bytes.len() as u32 + 4,
        }
    }

    /// Write this record's wire form (name + type + element count + value
    /// bytes) into `buf`, returning the number of bytes written. Mirrors
    /// `write(buf, remaining)` in §4.1: the caller tracks `remaining`.
    pub fn write(&self, name: &str, buf: &mut Vec<u8>) -> usize {
        let start = buf.len();
        buf.extend_from_slice(&(name.len() as u32).to_be_bytes());
        buf.extend_from_slice(name.as_bytes());
        buf.push(0);
        buf.extend_from_slice(&(self.value.type_tag() as u32).to_be_bytes());
        buf.extend_from_slice(&self.element_count().to_be_bytes());
        self.write_payload(buf);
        buf.len() - start
    }

    /// Read one wire record (name + typed value) from `buf` at `pos`,
    /// returning the record, its name, and the new cursor position.
    pub fn read(buf: &[u8], pos: usize) -> Result<(String, Record, usize)> {
        let mut cur = pos;
        let name_len = read_u32(buf, cur)? as usize;
        cur += 4;
        if cur + name_len + 1 > buf.len() {
            return Err(KnowledgeError::Parse("truncated record name".into()));
        }
        let name = String::from_utf8_lossy(&buf[cur..cur + name_len]).into_owned();
        cur += name_len + 1; // skip trailing NUL

        let type_tag = TypeTag::from_u32(read_u32(buf, cur)?)?;
        cur += 4;
        let count = read_u32(buf, cur)? as usize;
        cur += 4;

        let (value, consumed) = match type_tag {
            TypeTag::Empty => (RecordValue::Empty, 0),
            TypeTag::Integer => (RecordValue::Integer(read_i64(buf, cur)?), 8),
            TypeTag::Double => (RecordValue::Double(read_f64(buf, cur)?), 8),
            TypeTag::String | TypeTag::TextFile | TypeTag::Xml => {
                let len = count.saturating_sub(1);
                if cur + len + 1 > buf.len() {
                    return Err(KnowledgeError::Parse("truncated string payload".into()));
                }
                let s = String::from_utf8_lossy(&buf[cur..cur + len]).into_owned();
                let v = match type_tag {
                    TypeTag::String => RecordValue::String(Arc::new(s)),
                    TypeTag::TextFile => RecordValue::TextFile(Arc::new(s)),
                    _ => RecordValue::Xml(Arc::new(s)),
                };
                (v, len + 1)
            }
            TypeTag::IntegerArray => {
                let mut arr = Vec::with_capacity(count);
                for i in 0..count {
                    arr.push(read_i64(buf, cur + i * 8)?);
                }
                (RecordValue::IntegerArray(Arc::new(arr)), count * 8)
            }
            TypeTag::DoubleArray => {
                let mut arr = Vec::with_capacity(count);
                for i in 0..count {
                    arr.push(read_f64(buf, cur + i * 8)?);
                }
                (RecordValue::DoubleArray(Arc::new(arr)), count * 8)
            }
            TypeTag::BinaryFile | TypeTag::ImageJpeg => {
                if cur + count > buf.len() {
                    return Err(KnowledgeError::Parse("truncated blob payload".into()));
                }
                let bytes = buf[cur..cur + count].to_vec();
                let v = if matches!(type_tag, TypeTag::BinaryFile) {
                    RecordValue::BinaryFile(Arc::new(bytes))
                } else {
                    RecordValue::ImageJpeg(Arc::new(bytes))
                };
                (v, count)
            }
            TypeTag::Any => {
                if count < 4 || cur + count > buf.len() {
                    return Err(KnowledgeError::Parse("truncated any payload".into()));
                }
                let tag = read_u32(buf, cur)?;
                let bytes = buf[cur + 4..cur + count].to_vec();
                (RecordValue::Any { tag, bytes: Arc::new(bytes) }, count)
            }
        };
        cur += consumed;

        Ok((
            name,
            Record { value, clock: 0, quality: 0, write_quality: 0, status: Status::Modified },
            cur,
        ))
    }
}

fn read_u32(buf: &[u8], pos: usize) -> Result<u32> {
    buf.get(pos..pos + 4)
        .and_then(|s| s.try_into().ok())
        .map(u32::from_be_bytes)
        .ok_or_else(|| KnowledgeError::Parse("truncated u32".into()))
}

fn read_i64(buf: &[u8], pos: usize) -> Result<i64> {
    buf.get(pos..pos + 8)
        .and_then(|s| s.try_into().ok())
        .map(i64::from_be_bytes)
        .ok_or_else(|| KnowledgeError::Parse("truncated i64".into()))
}

fn read_f64(buf: &[u8], pos: usize) -> Result<f64> {
    buf.get(pos..pos + 8)
        .and_then(|s| s.try_into().ok())
        .map(f64::from_be_bytes)
        .ok_or_else(|| KnowledgeError::Parse("truncated f64".into()))
}
