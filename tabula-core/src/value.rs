//! Dynamically typed cell values and column data types

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Declared element type of a column or expression
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    /// 64-bit signed integer
    Integer,

    /// 64-bit floating point
    Float,

    /// UTF-8 string
    String,

    /// Opaque byte vector
    Bytes,

    /// Recursive list of values
    List,

    /// Key/value map, kept in insertion order
    Dict,

    /// Point in time with optional UTC offset
    DateTime,

    /// Dense n-dimensional numeric array
    NdArray,

    /// Any value; per-value type tags are stored
    Dynamic,
}

impl DataType {
    /// Stable tag written into block headers and index files
    pub fn tag(self) -> u8 {
        match self {
            DataType::Integer => 0,
            DataType::Float => 1,
            DataType::String => 2,
            DataType::Bytes => 3,
            DataType::List => 4,
            DataType::Dict => 5,
            DataType::DateTime => 6,
            DataType::NdArray => 7,
            DataType::Dynamic => 8,
        }
    }

    /// Inverse of [`DataType::tag`]
    pub fn from_tag(tag: u8) -> Option<Self> {
        Some(match tag {
            0 => DataType::Integer,
            1 => DataType::Float,
            2 => DataType::String,
            3 => DataType::Bytes,
            4 => DataType::List,
            5 => DataType::Dict,
            6 => DataType::DateTime,
            7 => DataType::NdArray,
            8 => DataType::Dynamic,
            _ => return None,
        })
    }

    /// Check if this type is numeric
    pub fn is_numeric(self) -> bool {
        matches!(self, DataType::Integer | DataType::Float)
    }

    /// Whether a value may be stored in a column of this type without conversion
    /// (missing is always accepted)
    pub fn accepts(self, value: &Value) -> bool {
        match (self, value.data_type()) {
            (_, None) => true,
            (DataType::Dynamic, _) => true,
            (DataType::Float, Some(DataType::Integer)) => true,
            (expected, Some(actual)) => expected == actual,
        }
    }

    /// Convert a value into the representation stored by this type.
    ///
    /// Integers widen into float columns; everything else must already match.
    pub fn coerce(self, value: Value) -> Result<Value> {
        match (self, value) {
            (DataType::Float, Value::Integer(i)) => Ok(Value::Float(i as f64)),
            (ty, value) if ty.accepts(&value) => Ok(value),
            (ty, value) => Err(Error::type_mismatch(&ty, value.type_name())),
        }
    }

    /// The common type of two branches (used by unions and expressions)
    pub fn unify(self, other: DataType) -> DataType {
        match (self, other) {
            (a, b) if a == b => a,
            (DataType::Integer, DataType::Float) | (DataType::Float, DataType::Integer) => {
                DataType::Float
            }
            _ => DataType::Dynamic,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataType::Integer => "Integer",
            DataType::Float => "Float",
            DataType::String => "String",
            DataType::Bytes => "Bytes",
            DataType::List => "List",
            DataType::Dict => "Dict",
            DataType::DateTime => "DateTime",
            DataType::NdArray => "NdArray",
            DataType::Dynamic => "Dynamic",
        };
        f.write_str(name)
    }
}

/// Microsecond-precision timestamp with an optional UTC offset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DateTime {
    /// Microseconds since the UNIX epoch (UTC)
    pub micros: i64,

    /// Offset from UTC in minutes, if known
    pub utc_offset_minutes: Option<i16>,
}

impl DateTime {
    /// Create a UTC timestamp
    pub fn from_micros(micros: i64) -> Self {
        Self {
            micros,
            utc_offset_minutes: None,
        }
    }
}

/// Dense row-major n-dimensional array of f64
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NdArray {
    shape: Vec<usize>,
    data: Vec<f64>,
}

impl NdArray {
    /// Create an array, checking that the shape covers the data exactly
    pub fn new(shape: Vec<usize>, data: Vec<f64>) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(Error::InvalidArgument(format!(
                "shape {:?} requires {} elements, got {}",
                shape,
                expected,
                data.len()
            )));
        }
        Ok(Self { shape, data })
    }

    /// One-dimensional array
    pub fn vector(data: Vec<f64>) -> Self {
        Self {
            shape: vec![data.len()],
            data,
        }
    }

    /// Array dimensions
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Flat row-major data
    pub fn data(&self) -> &[f64] {
        &self.data
    }

    fn cmp_total(&self, other: &Self) -> Ordering {
        self.shape.cmp(&other.shape).then_with(|| {
            for (a, b) in self.data.iter().zip(&other.data) {
                match a.total_cmp(b) {
                    Ordering::Equal => continue,
                    ord => return ord,
                }
            }
            self.data.len().cmp(&other.data.len())
        })
    }
}

/// A single cell value
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub enum Value {
    /// Explicit missing marker
    #[default]
    Missing,

    /// 64-bit signed integer
    Integer(i64),

    /// 64-bit float
    Float(f64),

    /// UTF-8 string
    String(String),

    /// Byte vector
    Bytes(Vec<u8>),

    /// Nested list
    List(Vec<Value>),

    /// Key/value pairs
    Dict(Vec<(Value, Value)>),

    /// Timestamp
    DateTime(DateTime),

    /// Numeric n-dimensional array
    NdArray(NdArray),
}

impl Value {
    /// Type of this value, `None` for missing
    pub fn data_type(&self) -> Option<DataType> {
        Some(match self {
            Value::Missing => return None,
            Value::Integer(_) => DataType::Integer,
            Value::Float(_) => DataType::Float,
            Value::String(_) => DataType::String,
            Value::Bytes(_) => DataType::Bytes,
            Value::List(_) => DataType::List,
            Value::Dict(_) => DataType::Dict,
            Value::DateTime(_) => DataType::DateTime,
            Value::NdArray(_) => DataType::NdArray,
        })
    }

    /// Human readable type name, used in error messages
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Missing => "Missing",
            Value::Integer(_) => "Integer",
            Value::Float(_) => "Float",
            Value::String(_) => "String",
            Value::Bytes(_) => "Bytes",
            Value::List(_) => "List",
            Value::Dict(_) => "Dict",
            Value::DateTime(_) => "DateTime",
            Value::NdArray(_) => "NdArray",
        }
    }

    /// Check if this value is the missing marker
    pub fn is_missing(&self) -> bool {
        matches!(self, Value::Missing)
    }

    /// Integer payload, if any
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Numeric payload as f64 (integers widen)
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Integer(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// String payload, if any
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Truthiness used by filters: non-zero numbers and non-empty containers
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Missing => false,
            Value::Integer(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::String(s) => !s.is_empty(),
            Value::Bytes(b) => !b.is_empty(),
            Value::List(l) => !l.is_empty(),
            Value::Dict(d) => !d.is_empty(),
            Value::DateTime(_) => true,
            Value::NdArray(a) => !a.data.is_empty(),
        }
    }

    /// Approximate heap + inline footprint in bytes
    pub fn estimated_size(&self) -> usize {
        let inline = std::mem::size_of::<Value>();
        inline
            + match self {
                Value::String(s) => s.len(),
                Value::Bytes(b) => b.len(),
                Value::List(l) => l.iter().map(Value::estimated_size).sum(),
                Value::Dict(d) => d
                    .iter()
                    .map(|(k, v)| k.estimated_size() + v.estimated_size())
                    .sum(),
                Value::NdArray(a) => a.data.len() * 8 + a.shape.len() * 8,
                _ => 0,
            }
    }

    fn rank(&self) -> u8 {
        match self {
            Value::Missing => 0,
            Value::Integer(_) => 1,
            Value::Float(_) => 2,
            Value::String(_) => 3,
            Value::Bytes(_) => 4,
            Value::List(_) => 5,
            Value::Dict(_) => 6,
            Value::DateTime(_) => 7,
            Value::NdArray(_) => 8,
        }
    }
}

// Equality, ordering and hashing are total so values can key hash tables and
// sort deterministically. Floats compare by `total_cmp`, so NaN == NaN.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Value::Missing, Value::Missing) => Ordering::Equal,
            (Value::Integer(a), Value::Integer(b)) => a.cmp(b),
            (Value::Float(a), Value::Float(b)) => a.total_cmp(b),
            (Value::String(a), Value::String(b)) => a.cmp(b),
            (Value::Bytes(a), Value::Bytes(b)) => a.cmp(b),
            (Value::List(a), Value::List(b)) => a.cmp(b),
            (Value::Dict(a), Value::Dict(b)) => a.cmp(b),
            (Value::DateTime(a), Value::DateTime(b)) => a.cmp(b),
            (Value::NdArray(a), Value::NdArray(b)) => a.cmp_total(b),
            (a, b) => a.rank().cmp(&b.rank()),
        }
    }
}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.rank().hash(state);
        match self {
            Value::Missing => {}
            Value::Integer(i) => i.hash(state),
            Value::Float(f) => f.to_bits().hash(state),
            Value::String(s) => s.hash(state),
            Value::Bytes(b) => b.hash(state),
            Value::List(l) => l.hash(state),
            Value::Dict(d) => d.hash(state),
            Value::DateTime(d) => d.hash(state),
            Value::NdArray(a) => {
                a.shape.hash(state);
                for x in &a.data {
                    x.to_bits().hash(state);
                }
            }
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Missing => write!(f, "None"),
            Value::Integer(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::String(s) => write!(f, "{:?}", s),
            Value::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Value::Dict(pairs) => {
                write!(f, "{{")?;
                for (i, (k, v)) in pairs.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", k, v)?;
                }
                write!(f, "}}")
            }
            Value::DateTime(dt) => write!(f, "@{}us", dt.micros),
            Value::NdArray(a) => write!(f, "NdArray{:?}", a.shape),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Missing, Into::into)
    }
}
