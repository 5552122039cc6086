//! Raw database values.

use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// A raw value stored at a database location.
///
/// Absence of a value (`Option::None` wherever a value is expected) means the
/// location is deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DatabaseValue {
    /// Boolean value.
    Bool(bool),
    /// Signed integer.
    Int(i64),
    /// Unsigned integer above the signed range.
    UInt(u64),
    /// Floating point number.
    Float(f64),
    /// UTF-8 text.
    Text(String),
    /// Binary data.
    Bytes(Vec<u8>),
    /// Two values stored together.
    Pair(Box<DatabaseValue>, Box<DatabaseValue>),
    /// Ordered list of values.
    List(Vec<DatabaseValue>),
    /// Nested object keyed by child key.
    Map(BTreeMap<String, DatabaseValue>),
}

impl DatabaseValue {
    /// Creates an empty map.
    pub fn empty_map() -> Self {
        DatabaseValue::Map(BTreeMap::new())
    }

    /// Returns the value as a bool.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            DatabaseValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Returns the value as a signed integer if it fits.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            DatabaseValue::Int(n) => Some(*n),
            DatabaseValue::UInt(n) => i64::try_from(*n).ok(),
            _ => None,
        }
    }

    /// Returns the value as a float. Integers are converted.
    #[allow(clippy::cast_precision_loss)]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            DatabaseValue::Float(f) => Some(*f),
            DatabaseValue::Int(n) => Some(*n as f64),
            DatabaseValue::UInt(n) => Some(*n as f64),
            _ => None,
        }
    }

    /// Returns the value as text.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            DatabaseValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the value as bytes.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            DatabaseValue::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Returns the value as a list.
    pub fn as_list(&self) -> Option<&[DatabaseValue]> {
        match self {
            DatabaseValue::List(l) => Some(l),
            _ => None,
        }
    }

    /// Returns the value as a map.
    pub fn as_map(&self) -> Option<&BTreeMap<String, DatabaseValue>> {
        match self {
            DatabaseValue::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Looks up a direct child of a map value.
    pub fn get(&self, key: &str) -> Option<&DatabaseValue> {
        self.as_map().and_then(|m| m.get(key))
    }

    /// Looks up a nested child by `/`-separated path.
    pub fn get_path(&self, path: &str) -> Option<&DatabaseValue> {
        path.split('/')
            .filter(|s| !s.is_empty())
            .try_fold(self, |value, key| value.get(key))
    }

    fn rank(&self) -> u8 {
        match self {
            DatabaseValue::Bool(_) => 0,
            DatabaseValue::Int(_) | DatabaseValue::UInt(_) | DatabaseValue::Float(_) => 1,
            DatabaseValue::Text(_) => 2,
            DatabaseValue::Bytes(_) => 3,
            DatabaseValue::Pair(..) => 4,
            DatabaseValue::List(_) => 5,
            DatabaseValue::Map(_) => 6,
        }
    }

    /// Total ordering used by value-ordered queries.
    ///
    /// Kinds order as bool < number < text < bytes < pair < list < map.
    pub fn compare(&self, other: &Self) -> Ordering {
        let (a, b) = (self.rank(), other.rank());
        if a != b {
            return a.cmp(&b);
        }
        match (self, other) {
            (DatabaseValue::Bool(a), DatabaseValue::Bool(b)) => a.cmp(b),
            (DatabaseValue::Int(a), DatabaseValue::Int(b)) => a.cmp(b),
            (DatabaseValue::UInt(a), DatabaseValue::UInt(b)) => a.cmp(b),
            (DatabaseValue::Int(a), DatabaseValue::UInt(b)) => compare_signed(*a, *b),
            (DatabaseValue::UInt(a), DatabaseValue::Int(b)) => compare_signed(*b, *a).reverse(),
            (DatabaseValue::Text(a), DatabaseValue::Text(b)) => a.cmp(b),
            (DatabaseValue::Bytes(a), DatabaseValue::Bytes(b)) => a.cmp(b),
            (DatabaseValue::Pair(a1, a2), DatabaseValue::Pair(b1, b2)) => {
                a1.compare(b1).then_with(|| a2.compare(b2))
            }
            (DatabaseValue::List(a), DatabaseValue::List(b)) => compare_iter(a.iter(), b.iter()),
            (DatabaseValue::Map(a), DatabaseValue::Map(b)) => {
                let mut left = a.iter();
                let mut right = b.iter();
                loop {
                    match (left.next(), right.next()) {
                        (Some((ka, va)), Some((kb, vb))) => {
                            match ka.cmp(kb).then_with(|| va.compare(vb)) {
                                Ordering::Equal => continue,
                                ord => return ord,
                            }
                        }
                        (None, None) => return Ordering::Equal,
                        (None, Some(_)) => return Ordering::Less,
                        (Some(_), None) => return Ordering::Greater,
                    }
                }
            }
            _ => {
                let a = self.as_f64().unwrap_or(f64::NAN);
                let b = other.as_f64().unwrap_or(f64::NAN);
                a.total_cmp(&b)
            }
        }
    }

    /// Encodes the value to CBOR.
    pub fn to_cbor(&self) -> CoreResult<Vec<u8>> {
        let mut out = Vec::new();
        ciborium::ser::into_writer(self, &mut out).map_err(|e| CoreError::encoding(e.to_string()))?;
        Ok(out)
    }

    /// Decodes a value from CBOR.
    pub fn from_cbor(bytes: &[u8]) -> CoreResult<Self> {
        ciborium::de::from_reader(bytes).map_err(|e| CoreError::decoding("", e.to_string()))
    }
}

fn compare_signed(a: i64, b: u64) -> Ordering {
    match u64::try_from(a) {
        Ok(a) => a.cmp(&b),
        Err(_) => Ordering::Less,
    }
}

fn compare_iter<'a>(
    mut a: impl Iterator<Item = &'a DatabaseValue>,
    mut b: impl Iterator<Item = &'a DatabaseValue>,
) -> Ordering {
    loop {
        match (a.next(), b.next()) {
            (Some(x), Some(y)) => match x.compare(y) {
                Ordering::Equal => continue,
                ord => return ord,
            },
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
        }
    }
}

impl From<bool> for DatabaseValue {
    fn from(b: bool) -> Self {
        DatabaseValue::Bool(b)
    }
}

impl From<i64> for DatabaseValue {
    fn from(n: i64) -> Self {
        DatabaseValue::Int(n)
    }
}

impl From<i32> for DatabaseValue {
    fn from(n: i32) -> Self {
        DatabaseValue::Int(i64::from(n))
    }
}

impl From<u32> for DatabaseValue {
    fn from(n: u32) -> Self {
        DatabaseValue::Int(i64::from(n))
    }
}

impl From<u64> for DatabaseValue {
    fn from(n: u64) -> Self {
        match i64::try_from(n) {
            Ok(n) => DatabaseValue::Int(n),
            Err(_) => DatabaseValue::UInt(n),
        }
    }
}

impl From<f64> for DatabaseValue {
    fn from(f: f64) -> Self {
        DatabaseValue::Float(f)
    }
}

impl From<String> for DatabaseValue {
    fn from(s: String) -> Self {
        DatabaseValue::Text(s)
    }
}

impl From<&str> for DatabaseValue {
    fn from(s: &str) -> Self {
        DatabaseValue::Text(s.to_string())
    }
}

impl From<Vec<u8>> for DatabaseValue {
    fn from(b: Vec<u8>) -> Self {
        DatabaseValue::Bytes(b)
    }
}

impl From<Vec<DatabaseValue>> for DatabaseValue {
    fn from(v: Vec<DatabaseValue>) -> Self {
        DatabaseValue::List(v)
    }
}

impl From<BTreeMap<String, DatabaseValue>> for DatabaseValue {
    fn from(m: BTreeMap<String, DatabaseValue>) -> Self {
        DatabaseValue::Map(m)
    }
}

impl<A: Into<DatabaseValue>, B: Into<DatabaseValue>> From<(A, B)> for DatabaseValue {
    fn from((a, b): (A, B)) -> Self {
        DatabaseValue::Pair(Box::new(a.into()), Box::new(b.into()))
    }
}
