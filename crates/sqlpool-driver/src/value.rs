//! Parameter values and result rows.

use std::sync::Arc;

use bytes::Bytes;

use crate::error::DriverError;

/// A database value, used both for bound parameters and result columns.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    /// SQL NULL.
    Null,
    /// Boolean value.
    Bool(bool),
    /// Integer value (all integer widths widen to 64 bits).
    Int(i64),
    /// Floating point value.
    Float(f64),
    /// Character data.
    Text(String),
    /// Binary data.
    Bytes(Bytes),
}

/// 2^63 as a float, the exclusive upper bound of `i64`.
const I64_BOUND: f64 = 9_223_372_036_854_775_808.0;

impl SqlValue {
    /// Check whether this value is SQL NULL.
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Coerce the value to a 64-bit integer.
    ///
    /// Returns `Ok(None)` for NULL. Text is parsed, floats must be integral.
    pub fn to_i64(&self) -> Result<Option<i64>, DriverError> {
        match self {
            Self::Null => Ok(None),
            Self::Int(v) => Ok(Some(*v)),
            Self::Bool(b) => Ok(Some(i64::from(*b))),
            // 2^63 is exactly representable; the cast is lossless inside this range
            Self::Float(f) if f.fract() == 0.0 && (-I64_BOUND..I64_BOUND).contains(f) => {
                Ok(Some(*f as i64))
            }
            Self::Float(f) => Err(DriverError::Type {
                expected: "integer",
                actual: format!("float {f}"),
            }),
            Self::Text(s) => s.trim().parse().map(Some).map_err(|_| DriverError::Type {
                expected: "integer",
                actual: format!("text '{s}'"),
            }),
            other => Err(DriverError::Type {
                expected: "integer",
                actual: other.type_name().to_string(),
            }),
        }
    }

    /// Short name of the value's variant, for diagnostics.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Text(_) => "text",
            Self::Bytes(_) => "bytes",
        }
    }
}

macro_rules! impl_from_int {
    ($($t:ty),*) => {
        $(
            impl From<$t> for SqlValue {
                fn from(v: $t) -> Self {
                    Self::Int(i64::from(v))
                }
            }
        )*
    };
}

impl_from_int!(i8, i16, i32, i64, u8, u16, u32);

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<Bytes> for SqlValue {
    fn from(v: Bytes) -> Self {
        Self::Bytes(v)
    }
}

impl From<Vec<u8>> for SqlValue {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(Bytes::from(v))
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

/// A row produced by a [`ResultCursor`](crate::ResultCursor).
///
/// Column names are shared between all rows of one cursor.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Arc<[String]>,
    values: Vec<SqlValue>,
}

impl Row {
    /// Create a new row from shared column names and values.
    pub fn new(columns: Arc<[String]>, values: Vec<SqlValue>) -> Self {
        Self { columns, values }
    }

    /// Column names.
    #[must_use]
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Number of values in the row.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the row has no values.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Get a value by zero-based index.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&SqlValue> {
        self.values.get(index)
    }

    /// Get a value by column name (case-insensitive).
    pub fn get_by_name(&self, name: &str) -> Result<&SqlValue, DriverError> {
        self.columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(name))
            .and_then(|index| self.values.get(index))
            .ok_or_else(|| DriverError::Column(name.to_string()))
    }

    /// Consume the row, returning its values.
    #[must_use]
    pub fn into_values(self) -> Vec<SqlValue> {
        self.values
    }
}
