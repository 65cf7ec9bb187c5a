//! Column values decoded from record payloads.

use crate::error::{CoreError, CoreResult};
use crate::repair::deserialize::Deserializer;
use rusqlite::types::{ToSqlOutput, ValueRef};
use rusqlite::ToSql;

/// A single decoded column value.
///
/// Text keeps its raw bytes: corrupted pages may hold invalid UTF-8 and the
/// bytes are written back to the engine unchanged.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// SQL NULL.
    Null,
    /// 64-bit signed integer.
    Integer(i64),
    /// IEEE 754 double.
    Real(f64),
    /// Text in the database encoding.
    Text(Vec<u8>),
    /// Raw bytes.
    Blob(Vec<u8>),
}

impl Value {
    /// Returns the integer, if this is one.
    #[must_use]
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Self::Integer(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the text as a string, if this is valid UTF-8 text.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(bytes) => std::str::from_utf8(bytes).ok(),
            _ => None,
        }
    }
}

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::Borrowed(match self {
            Self::Null => ValueRef::Null,
            Self::Integer(v) => ValueRef::Integer(*v),
            Self::Real(v) => ValueRef::Real(*v),
            Self::Text(bytes) => ValueRef::Text(bytes),
            Self::Blob(bytes) => ValueRef::Blob(bytes),
        }))
    }
}

/// Storage class of a record column, derived from its serial type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SerialType {
    /// Type 0.
    Null,
    /// Types 1..=6 with their byte width.
    Integer(usize),
    /// Type 7.
    Real,
    /// Types 8 and 9.
    Constant(i64),
    /// Even types >= 12.
    Blob(usize),
    /// Odd types >= 13.
    Text(usize),
}

impl SerialType {
    /// Interprets a raw serial type code.
    ///
    /// # Errors
    ///
    /// Returns a corruption error for the reserved codes 10 and 11.
    pub fn from_code(code: u64) -> CoreResult<Self> {
        Ok(match code {
            0 => Self::Null,
            1..=4 => Self::Integer(code as usize),
            5 => Self::Integer(6),
            6 => Self::Integer(8),
            7 => Self::Real,
            8 => Self::Constant(0),
            9 => Self::Constant(1),
            10 | 11 => {
                return Err(CoreError::corruption(format!(
                    "reserved serial type {code}"
                )))
            }
            n if n % 2 == 0 => Self::Blob(((n - 12) / 2) as usize),
            n => Self::Text(((n - 13) / 2) as usize),
        })
    }

    /// Returns the number of payload bytes this column occupies.
    #[must_use]
    pub fn size(self) -> usize {
        match self {
            Self::Null | Self::Constant(_) => 0,
            Self::Integer(width) => width,
            Self::Real => 8,
            Self::Blob(len) | Self::Text(len) => len,
        }
    }

    /// Reads one value of this type.
    ///
    /// # Errors
    ///
    /// Returns a corruption error if the reader runs out of bytes.
    pub fn read(self, reader: &mut Deserializer<'_>) -> CoreResult<Value> {
        Ok(match self {
            Self::Null => Value::Null,
            Self::Constant(v) => Value::Integer(v),
            Self::Integer(width) => Value::Integer(reader.read_int(width)?),
            Self::Real => Value::Real(reader.read_f64()?),
            Self::Blob(len) => Value::Blob(reader.read_bytes(len)?.to_vec()),
            Self::Text(len) => Value::Text(reader.read_bytes(len)?.to_vec()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serial_type_sizes() {
        let sizes: Vec<usize> = [0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 12, 13, 18, 19]
            .iter()
            .map(|&c| SerialType::from_code(c).unwrap().size())
            .collect();
        assert_eq!(sizes, vec![0, 1, 2, 3, 4, 6, 8, 8, 0, 0, 0, 0, 3, 3]);
    }

    #[test]
    fn reserved_serial_types_are_corruption() {
        assert!(SerialType::from_code(10).is_err());
        assert!(SerialType::from_code(11).is_err());
    }

    #[test]
    fn read_constants_and_text() {
        let mut reader = Deserializer::new(b"abc");
        assert_eq!(
            SerialType::from_code(9).unwrap().read(&mut reader).unwrap(),
            Value::Integer(1)
        );
        let text = SerialType::from_code(19).unwrap().read(&mut reader).unwrap();
        assert_eq!(text.as_text(), Some("abc"));
    }

    #[test]
    fn value_binds_raw_text() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        let value = Value::Text(b"hi".to_vec());
        let back: String = conn
            .query_row("SELECT ?1", [&value], |row| row.get(0))
            .unwrap();
        assert_eq!(back, "hi");
    }
}
