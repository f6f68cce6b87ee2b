//! Wire-level data types and small buffer-reading helpers.

use bytes::{Buf, BytesMut};

use crate::errors::Error;

/// PostgreSQL column types used when synthesizing `RowDescription` messages
/// for admin/control responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    Text,
    Int4,
    Numeric,
    Bool,
    Oid,
    AnyArray,
    Any,
}

impl From<&DataType> for i32 {
    fn from(data_type: &DataType) -> i32 {
        match data_type {
            DataType::Text => 25,
            DataType::Int4 => 23,
            DataType::Numeric => 1700,
            DataType::Bool => 16,
            DataType::Oid => 26,
            DataType::AnyArray => 2277,
            DataType::Any => 2276,
        }
    }
}

/// Render a vector of displayable values as a comma-separated string,
/// used by a handful of `SHOW` commands to flatten list-valued columns.
pub fn vec_to_string<T: std::fmt::Display>(values: &[T]) -> String {
    values
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<String>>()
        .join(", ")
}

/// Extension trait for reading null-terminated C-strings out of a `BytesMut`
/// cursor, mirroring the way the wire protocol encodes names and query text.
pub trait BytesMutReader {
    fn read_string(&mut self) -> Result<String, Error>;
}

impl BytesMutReader for BytesMut {
    fn read_string(&mut self) -> Result<String, Error> {
        let nul = self
            .iter()
            .position(|b| *b == 0)
            .ok_or_else(|| Error::ProtocolSyncError("missing null terminator".into()))?;
        let bytes = self.split_to(nul);
        self.advance(1); // skip the null terminator
        String::from_utf8(bytes.to_vec())
            .map_err(|err| Error::ProtocolSyncError(format!("invalid utf8 in string: {err}")))
    }
}
