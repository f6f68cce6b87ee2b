//! Extended query protocol messages (`Parse`/`Bind`/`Describe`/`Close`) and the
//! rewriting helpers the prepared-statement cache uses to rename a client's
//! statement to whatever name it was registered under on the server.

use bytes::{Buf, BufMut, BytesMut};
use std::hash::{Hash, Hasher};

use crate::errors::Error;
use crate::messages::types::BytesMutReader;

/// A parsed `Parse` ('P') message: a prepared statement name, its query text
/// and the parameter type OIDs the client declared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Parse {
    pub name: String,
    pub query: String,
    pub param_types: Vec<i32>,
}

impl Parse {
    /// Reads just the statement name out of a raw `Parse` message, without
    /// allocating the rest of the struct.
    pub fn get_name(message: &BytesMut) -> Result<String, Error> {
        let mut cursor = message.clone();
        cursor.advance(5); // message type + length
        cursor.read_string()
    }

    /// Hash of the query text and parameter types, used as the pool-wide LRU key.
    pub fn get_hash(&self) -> u64 {
        let mut hasher = ahash::AHasher::default();
        self.query.hash(&mut hasher);
        self.param_types.hash(&mut hasher);
        hasher.finish()
    }

    /// Re-serializes this `Parse` under a different statement name, as used
    /// when registering it on the server under its pool-assigned name.
    pub fn to_bytes_with_name(&self, name: &str) -> Result<BytesMut, Error> {
        let mut payload = BytesMut::new();
        payload.put_slice(name.as_bytes());
        payload.put_u8(0);
        payload.put_slice(self.query.as_bytes());
        payload.put_u8(0);
        payload.put_i16(self.param_types.len() as i16);
        for oid in &self.param_types {
            payload.put_i32(*oid);
        }

        let mut message = BytesMut::new();
        message.put_u8(b'P');
        message.put_i32(payload.len() as i32 + 4);
        message.put(payload);
        Ok(message)
    }
}

impl TryFrom<&BytesMut> for Parse {
    type Error = Error;

    fn try_from(message: &BytesMut) -> Result<Self, Self::Error> {
        let mut cursor = message.clone();
        cursor.advance(5); // message type + length

        let name = cursor.read_string()?;
        let query = cursor.read_string()?;

        if cursor.remaining() < 2 {
            return Err(Error::ProtocolSyncError("truncated Parse message".into()));
        }
        let num_params = cursor.get_i16();
        let mut param_types = Vec::with_capacity(num_params.max(0) as usize);
        for _ in 0..num_params {
            if cursor.remaining() < 4 {
                return Err(Error::ProtocolSyncError("truncated Parse message".into()));
            }
            param_types.push(cursor.get_i32());
        }

        Ok(Parse {
            name,
            query,
            param_types,
        })
    }
}

impl TryFrom<&Parse> for BytesMut {
    type Error = Error;

    fn try_from(parse: &Parse) -> Result<Self, Self::Error> {
        parse.to_bytes_with_name(&parse.name)
    }
}

/// A parsed `Bind` ('B') message. Only the portal/statement names are
/// inspected; the rest of the payload (parameter formats/values) is left
/// untouched and simply re-spliced after the rewritten names.
#[derive(Debug, Clone)]
pub struct Bind {
    pub portal: String,
    pub statement_name: String,
}

impl Bind {
    /// Reads the bound statement name (the second of the two leading
    /// C-strings) out of a raw `Bind` message.
    pub fn get_name(message: &BytesMut) -> Result<String, Error> {
        let mut cursor = message.clone();
        cursor.advance(5); // message type + length
        let _portal = cursor.read_string()?;
        cursor.read_string()
    }

    /// Rewrites the statement name embedded in a raw `Bind` message in place,
    /// leaving the portal name and all remaining bytes untouched.
    pub fn rename(message: BytesMut, server_name: &str) -> Result<BytesMut, Error> {
        let mut cursor = message.clone();
        cursor.advance(5);
        let portal = cursor.read_string()?;
        let _old_name = cursor.read_string()?;
        let remainder = cursor;

        let mut payload = BytesMut::new();
        payload.put_slice(portal.as_bytes());
        payload.put_u8(0);
        payload.put_slice(server_name.as_bytes());
        payload.put_u8(0);
        payload.put(remainder);

        let mut new_message = BytesMut::new();
        new_message.put_u8(b'B');
        new_message.put_i32(payload.len() as i32 + 4);
        new_message.put(payload);
        Ok(new_message)
    }
}

/// A parsed `Describe` ('D') message: `target` is `'S'` for a prepared
/// statement or `'P'` for a portal.
#[derive(Debug, Clone)]
pub struct Describe {
    pub target: char,
    pub statement_name: String,
}

impl Describe {
    /// Returns a copy of this `Describe` with the statement name replaced.
    /// Portal describes are never renamed, so this only makes sense for
    /// statement (`'S'`) targets.
    pub fn rename(&self, server_name: &str) -> Describe {
        Describe {
            target: self.target,
            statement_name: server_name.to_string(),
        }
    }
}

impl TryFrom<&BytesMut> for Describe {
    type Error = Error;

    fn try_from(message: &BytesMut) -> Result<Self, Self::Error> {
        let mut cursor = message.clone();
        cursor.advance(5); // message type + length
        if cursor.remaining() < 1 {
            return Err(Error::ProtocolSyncError("truncated Describe message".into()));
        }
        let target = cursor.get_u8() as char;
        let statement_name = cursor.read_string()?;
        Ok(Describe {
            target,
            statement_name,
        })
    }
}

impl TryFrom<Describe> for BytesMut {
    type Error = Error;

    fn try_from(describe: Describe) -> Result<Self, Self::Error> {
        let mut payload = BytesMut::new();
        payload.put_u8(describe.target as u8);
        payload.put_slice(describe.statement_name.as_bytes());
        payload.put_u8(0);

        let mut message = BytesMut::new();
        message.put_u8(b'D');
        message.put_i32(payload.len() as i32 + 4);
        message.put(payload);
        Ok(message)
    }
}

/// A parsed `Close` ('C') message: `target` is `'S'` for a prepared
/// statement or `'P'` for a portal.
#[derive(Debug, Clone)]
pub struct Close {
    pub target: char,
    pub name: String,
}

impl Close {
    /// Builds a synthetic `Close` for a prepared statement name, used to
    /// evict a statement from the server when the local LRU cache drops it.
    pub fn new(name: &str) -> Close {
        Close {
            target: 'S',
            name: name.to_string(),
        }
    }

    pub fn is_prepared_statement(&self) -> bool {
        self.target == 'S'
    }

    pub fn anonymous(&self) -> bool {
        self.name.is_empty()
    }
}

impl TryFrom<&BytesMut> for Close {
    type Error = Error;

    fn try_from(message: &BytesMut) -> Result<Self, Self::Error> {
        let mut cursor = message.clone();
        cursor.advance(5); // message type + length
        if cursor.remaining() < 1 {
            return Err(Error::ProtocolSyncError("truncated Close message".into()));
        }
        let target = cursor.get_u8() as char;
        let name = cursor.read_string()?;
        Ok(Close { target, name })
    }
}

impl TryFrom<&Close> for BytesMut {
    type Error = Error;

    fn try_from(close: &Close) -> Result<Self, Self::Error> {
        let mut payload = BytesMut::new();
        payload.put_u8(close.target as u8);
        payload.put_slice(close.name.as_bytes());
        payload.put_u8(0);

        let mut message = BytesMut::new();
        message.put_u8(b'C');
        message.put_i32(payload.len() as i32 + 4);
        message.put(payload);
        Ok(message)
    }
}

impl TryFrom<Close> for BytesMut {
    type Error = Error;

    fn try_from(close: Close) -> Result<Self, Self::Error> {
        (&close).try_into()
    }
}

/// A `CloseComplete` ('3') message, sent in response to a `Close`.
pub fn close_complete() -> BytesMut {
    let mut message = BytesMut::new();
    message.put_u8(b'3');
    message.put_i32(4);
    message
}

