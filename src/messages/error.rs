//! Parses the field-coded body of a PostgreSQL `ErrorResponse`/`NoticeResponse`
//! message into a struct so error logging doesn't have to re-walk raw bytes.

use crate::errors::Error;

/// A decoded `ErrorResponse` ('E') or `NoticeResponse` ('N') body. Only the
/// fields the proxy actually logs are kept; the rest of the field-coded body
/// is skipped.
#[derive(Debug, Clone)]
pub struct PgErrorMsg {
    pub severity: String,
    pub code: String,
    pub message: String,
    pub hint: Option<String>,
    pub position: Option<i32>,
}

impl PgErrorMsg {
    /// Parses the field-coded body of an `ErrorResponse`/`NoticeResponse`
    /// (everything after the message type byte and length, i.e. just the
    /// repeated `<field-type byte><value>\0` records up to the terminating
    /// zero byte).
    pub fn parse(bytes: impl AsRef<[u8]>) -> Result<PgErrorMsg, Error> {
        let bytes = bytes.as_ref();
        let mut severity = None;
        let mut code = None;
        let mut message = None;
        let mut hint = None;
        let mut position = None;

        let mut idx = 0;
        while idx < bytes.len() {
            let field_type = bytes[idx];
            if field_type == 0 {
                break;
            }
            idx += 1;

            let start = idx;
            while idx < bytes.len() && bytes[idx] != 0 {
                idx += 1;
            }
            if idx >= bytes.len() {
                return Err(Error::ProtocolSyncError(
                    "unterminated field in error message".into(),
                ));
            }
            let value = String::from_utf8_lossy(&bytes[start..idx]).into_owned();
            idx += 1; // skip the field's null terminator

            match field_type {
                b'S' => severity = Some(value),
                b'C' => code = Some(value),
                b'M' => message = Some(value),
                b'H' => hint = Some(value),
                b'P' => position = value.parse::<i32>().ok(),
                _ => (),
            }
        }

        Ok(PgErrorMsg {
            severity: severity.unwrap_or_else(|| "UNKNOWN".to_string()),
            code: code.unwrap_or_else(|| "00000".to_string()),
            message: message
                .ok_or_else(|| Error::ProtocolSyncError("error message has no 'M' field".into()))?,
            hint,
            position,
        })
    }
}
