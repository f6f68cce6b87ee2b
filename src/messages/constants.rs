//! Wire-level constants for the PostgreSQL frontend/backend protocol (v3).

/// Protocol version 3.0, sent as the first field of a StartupMessage.
pub const PROTOCOL_VERSION_NUMBER: i32 = 196_608;

/// Magic code identifying an SSLRequest in place of a StartupMessage.
pub const SSL_REQUEST_CODE: i32 = 80_877_103;

/// Magic code identifying a CancelRequest in place of a StartupMessage.
pub const CANCEL_REQUEST_CODE: i32 = 80_877_102;

/// Magic code identifying a GSSENCRequest in place of a StartupMessage.
pub const REQUEST_GSSENCMODE_CODE: i32 = 80_877_104;

/// Terminate ('X') message type byte.
pub const MESSAGE_TERMINATOR: u8 = b'X';

// AuthenticationXXX message sub-codes (the i32 following the 'R' message type).
pub const AUTHENTICATION_SUCCESSFUL: i32 = 0;
pub const MD5_ENCRYPTED_PASSWORD: i32 = 5;
pub const AUTHENTICATION_CLEAR_PASSWORD: i32 = 3;
pub const SASL: i32 = 10;
pub const SASL_CONTINUE: i32 = 11;
pub const SASL_FINAL: i32 = 12;

/// SCRAM mechanism name advertised during SASL negotiation.
pub const SCRAM_SHA_256: &str = "SCRAM-SHA-256";

/// Prefix marking a pool password as an md5 hash rather than plain text.
pub const MD5_PASSWORD_PREFIX: &str = "md5";
