//! Error taxonomy shared by the wire codec, pool, authenticator, and worker pipelines.
//!
//! Kept flat rather than nested: almost every call site only needs a message and,
//! for server-side failures, the identity of the backend involved. `ClientIdentifier`
//! and `ServerIdentifier` carry that context for logging without re-deriving it.

use crate::auth::hba::CheckResult;

/// Errors produced anywhere in the proxy's client/server/pool/auth code paths.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("socket error occurred: {0}")]
    SocketError(String),

    #[error("protocol synchronization error: {0}")]
    ProtocolSyncError(String),

    #[error("invalid client startup message")]
    ClientBadStartup,

    #[error("client error: {0}")]
    ClientError(String),

    #[error("configuration error: {0}")]
    BadConfig(String),

    #[error("authentication error: {0}")]
    AuthError(String),

    #[error("hba forbidden: {0}")]
    HbaForbiddenError(String),

    #[error("SCRAM client error: {0}")]
    ScramClientError(String),

    #[error("SCRAM server error: {0}")]
    ScramServerError(String),

    #[error("server authentication error for {1}: {0}")]
    ServerAuthError(String, ServerIdentifier),

    #[error("error reading {0} on server startup {1}")]
    ServerStartupError(String, ServerIdentifier),

    #[error("failed to read server startup parameters: {0}")]
    ServerStartupReadParameters(String),

    #[error("internal server error")]
    ServerError,

    #[error("failed to parse server message: {0}")]
    ServerMessageParserError(String),

    #[error("prepared statement not found")]
    PreparedStatementError,

    #[error("message exceeds the configured maximum size")]
    MaxMessageSize,

    #[error("memory usage limit reached")]
    CurrentMemoryUsage,

    #[error("timed out waiting for a pool slot")]
    QueryWaitTimeout,

    #[error("all configured servers are down")]
    AllServersDown,

    #[error("shutting down")]
    ShuttingDown,

    #[error("timed out flushing the pool")]
    FlushTimeout,

    #[error("proxy timeout")]
    ProxyTimeout,

    #[error("TLS error")]
    TlsError,
}

/// Identifies a client for logging, error messages, and the HBA decisions made for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentifier {
    pub addr: String,
    pub application_name: String,
    pub username: String,
    pub pool_name: String,
    /// HBA outcome for an md5 password exchange from this client's address.
    pub hba_md5: CheckResult,
    /// HBA outcome for a SCRAM-SHA-256 password exchange from this client's address.
    pub hba_scram: CheckResult,
}

impl ClientIdentifier {
    pub fn new(application_name: &str, username: &str, pool_name: &str, addr: &str) -> Self {
        ClientIdentifier {
            addr: addr.into(),
            application_name: application_name.into(),
            username: username.into(),
            pool_name: pool_name.into(),
            hba_md5: CheckResult::NotMatched,
            hba_scram: CheckResult::NotMatched,
        }
    }
}

impl std::fmt::Display for ClientIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let Self {
            addr,
            application_name,
            username,
            pool_name,
            ..
        } = self;
        write!(f, "{{ {username}@{addr}/{pool_name}?application_name={application_name} }}")
    }
}

/// Identifies a backend connection for logging and error messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerIdentifier {
    pub username: String,
    pub database: String,
}

impl ServerIdentifier {
    pub fn new(username: String, database: &str) -> Self {
        ServerIdentifier {
            username,
            database: database.into(),
        }
    }
}

impl std::fmt::Display for ServerIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let Self { username, database } = self;
        write!(f, "{{ username: {username}, database: {database} }}")
    }
}
