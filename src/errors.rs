//! Errors.

use std::io;

/// Various errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("socket error: {0}")]
    Socket(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error(transparent)]
    BadConfig(#[from] ConfigError),
    #[error("{0}")]
    Admin(String),
    #[error(transparent)]
    ServerAuth(#[from] ServerAuthError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Unreadable {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("syntax error in configuration ({path}:{line})")]
    Syntax { path: String, line: usize },
    #[error("bad value for {key}: {value:?}")]
    BadValue { key: String, value: String },
    #[error("unknown parameter {0:?}")]
    UnknownParameter(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ServerAuthError {
    #[error("unsupported auth method {method} for {id}")]
    UnsupportedMethod { id: ServerIdentifier, method: u32 },
    #[error("unknown auth method {method} for {id}")]
    UnknownMethod { id: ServerIdentifier, method: u32 },
    #[error("password needed for {id} but none configured")]
    PasswordMissing { id: ServerIdentifier },
    #[error("truncated authentication request for {id}")]
    Truncated { id: ServerIdentifier },
}

/// Who a client socket belongs to, for log lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentifier {
    pub addr: String,
    pub username: String,
    pub database: String,
}

impl ClientIdentifier {
    pub fn new(username: &str, database: &str, addr: &str) -> ClientIdentifier {
        ClientIdentifier {
            addr: addr.into(),
            username: username.into(),
            database: database.into(),
        }
    }
}

impl std::fmt::Display for ClientIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let Self {
            addr,
            username,
            database,
        } = self;
        write!(f, "{{ {username}@{addr}/{database} }}")
    }
}

/// Which backend a server socket belongs to, for log lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerIdentifier {
    pub username: String,
    pub database: String,
}

impl ServerIdentifier {
    pub fn new(username: &str, database: &str) -> ServerIdentifier {
        ServerIdentifier {
            username: username.into(),
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
