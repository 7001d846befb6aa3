use std::io;

/// Client-visible failure codes, carried in `FAILURE` responses.
pub const CODE_ERROR: u64 = 1;
pub const CODE_NOMEM: u64 = 2;
pub const CODE_PROTO: u64 = 3;
pub const CODE_PARSE: u64 = 4;
pub const CODE_OVERFLOW: u64 = 5;
pub const CODE_EOM: u64 = 6;
pub const CODE_ENGINE: u64 = 7;
pub const CODE_NOTFOUND: u64 = 8;
pub const CODE_STOPPED: u64 = 9;

/// Extended SQLite error codes returned by the replication hook when the
/// local server is not (or stops being) the cluster leader.
pub const SQLITE_IOERR_NOT_LEADER: i32 = rusqlite::ffi::SQLITE_IOERR | (40 << 8);
pub const SQLITE_IOERR_LEADERSHIP_LOST: i32 = rusqlite::ffi::SQLITE_IOERR | (41 << 8);

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("protocol error: {0}")]
    Proto(String),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("read overflow: {0}")]
    Overflow(String),
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error("{0}")]
    NotFound(String),
    #[error("server is shutting down")]
    Stopped,
    #[error("not leader")]
    NotLeader { leader: Option<String> },
    #[error("leadership lost")]
    LeadershipLost,
    #[error("corrupt: {0}")]
    Corrupt(String),
    #[error("request canceled")]
    Canceled,
    #[error("no connection to peer")]
    NoConnection,
    #[error("name too long: {0}")]
    NameTooLong(String),
    #[error("can't bootstrap: {0}")]
    CantBootstrap(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Raft(#[from] raft::Error),
    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Prefix the error message with additional context, preserving the
    /// failure code.
    pub fn wrap(self, prefix: &str) -> Self {
        match self {
            Error::Proto(m) => Error::Proto(format!("{prefix}: {m}")),
            Error::Parse(m) => Error::Parse(format!("{prefix}: {m}")),
            Error::Overflow(m) => Error::Overflow(format!("{prefix}: {m}")),
            Error::Corrupt(m) => Error::Corrupt(format!("{prefix}: {m}")),
            Error::NotFound(m) => Error::NotFound(format!("{prefix}: {m}")),
            Error::Internal(m) => Error::Internal(format!("{prefix}: {m}")),
            other => Error::Internal(format!("{prefix}: {other}")),
        }
    }

    /// The numeric code carried in a `FAILURE` response for this error.
    ///
    /// SQLite failures embed the engine's own (extended) result code, so
    /// that clients see exactly what the engine reported; everything else
    /// maps to the protocol-level codes.
    pub fn failure_code(&self) -> u64 {
        match self {
            Error::Proto(_) => CODE_PROTO,
            Error::Parse(_) => CODE_PARSE,
            Error::Overflow(_) => CODE_OVERFLOW,
            Error::Sqlite(e) => sqlite_code(e) as u64,
            Error::NotFound(_) => CODE_NOTFOUND,
            Error::Stopped | Error::Canceled => CODE_STOPPED,
            Error::NotLeader { .. } => SQLITE_IOERR_NOT_LEADER as u64,
            Error::LeadershipLost => SQLITE_IOERR_LEADERSHIP_LOST as u64,
            _ => CODE_ERROR,
        }
    }

    /// The human-readable message carried in a `FAILURE` response. Protocol
    /// errors carry their bare message, engine errors SQLite's text
    /// verbatim.
    pub fn failure_message(&self) -> String {
        match self {
            Error::Proto(m) | Error::Parse(m) | Error::Overflow(m) | Error::NotFound(m) => {
                m.clone()
            }
            Error::Sqlite(e) => sqlite_message(e),
            other => other.to_string(),
        }
    }

    /// Whether the gateway must drop the connection after responding.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Proto(_) | Error::Parse(_) | Error::Overflow(_) | Error::Stopped
        )
    }
}

fn sqlite_code(err: &rusqlite::Error) -> i32 {
    match err {
        rusqlite::Error::SqliteFailure(e, _) => e.extended_code,
        _ => rusqlite::ffi::SQLITE_ERROR,
    }
}

fn sqlite_message(err: &rusqlite::Error) -> String {
    match err {
        rusqlite::Error::SqliteFailure(_, Some(msg)) => msg.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn wrap_keeps_code() {
        let err = Error::Corrupt("short batch".into()).wrap("segment 0000000000000001-0000000000000004");
        assert!(matches!(err, Error::Corrupt(_)));
        assert_eq!(
            err.to_string(),
            "corrupt: segment 0000000000000001-0000000000000004: short batch"
        );
    }

    #[test]
    fn failure_codes() {
        assert_eq!(Error::Proto("x".into()).failure_code(), CODE_PROTO);
        assert_eq!(Error::NotFound("no stmt with id 0".into()).failure_code(), CODE_NOTFOUND);
        assert_eq!(
            Error::NotLeader { leader: None }.failure_code(),
            SQLITE_IOERR_NOT_LEADER as u64
        );
    }
}
