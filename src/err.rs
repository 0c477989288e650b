//! Process-wide error taxonomy.
//!
//! Every error that crosses a component boundary — and every `error_code`
//! on the wire — is one of these values. The i32 codes are stable protocol
//! constants; unknown codes decode to [`Error::Unknown`].

use thiserror::Error;

/// Result alias used throughout the engine.
pub type Result<T> = std::result::Result<T, Error>;

/// Wire value meaning "no error".
pub const ER_OK: i32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum Error {
    #[error("invalid argument")]
    Arg,
    #[error("unexpected fault")]
    Fault,
    #[error("bad state for operation")]
    BadState,
    #[error("out of memory")]
    OutOfMemory,
    #[error("already exists")]
    AlreadyExists,
    #[error("not found")]
    NotFound,
    #[error("not supported")]
    NotSupported,
    #[error("not implemented")]
    NotImpl,
    #[error("permission denied")]
    Permission,
    #[error("retry operation")]
    Retry,
    #[error("no more results")]
    Nomore,
    #[error("network error")]
    Network,
    #[error("connecting")]
    Connecting,
    #[error("busy")]
    Busy,
    #[error("write failed")]
    Writing,
    #[error("read failed")]
    Reading,
    #[error("operation waiting")]
    Waiting,
    #[error("timed out")]
    Timeout,
    #[error("aborted")]
    Aborted,
    #[error("closed")]
    Closed,
    #[error("shut down")]
    Shutdown,
    #[error("connection refused")]
    Refused,
    #[error("no address")]
    NoAddress,
    #[error("no host")]
    NoHost,
    #[error("host unknown")]
    HostUnknown,
    #[error("wrong address family")]
    AddressFamily,
    #[error("bad flags")]
    BadFlags,
    #[error("invalid format")]
    InvalidFormat,
    #[error("disk i/o error")]
    DiskIo,
    #[error("connection reset")]
    Reset,
    #[error("undelivered")]
    Undelivered,
    #[error("crypto error")]
    Crypto,
    #[error("communication error")]
    Comm,
    #[error("fatal error")]
    Fatal,
    #[error("unknown error")]
    Unknown,
}

impl Error {
    /// Stable i32 wire code for this error.
    pub fn code(self) -> i32 {
        match self {
            Error::Arg => -1,
            Error::Fault => -2,
            Error::BadState => -3,
            Error::OutOfMemory => -4,
            Error::AlreadyExists => -5,
            Error::NotFound => -6,
            Error::NotSupported => -7,
            Error::NotImpl => -8,
            Error::Permission => -9,
            Error::Retry => -10,
            Error::Nomore => -11,
            Error::Network => -12,
            Error::Connecting => -13,
            Error::Busy => -14,
            Error::Writing => -15,
            Error::Reading => -16,
            Error::Waiting => -17,
            Error::Timeout => -18,
            Error::Aborted => -19,
            Error::Closed => -20,
            Error::Shutdown => -21,
            Error::Refused => -22,
            Error::NoAddress => -23,
            Error::NoHost => -24,
            Error::HostUnknown => -25,
            Error::AddressFamily => -26,
            Error::BadFlags => -27,
            Error::InvalidFormat => -28,
            Error::DiskIo => -29,
            Error::Reset => -30,
            Error::Undelivered => -31,
            Error::Crypto => -32,
            Error::Comm => -33,
            Error::Fatal => -34,
            Error::Unknown => -35,
        }
    }

    /// Decode a wire code. `0` is not an error; pass only non-zero codes.
    pub fn from_code(code: i32) -> Error {
        match code {
            -1 => Error::Arg,
            -2 => Error::Fault,
            -3 => Error::BadState,
            -4 => Error::OutOfMemory,
            -5 => Error::AlreadyExists,
            -6 => Error::NotFound,
            -7 => Error::NotSupported,
            -8 => Error::NotImpl,
            -9 => Error::Permission,
            -10 => Error::Retry,
            -11 => Error::Nomore,
            -12 => Error::Network,
            -13 => Error::Connecting,
            -14 => Error::Busy,
            -15 => Error::Writing,
            -16 => Error::Reading,
            -17 => Error::Waiting,
            -18 => Error::Timeout,
            -19 => Error::Aborted,
            -20 => Error::Closed,
            -21 => Error::Shutdown,
            -22 => Error::Refused,
            -23 => Error::NoAddress,
            -24 => Error::NoHost,
            -25 => Error::HostUnknown,
            -26 => Error::AddressFamily,
            -27 => Error::BadFlags,
            -28 => Error::InvalidFormat,
            -29 => Error::DiskIo,
            -30 => Error::Reset,
            -31 => Error::Undelivered,
            -32 => Error::Crypto,
            -33 => Error::Comm,
            -34 => Error::Fatal,
            _ => Error::Unknown,
        }
    }

    /// Wire code of an optional error; `None` encodes as [`ER_OK`].
    pub fn code_of(err: Option<Error>) -> i32 {
        err.map_or(ER_OK, Error::code)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match e.kind() {
            ErrorKind::NotFound => Error::NotFound,
            ErrorKind::PermissionDenied => Error::Permission,
            ErrorKind::ConnectionRefused => Error::Refused,
            ErrorKind::ConnectionReset => Error::Reset,
            ErrorKind::ConnectionAborted => Error::Aborted,
            ErrorKind::NotConnected => Error::Closed,
            ErrorKind::AddrInUse => Error::AlreadyExists,
            ErrorKind::AddrNotAvailable => Error::NoAddress,
            ErrorKind::BrokenPipe => Error::Closed,
            ErrorKind::AlreadyExists => Error::AlreadyExists,
            ErrorKind::WouldBlock => Error::Retry,
            ErrorKind::InvalidInput => Error::Arg,
            ErrorKind::InvalidData => Error::InvalidFormat,
            ErrorKind::TimedOut => Error::Timeout,
            ErrorKind::WriteZero => Error::Writing,
            ErrorKind::Interrupted => Error::Retry,
            ErrorKind::Unsupported => Error::NotSupported,
            ErrorKind::UnexpectedEof => Error::Closed,
            ErrorKind::OutOfMemory => Error::OutOfMemory,
            _ => Error::Network,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(_: serde_json::Error) -> Self {
        Error::InvalidFormat
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_round_trip() {
        let all = [
            Error::Arg,
            Error::Fault,
            Error::BadState,
            Error::OutOfMemory,
            Error::AlreadyExists,
            Error::NotFound,
            Error::NotSupported,
            Error::NotImpl,
            Error::Permission,
            Error::Retry,
            Error::Nomore,
            Error::Network,
            Error::Connecting,
            Error::Busy,
            Error::Writing,
            Error::Reading,
            Error::Waiting,
            Error::Timeout,
            Error::Aborted,
            Error::Closed,
            Error::Shutdown,
            Error::Refused,
            Error::NoAddress,
            Error::NoHost,
            Error::HostUnknown,
            Error::AddressFamily,
            Error::BadFlags,
            Error::InvalidFormat,
            Error::DiskIo,
            Error::Reset,
            Error::Undelivered,
            Error::Crypto,
            Error::Comm,
            Error::Fatal,
            Error::Unknown,
        ];
        for e in all {
            assert_eq!(Error::from_code(e.code()), e);
        }
    }

    #[test]
    fn test_io_error_mapping() {
        let e = std::io::Error::from(std::io::ErrorKind::ConnectionRefused);
        assert_eq!(Error::from(e), Error::Refused);
        let e = std::io::Error::from(std::io::ErrorKind::UnexpectedEof);
        assert_eq!(Error::from(e), Error::Closed);
    }

    #[test]
    fn test_unknown_code_decodes_to_unknown() {
        assert_eq!(Error::from_code(-9999), Error::Unknown);
    }
}
