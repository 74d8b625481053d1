use std::{error, fmt, io};

use vault;
use wire::WireError;

/// Everything the engine can fail with. `Truncated` is a warning-class
/// condition (the archive continues); every other variant is fatal for
/// the session.
#[derive(Debug)]
pub enum Error {
    Config(&'static str),
    Io(io::Error),
    Crypto(vault::Error),
    Wire(WireError),
    Protocol(&'static str),
    Server(u8),
    Name(&'static str),
    Truncated,
    Fatal(String),
}

impl error::Error for Error {
    fn cause(&self) -> Option<&dyn error::Error> {
        match self {
            &Error::Io(ref e) => Some(e),
            &Error::Crypto(ref e) => Some(e),
            &Error::Wire(ref e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            &Error::Config(msg) => write!(f, "config error: {}", msg),
            &Error::Io(ref e) => write!(f, "io error: {}", e),
            &Error::Crypto(ref e) => write!(f, "{}", e),
            &Error::Wire(ref e) => write!(f, "{}", e),
            &Error::Protocol(msg) => write!(f, "protocol error: {}", msg),
            &Error::Server(status) => write!(f, "server returned status {}", status),
            &Error::Name(msg) => write!(f, "invalid ctfile name: {}", msg),
            &Error::Truncated => write!(f, "file truncated during backup"),
            &Error::Fatal(ref msg) => write!(f, "{}", msg),
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<vault::Error> for Error {
    fn from(e: vault::Error) -> Self {
        Error::Crypto(e)
    }
}

impl From<WireError> for Error {
    fn from(e: WireError) -> Self {
        match e {
            WireError::Io(e) => Error::Io(e),
            other => Error::Wire(other),
        }
    }
}
