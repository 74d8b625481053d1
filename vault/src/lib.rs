#![forbid(unsafe_code)]

extern crate aes;
extern crate byteorder;
extern crate ecb;
extern crate hex;
extern crate hmac;
#[macro_use]
extern crate log;
extern crate pbkdf2;
extern crate rand;
extern crate sha1;
extern crate sha2;
extern crate xts_mode;
extern crate zeroize;

#[cfg(test)]
extern crate tempfile;

use std::{error, fmt, io};

mod chunk;
mod secrets;

pub use self::chunk::{create_iv, create_iv_ctfile, decrypt, encrypt};
pub use self::chunk::{CRYPTO_BLOCK_LEN, IV_LEN, KEY_LEN};
pub use self::secrets::{create_secrets, unlock_secrets, DEF_ROUNDS, SALT_LEN};

#[derive(Debug)]
pub enum Error {
    Io(io::Error),
    Crypto(&'static str),
    WrongPassphrase,
    MalformedSecrets(&'static str),
}

impl error::Error for Error {
    fn cause(&self) -> Option<&dyn error::Error> {
        match self {
            &Error::Io(ref e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            &Error::Io(ref e) => write!(f, "io error: {}", e),
            &Error::Crypto(msg) => write!(f, "crypto error: {}", msg),
            &Error::WrongPassphrase => write!(f, "invalid passphrase"),
            &Error::MalformedSecrets(msg) => write!(f, "malformed secrets file: {}", msg),
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}
