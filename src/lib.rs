#![forbid(unsafe_code)]

extern crate base64;
extern crate byteorder;
extern crate chrono;
extern crate hex;
#[macro_use]
extern crate log;
extern crate rand;

extern crate vault;
extern crate wire;

#[cfg(test)]
extern crate tempfile;

pub mod config;
pub mod ctfile;
pub mod cull;
mod error;
pub mod ops;
pub mod proto;
pub mod session;
pub mod trans;

pub use config::{Config, Polltype};
pub use cull::{ChunkRef, CtfileRefs, CtfileStore};
pub use error::Error;
pub use ops::MatchMode;
pub use session::{FileState, Session, Stats, StreamTransport, TcpTransport, Transport};

#[cfg(test)]
mod test_session;
