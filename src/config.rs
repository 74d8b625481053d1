use std::path::PathBuf;

use vault;

use error::Error;

/// Event backend hint. The engine itself is a synchronous cooperative
/// loop; the hint is validated and stored for the transport owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Polltype {
    Kqueue,
    Poll,
    Select,
}

impl Polltype {
    pub fn from_name(name: &str) -> Result<Self, Error> {
        match name {
            "kqueue" => Ok(Polltype::Kqueue),
            "poll" => Ok(Polltype::Poll),
            "select" => Ok(Polltype::Select),
            _ => Err(Error::Config("unknown poll type")),
        }
    }
}

/// The options the engine consumes. Config file parsing belongs to the
/// caller; this is the validated result.
#[derive(Debug, Clone)]
pub struct Config {
    /// Upper bound on a produced chunk, in bytes.
    pub max_block_size: usize,
    /// Local directory holding fetched ctfiles.
    pub ctfile_cachedir: PathBuf,
    /// Cull retention window in days. Cull refuses to run on zero.
    pub ctfile_keep_days: u64,
    pub polltype: Option<Polltype>,
    /// PBKDF2 iteration count for the secrets file.
    pub rounds: u32,
    /// Transaction pool capacity.
    pub trans_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            max_block_size: 256 * 1024,
            ctfile_cachedir: PathBuf::from("."),
            ctfile_keep_days: 0,
            polltype: None,
            rounds: vault::DEF_ROUNDS,
            trans_capacity: 64,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), Error> {
        if self.max_block_size == 0 {
            return Err(Error::Config("max_block_size must not be zero"));
        }
        if self.rounds == 0 {
            return Err(Error::Config("rounds must not be zero"));
        }
        if self.trans_capacity == 0 {
            return Err(Error::Config("trans_capacity must not be zero"));
        }
        Ok(())
    }
}
