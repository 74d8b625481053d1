#![forbid(unsafe_code)]

extern crate byteorder;
#[macro_use]
extern crate bitflags;
extern crate hex;

#[cfg(test)]
extern crate hex_literal;

mod header;
pub use self::header::{Header, HeaderFlags, WireError, HEADER_LEN};
pub use self::header::{read_frame, write_frame};

pub mod opcode {
    pub const NOP: u8 = 0;
    pub const EXISTS: u8 = 1;
    pub const WRITE_CHUNK: u8 = 2;
    pub const READ_CHUNK: u8 = 3;
    pub const XML: u8 = 4;
    pub const XML_REPLY: u8 = 5;
}

pub mod status {
    pub const OK: u8 = 0;
    pub const FAIL: u8 = 1;
    pub const EXISTS: u8 = 2;
    pub const DOESNTEXIST: u8 = 3;
}

// HDR_VERSION is the protocol revision stamped into every header. Any
// frame that carries a different version fails the session immediately.
pub const HDR_VERSION: u8 = 2;

/// Length in bytes of a chunk identifier (SHA-1).
pub const SHA_DIGEST_LEN: usize = 20;

/// Parse a 40-character lowercase/uppercase hex SHA-1 string into its
/// 20-byte form. Any non-hex byte or trailing input is an error.
pub fn text_to_sha(text: &str) -> Result<[u8; SHA_DIGEST_LEN], WireError> {
    let bytes = text.as_bytes();
    if bytes.len() != SHA_DIGEST_LEN * 2 {
        return Err(WireError::BadSha);
    }
    let mut sha = [0u8; SHA_DIGEST_LEN];
    hex::decode_to_slice(bytes, &mut sha).map_err(|_| WireError::BadSha)?;
    Ok(sha)
}

/// Encode key material as lowercase hex pairs, the form used for every
/// field of the secrets file.
pub fn to_hex(data: &[u8]) -> String {
    hex::encode(data)
}

/// Decode a hex string into `dst`, rejecting odd-length input, non-hex
/// digits and length mismatches against the destination.
pub fn from_hex(src: &str, dst: &mut [u8]) -> Result<(), WireError> {
    if src.len() % 2 != 0 || src.len() / 2 != dst.len() {
        return Err(WireError::BadHex);
    }
    hex::decode_to_slice(src.as_bytes(), dst).map_err(|_| WireError::BadHex)
}
