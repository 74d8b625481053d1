use std::{error, fmt, io};

use byteorder::{BigEndian, ByteOrder};

// HEADER_LEN is the number of bytes a header occupies on the wire:
// tag, flags and size in network byte order, then the four one-byte
// fields, packed with no padding.
pub const HEADER_LEN: usize = 14;

bitflags! {
    pub struct HeaderFlags: u16 {
        /// The payload belongs to ctfile (catalog) traffic.
        const METADATA  = 0b0000_0001;
        /// The payload is an encrypted chunk.
        const ENCRYPTED = 0b0000_0010;
    }
}

/// The fixed envelope preceding every payload in both directions.
/// `tag` correlates a request with its reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub tag: u32,
    pub flags: HeaderFlags,
    pub size: u32,
    pub opcode: u8,
    pub status: u8,
    pub ex_status: u8,
    pub version: u8,
}

impl Header {
    pub fn new(tag: u32, opcode: u8) -> Self {
        Header {
            tag,
            flags: HeaderFlags::empty(),
            size: 0,
            opcode,
            status: 0,
            ex_status: 0,
            version: super::HDR_VERSION,
        }
    }

    // wire converts every multi-byte field to network byte order and
    // lays the header out in its fixed on-wire form.
    pub fn wire(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        BigEndian::write_u32(&mut buf[0..4], self.tag);
        BigEndian::write_u16(&mut buf[4..6], self.flags.bits());
        BigEndian::write_u32(&mut buf[6..10], self.size);
        buf[10] = self.opcode;
        buf[11] = self.status;
        buf[12] = self.ex_status;
        buf[13] = self.version;
        buf
    }

    // unwire reverses `wire`. Unknown flag bits fail the frame rather
    // than being silently dropped.
    pub fn unwire(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() != HEADER_LEN {
            return Err(WireError::BadHeader);
        }
        let flags = HeaderFlags::from_bits(BigEndian::read_u16(&buf[4..6]))
            .ok_or(WireError::BadHeader)?;
        Ok(Header {
            tag: BigEndian::read_u32(&buf[0..4]),
            flags,
            size: BigEndian::read_u32(&buf[6..10]),
            opcode: buf[10],
            status: buf[11],
            ex_status: buf[12],
            version: buf[13],
        })
    }
}

/// Write a header and its payload as one frame. `hdr.size` must already
/// equal `body.len()`.
pub fn write_frame<W: io::Write>(w: &mut W, hdr: &Header, body: &[u8]) -> Result<(), WireError> {
    if hdr.size as usize != body.len() {
        return Err(WireError::BadHeader);
    }
    w.write_all(&hdr.wire()).map_err(WireError::Io)?;
    w.write_all(body).map_err(WireError::Io)?;
    Ok(())
}

/// Read one frame: a header followed by `size` payload bytes.
pub fn read_frame<R: io::Read>(r: &mut R) -> Result<(Header, Vec<u8>), WireError> {
    let mut hbuf = [0u8; HEADER_LEN];
    r.read_exact(&mut hbuf).map_err(WireError::Io)?;
    let hdr = Header::unwire(&hbuf)?;

    let mut body = vec![0u8; hdr.size as usize];
    r.read_exact(&mut body).map_err(WireError::Io)?;
    Ok((hdr, body))
}

#[derive(Debug)]
pub enum WireError {
    Io(io::Error),
    BadHeader,
    BadHex,
    BadSha,
}

impl error::Error for WireError {
    fn cause(&self) -> Option<&dyn error::Error> {
        match self {
            &WireError::Io(ref e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            &WireError::Io(ref e) => write!(f, "io error: {}", e),
            &WireError::BadHeader => write!(f, "malformed header"),
            &WireError::BadHex => write!(f, "malformed hex input"),
            &WireError::BadSha => write!(f, "malformed sha string"),
        }
    }
}
