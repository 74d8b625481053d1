use std::fs::File;
use std::io::Read;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use base64;
use byteorder::{BigEndian, ByteOrder};
use chrono::NaiveDateTime;
use vault;
use wire::{opcode, Header, HeaderFlags};

use cull::CtfileStore;
use error::Error;
use ops::{CtfileOpArgs, MatchMode};
use proto::{self, OpenMode};
use session::{FileState, Session, Transport};
use trans::{FileNode, FileType, TransState, TransType};

/// Longest cooked name the server accepts.
pub const CTFILE_MAXLEN: usize = 256;

// Characters refused in remote names, for interoperability with the
// server's storage layout and the textual control bodies.
const REJECTCHRS: &'static [char] = &['/', '\\', ':', '"'];

// New-style chunk framing on the wire.
const EX_STATUS_CTFILE_PROTO: u8 = 2;

/// True for names already carrying the server's `YYYYMMDD-HHMMSS-`
/// date-stamp prefix.
pub fn is_cooked_name(name: &str) -> bool {
    let b = name.as_bytes();
    b.len() >= 16
        && b[..8].iter().all(|c| c.is_ascii_digit())
        && b[8] == b'-'
        && b[9..15].iter().all(|c| c.is_ascii_digit())
        && b[15] == b'-'
}

/// Produce the remote form of a ctfile name: date-stamped names pass
/// through, anything else gets the current stamp prefixed.
pub fn cook_name(name: &str, now: NaiveDateTime) -> String {
    if is_cooked_name(name) {
        name.to_string()
    } else {
        format!("{}-{}", now.format("%Y%m%d-%H%M%S"), name)
    }
}

/// Refuse names the server side cannot take: reject-set characters, and
/// names whose cooked, base64-encoded form would exceed the limit.
pub fn verify_name(name: &str) -> Result<(), Error> {
    if name.is_empty() {
        return Err(Error::Name("empty name"));
    }
    if name.contains(REJECTCHRS) {
        return Err(Error::Name("rejected character in name"));
    }

    let cooked = format!("YYYYMMDD-HHMMSS-{}", name);
    if base64::encode(cooked.as_bytes()).len() > CTFILE_MAXLEN {
        return Err(Error::Name("name too long"));
    }
    Ok(())
}

/// Where a fetched ctfile lands in the local cache.
pub fn cache_path(cachedir: &Path, name: &str) -> PathBuf {
    cachedir.join(name)
}

/// Apply include and exclude patterns to a name listing.
pub fn list_filter(
    names: Vec<String>,
    mode: MatchMode,
    patterns: &[String],
    excludes: &[String],
) -> Vec<String> {
    fn matches(mode: MatchMode, name: &str, pat: &str) -> bool {
        match mode {
            MatchMode::Exact => name == pat,
            MatchMode::Prefix => name.starts_with(pat),
            MatchMode::Substring => name.contains(pat),
        }
    }

    names
        .into_iter()
        .filter(|name| {
            (patterns.is_empty() || patterns.iter().any(|p| matches(mode, name, p)))
                && !excludes.iter().any(|p| matches(mode, name, p))
        })
        .collect()
}

/// Per-operation producer scratch, owned by the session while the
/// operation runs.
pub(crate) enum OpPriv {
    Archive(ArchiveState),
    Extract(ExtractState),
}

pub(crate) struct ArchiveState {
    handle: File,
    fnode: Option<FileNode>,
    size: u64,
    offset: u64,
    block_no: u32,
    open_sent: bool,
    rname: String,
    localname: String,
}

pub(crate) struct ExtractState {
    pub fnode: Option<FileNode>,
    pub writer: Option<File>,
    pub target: PathBuf,
    pub eof_seen: bool,
    block_no: u32,
    open_sent: bool,
    is_open: bool,
    rname: String,
}

fn read_full<R: Read>(r: &mut R, buf: &mut [u8]) -> Result<usize, Error> {
    let mut nread = 0;
    while nread < buf.len() {
        let n = r.read(&mut buf[nread..])?;
        if n == 0 {
            break;
        }
        nread += n;
    }
    Ok(nread)
}

fn local_path(args: &CtfileOpArgs) -> PathBuf {
    match args.tdir {
        Some(ref d) => d.join(&args.localname),
        None => PathBuf::from(&args.localname),
    }
}

/// The archive producer. Re-entered by the host whenever there is room;
/// drives itself off the session's file state exactly like every other
/// producer: one-shot init in `Starting`, then produce until the pool
/// runs dry, the server must answer, or the file ends.
pub(crate) fn archive_start<S: CtfileStore, T: Transport>(
    sess: &mut Session<S, T>,
    args: &CtfileOpArgs,
) -> Result<(), Error> {
    match sess.file_state {
        FileState::WaitingServer | FileState::Finished => return Ok(()),
        FileState::Starting => {
            let path = local_path(args);
            debug!("opening ctfile for archive {}", args.localname);
            if args.ctfile {
                sess.store.validate(&path)?;
            }
            let handle = File::open(&path)?;
            let md = handle.metadata()?;
            let fnode = FileNode {
                name: args.localname.clone(),
                ftype: FileType::Regular,
                mode: md.mode() & 0o7777,
                uid: md.uid(),
                gid: md.gid(),
                atime: md.atime(),
                mtime: md.mtime(),
                parent_dir: path.parent().unwrap_or(Path::new(".")).to_path_buf(),
            };
            let rname = match args.remotename {
                Some(ref r) => cook_name(r, sess.now),
                None => cook_name(&args.localname, sess.now),
            };
            sess.op_priv = Some(OpPriv::Archive(ArchiveState {
                handle,
                fnode: Some(fnode),
                size: md.len(),
                offset: 0,
                block_no: 0,
                open_sent: false,
                rname,
                localname: args.localname.clone(),
            }));
        }
        _ => {}
    }

    sess.file_state = FileState::Running;
    let mut st = match sess.op_priv.take() {
        Some(OpPriv::Archive(st)) => st,
        _ => return Err(Error::Protocol("archive producer without archive state")),
    };
    let res = archive_produce(sess, args, &mut st);
    match res {
        Ok(done) => {
            if !done {
                sess.op_priv = Some(OpPriv::Archive(st));
            }
            Ok(())
        }
        Err(e) => {
            sess.op_priv = Some(OpPriv::Archive(st));
            Err(e)
        }
    }
}

fn archive_produce<S: CtfileStore, T: Transport>(
    sess: &mut Session<S, T>,
    args: &CtfileOpArgs,
    st: &mut ArchiveState,
) -> Result<bool, Error> {
    loop {
        let mut trans = match sess.pool.alloc() {
            Some(t) => t,
            None => {
                debug!("ran out of transactions, waiting");
                sess.file_state = FileState::WaitingTrans;
                return Ok(false);
            }
        };

        if !st.open_sent {
            st.open_sent = true;
            let (hdr, body) = proto::create_open(&st.rname, OpenMode::Write, 0);
            trans.hdr = hdr;
            trans.set_slot(2, &body);
            trans.state = TransState::XmlOpen;
            trans.ctfile_name = Some(st.rname.clone());
            debug!("open trans {}", trans.id);
            sess.queue_first(trans);
            // the reply dispatch wakes us once the remote open is in
            sess.file_state = FileState::WaitingServer;
            return Ok(false);
        }

        if st.offset == st.size {
            sess.file_state = FileState::Finished;
            trans.state = TransState::XmlClose;
            trans.eof = true;
            trans.hdr.flags = HeaderFlags::METADATA;
            trans.ctfile_name = Some(st.rname.clone());
            trans.fnode = st.fnode.take();
            sess.stats.bytes_tot += st.size;
            debug!("setting eof on trans {}", trans.id);
            sess.queue_first(trans);
            return Ok(true);
        }

        let mut rsz = st.size - st.offset;
        if rsz > sess.config.max_block_size as u64 {
            rsz = sess.config.max_block_size as u64;
        }

        trans.data[0].resize(rsz as usize, 0);
        let rlen = read_full(&mut st.handle, &mut trans.data[0])?;
        trans.data[0].truncate(rlen);
        trans.dataslot = 0;
        sess.stats.bytes_read += rlen as u64;

        trans.state = TransState::Read;
        trans.ttype = TransType::WriteChunk;
        trans.hdr = Header::new(0, opcode::WRITE_CHUNK);
        trans.hdr.flags = HeaderFlags::METADATA;
        if args.encrypted {
            trans.hdr.flags |= HeaderFlags::ENCRYPTED;
        }
        trans.hdr.ex_status = EX_STATUS_CTFILE_PROTO;
        trans.eof = false;
        trans.chunkno = st.block_no;
        trans.ctfile_name = Some(st.rname.clone());
        st.block_no += 1;

        if rlen as u64 != rsz || st.offset + rlen as u64 == st.size {
            // short read, file truncated or EOF
            match st.handle.metadata() {
                Ok(md) => {
                    if md.len() != st.size {
                        warn!("file truncated during backup {}", st.localname);
                        sess.stats.truncations += 1;
                    }
                }
                Err(e) => warn!("file stat error {} {}", st.localname, e),
            }
            // the next pass hits the size == offset case above
            st.offset = st.size;
            trans.eof = true;
        } else {
            st.offset += rlen as u64;
        }
        debug!("trans {} read {} of {}", trans.id, rlen, rsz);
        sess.queue_first(trans);
    }
}

/// The extract producer: open the remote file, synthesize the local
/// node, then stream read requests with deterministic per-chunk IVs
/// until the server reports the end of the file.
pub(crate) fn extract_start<S: CtfileStore, T: Transport>(
    sess: &mut Session<S, T>,
    args: &CtfileOpArgs,
) -> Result<(), Error> {
    match sess.file_state {
        FileState::WaitingServer | FileState::Finished => return Ok(()),
        FileState::Starting => {
            let rname = match args.remotename {
                Some(ref r) => cook_name(r, sess.now),
                None => cook_name(&args.localname, sess.now),
            };
            sess.op_priv = Some(OpPriv::Extract(ExtractState {
                fnode: None,
                writer: None,
                target: local_path(args),
                eof_seen: false,
                block_no: 0,
                open_sent: false,
                is_open: false,
                rname,
            }));
        }
        _ => {}
    }

    sess.file_state = FileState::Running;
    let mut st = match sess.op_priv.take() {
        Some(OpPriv::Extract(st)) => st,
        _ => return Err(Error::Protocol("extract producer without extract state")),
    };
    let res = extract_produce(sess, args, &mut st);
    sess.op_priv = Some(OpPriv::Extract(st));
    res
}

fn extract_produce<S: CtfileStore, T: Transport>(
    sess: &mut Session<S, T>,
    args: &CtfileOpArgs,
    st: &mut ExtractState,
) -> Result<(), Error> {
    loop {
        let mut trans = match sess.pool.alloc() {
            Some(t) => t,
            None => {
                debug!("ran out of transactions, waiting");
                sess.file_state = FileState::WaitingTrans;
                return Ok(());
            }
        };

        if !st.open_sent {
            st.open_sent = true;
            let (hdr, body) = proto::create_open(&st.rname, OpenMode::Read, 0);
            trans.hdr = hdr;
            trans.set_slot(2, &body);
            trans.state = TransState::XmlOpen;
            trans.ctfile_name = Some(st.rname.clone());
            sess.queue_first(trans);
            sess.file_state = FileState::WaitingServer;
            return Ok(());
        }

        if !st.is_open {
            st.is_open = true;
            st.fnode = Some(FileNode {
                name: args.localname.clone(),
                ftype: FileType::Regular,
                mode: 0o600,
                uid: 0,
                gid: 0,
                atime: sess.now.timestamp(),
                mtime: sess.now.timestamp(),
                parent_dir: st
                    .target
                    .parent()
                    .unwrap_or(Path::new("."))
                    .to_path_buf(),
            });
            trans.state = TransState::ExFileStart;
            trans.hdr.flags = HeaderFlags::METADATA;
            sess.queue_first(trans);
            continue;
        }

        trans.state = TransState::ExSha;
        trans.ttype = TransType::ReadChunk;
        trans.eof = false;
        trans.chunkno = st.block_no;
        st.block_no += 1;
        trans.ctfile_name = Some(st.rname.clone());
        trans.hdr = Header::new(0, opcode::READ_CHUNK);
        trans.hdr.flags = HeaderFlags::METADATA;
        trans.hdr.ex_status = EX_STATUS_CTFILE_PROTO;

        if let Some(ref keys) = sess.keys {
            vault::create_iv_ctfile(&keys.ivkey, trans.chunkno, &mut trans.iv)?;
        }

        let mut chunk_req = [0u8; 4];
        BigEndian::write_u32(&mut chunk_req, trans.chunkno);
        trans.set_slot(2, &chunk_req);
        sess.queue_first(trans);
    }
}
