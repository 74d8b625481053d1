use std::collections::{BTreeMap, VecDeque};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::Path;
use std::time::Duration;

use chrono::{Local, NaiveDateTime};
use vault::{self, CRYPTO_BLOCK_LEN, IV_LEN, KEY_LEN};
use wire::{self, status, Header, HeaderFlags};

use config::Config;
use ctfile::{self, OpPriv};
use cull::{self, CtfileStore, CullState};
use error::Error;
use ops::{CtfileOpArgs, MatchMode, Op, OpQueue};
use proto;
use trans::{Trans, TransPool, TransState, TransType};

/// The producer's view of the session, polled from every operation
/// start callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileState {
    Starting,
    Running,
    WaitingTrans,
    WaitingServer,
    Finished,
}

/// The framed connection to the server. The TLS stream itself is an
/// external collaborator; the engine only needs ordered frames in both
/// directions and a bounded-poll receive for the pre-engine handshake.
pub trait Transport {
    fn send(&mut self, hdr: &Header, body: &[u8]) -> Result<(), Error>;
    fn recv(&mut self) -> Result<(Header, Vec<u8>), Error>;
    fn recv_timeout(&mut self, timeout: Duration) -> Result<(Header, Vec<u8>), Error>;
}

/// Frame transport over any synchronous stream. `recv_timeout` on an
/// arbitrary stream degrades to a blocking receive; use
/// [`TcpTransport`] when real receive deadlines are needed.
pub struct StreamTransport<S> {
    stream: S,
}

impl<S: Read + Write> StreamTransport<S> {
    pub fn new(stream: S) -> Self {
        StreamTransport { stream }
    }
}

impl<S: Read + Write> Transport for StreamTransport<S> {
    fn send(&mut self, hdr: &Header, body: &[u8]) -> Result<(), Error> {
        wire::write_frame(&mut self.stream, hdr, body)?;
        self.stream.flush()?;
        Ok(())
    }

    fn recv(&mut self) -> Result<(Header, Vec<u8>), Error> {
        Ok(wire::read_frame(&mut self.stream)?)
    }

    fn recv_timeout(&mut self, _timeout: Duration) -> Result<(Header, Vec<u8>), Error> {
        self.recv()
    }
}

/// Frame transport over TCP with real receive deadlines.
pub struct TcpTransport {
    stream: TcpStream,
}

impl TcpTransport {
    pub fn new(stream: TcpStream) -> Self {
        TcpTransport { stream }
    }
}

impl Transport for TcpTransport {
    fn send(&mut self, hdr: &Header, body: &[u8]) -> Result<(), Error> {
        wire::write_frame(&mut self.stream, hdr, body)?;
        self.stream.flush()?;
        Ok(())
    }

    fn recv(&mut self) -> Result<(Header, Vec<u8>), Error> {
        self.stream.set_read_timeout(None)?;
        Ok(wire::read_frame(&mut self.stream)?)
    }

    fn recv_timeout(&mut self, timeout: Duration) -> Result<(Header, Vec<u8>), Error> {
        self.stream.set_read_timeout(Some(timeout))?;
        let res = wire::read_frame(&mut self.stream);
        self.stream.set_read_timeout(None)?;
        Ok(res?)
    }
}

/// The unlocked data and IV-derivation keys. Wiped on drop.
pub struct SessionKeys {
    pub aeskey: [u8; KEY_LEN],
    pub ivkey: [u8; IV_LEN],
}

impl Drop for SessionKeys {
    fn drop(&mut self) {
        for b in self.aeskey.iter_mut() {
            *b = 0;
        }
        for b in self.ivkey.iter_mut() {
            *b = 0;
        }
    }
}

/// Per-session transfer accounting.
#[derive(Debug, Default, Clone)]
pub struct Stats {
    pub bytes_read: u64,
    pub bytes_tot: u64,
    pub truncations: u64,
}

/// One client session: the explicitly-passed context every part of the
/// engine works against. Owns the transaction pool, the operation
/// queue, the cull bookkeeping and the connection; tests instantiate
/// several side by side.
pub struct Session<S: CtfileStore, T: Transport> {
    pub(crate) config: Config,
    pub(crate) store: S,
    pub(crate) transport: T,
    pub(crate) pool: TransPool,
    pub(crate) ops: OpQueue,
    pub(crate) file_state: FileState,
    pub(crate) queued: VecDeque<Trans>,
    pub(crate) inflight: BTreeMap<u32, Trans>,
    pub(crate) complete_buf: BTreeMap<u64, Trans>,
    pub(crate) next_complete_id: u64,
    pub(crate) packet_id: u32,
    pub(crate) op_priv: Option<OpPriv>,
    pub(crate) keys: Option<SessionKeys>,
    pub(crate) stats: Stats,
    pub(crate) cull: CullState,
    pub(crate) ctfile_list: Vec<String>,
    pub(crate) list_results: Vec<String>,
    pub(crate) close_pending: bool,
    pub(crate) now: NaiveDateTime,
}

impl<S: CtfileStore, T: Transport> Session<S, T> {
    pub fn new(config: Config, store: S, transport: T) -> Result<Self, Error> {
        config.validate()?;
        let slot_capacity = config.max_block_size + CRYPTO_BLOCK_LEN;
        let pool = TransPool::new(config.trans_capacity, slot_capacity);
        Ok(Session {
            config,
            store,
            transport,
            pool,
            ops: OpQueue::new(),
            file_state: FileState::Starting,
            queued: VecDeque::new(),
            inflight: BTreeMap::new(),
            complete_buf: BTreeMap::new(),
            next_complete_id: 1,
            packet_id: 1,
            op_priv: None,
            keys: None,
            stats: Stats::default(),
            cull: CullState::new(),
            ctfile_list: Vec::new(),
            list_results: Vec::new(),
            close_pending: false,
            now: Local::now().naive_local(),
        })
    }

    /// Install the unlocked chunk keys; required before any encrypted
    /// traffic flows.
    pub fn load_keys(&mut self, aeskey: [u8; KEY_LEN], ivkey: [u8; IV_LEN]) {
        self.keys = Some(SessionKeys { aeskey, ivkey });
    }

    /// Pin the session clock. Name cooking and the cull retention
    /// threshold are computed against this; it defaults to the local
    /// time the session was created.
    pub fn set_clock(&mut self, now: NaiveDateTime) {
        self.now = now;
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// The filtered result of the most recent list operation.
    pub fn list_results(&self) -> &[String] {
        &self.list_results
    }

    // ---- operation enqueueing, the library face of the CLI verbs ----

    pub fn archive(
        &mut self,
        localname: &str,
        remotename: Option<&str>,
        tdir: Option<&Path>,
        encrypted: bool,
        is_ctfile: bool,
    ) -> Result<(), Error> {
        let raw = remotename.unwrap_or(localname);
        if !ctfile::is_cooked_name(raw) {
            ctfile::verify_name(raw)?;
        }
        self.ops.add(Op::Archive(CtfileOpArgs {
            localname: localname.to_string(),
            remotename: remotename.map(|s| s.to_string()),
            tdir: tdir.map(|p| p.to_path_buf()),
            ctfile: is_ctfile,
            encrypted,
        }));
        Ok(())
    }

    pub fn extract(
        &mut self,
        localname: &str,
        remotename: Option<&str>,
        tdir: Option<&Path>,
    ) -> Result<(), Error> {
        let raw = remotename.unwrap_or(localname);
        if !ctfile::is_cooked_name(raw) {
            ctfile::verify_name(raw)?;
        }
        self.ops.add(Op::Extract(CtfileOpArgs {
            localname: localname.to_string(),
            remotename: remotename.map(|s| s.to_string()),
            tdir: tdir.map(|p| p.to_path_buf()),
            ctfile: false,
            encrypted: false,
        }));
        Ok(())
    }

    pub fn list(&mut self, mode: MatchMode, patterns: Vec<String>, excludes: Vec<String>) {
        self.ops.add(Op::List {
            mode,
            patterns,
            excludes,
        });
    }

    pub fn delete(&mut self, name: &str) -> Result<(), Error> {
        if !ctfile::is_cooked_name(name) {
            ctfile::verify_name(name)?;
        }
        self.ops.add(Op::Delete {
            name: name.to_string(),
        });
        Ok(())
    }

    /// Queue the whole cull workflow: list, fetch anything missing from
    /// the cache, partition and collect, then setup / sha batches /
    /// commit against the server.
    pub fn cull(&mut self) {
        debug!("add_op cull");
        self.ops.add(Op::CullList);
        self.ops.add(Op::CullCollect);
        self.ops.add(Op::CullSetup);
        self.ops.add(Op::CullShas);
        self.ops.add(Op::CullComplete);
    }

    // ---- the cooperative engine ----

    /// Run queued operations to completion. On a fatal error the
    /// queues are drained, per-operation state is released and the
    /// error is surfaced.
    pub fn run(&mut self) -> Result<(), Error> {
        loop {
            match self.step() {
                Ok(true) => {}
                Ok(false) => return Ok(()),
                Err(e) => {
                    self.teardown();
                    return Err(e);
                }
            }
        }
    }

    fn teardown(&mut self) {
        self.queued.clear();
        self.inflight.clear();
        self.complete_buf.clear();
        self.op_priv = None;
        while self.ops.advance() {}
    }

    /// One engine turn. Returns false when the operation queue has
    /// drained and the session is done.
    pub(crate) fn step(&mut self) -> Result<bool, Error> {
        if !self.ops.has_active() {
            if !self.ops.advance() {
                return Ok(false);
            }
            self.file_state = FileState::Starting;
        }

        self.drive()?;
        if self.close_pending {
            self.issue_close()?;
        }
        self.flush_queued()?;
        self.process_completions()?;

        if !self.queued.is_empty() {
            // freshly produced frames to send before anything else
            return Ok(true);
        }

        if self.inflight.is_empty() {
            if self.ops.has_active() {
                if let FileState::Finished = self.file_state {
                    self.op_complete()?;
                }
            }
            return Ok(true);
        }

        let (hdr, body) = self.transport.recv()?;
        self.dispatch_reply(hdr, body)?;
        self.process_completions()?;
        Ok(true)
    }

    // Invoke the active operation's start callback. The callback polls
    // the file state and parks itself when it cannot make progress.
    fn drive(&mut self) -> Result<(), Error> {
        let op = match self.ops.take_active() {
            Some(op) => op,
            None => return Ok(()),
        };
        let res = match op {
            Op::Archive(ref args) => ctfile::archive_start(self, args),
            Op::Extract(ref args) => ctfile::extract_start(self, args),
            Op::List { .. } | Op::CullList => self.list_start(),
            Op::Delete { ref name } => self.delete_start(name),
            Op::CullCollect => self.collect_start(),
            Op::CullSetup => cull::setup_start(self),
            Op::CullShas => cull::shas_start(self),
            Op::CullComplete => cull::complete_start(self),
        };
        self.ops.put_active(op);
        res
    }

    fn list_start(&mut self) -> Result<(), Error> {
        match self.file_state {
            FileState::Starting | FileState::WaitingTrans => {}
            _ => return Ok(()),
        }
        let mut trans = match self.pool.alloc() {
            Some(t) => t,
            None => {
                self.file_state = FileState::WaitingTrans;
                return Ok(());
            }
        };
        let (hdr, body) = proto::create_list();
        trans.hdr = hdr;
        trans.set_slot(2, &body);
        trans.state = TransState::XmlList;
        self.file_state = FileState::Finished;
        self.queue_first(trans);
        Ok(())
    }

    fn delete_start(&mut self, name: &str) -> Result<(), Error> {
        match self.file_state {
            FileState::Starting | FileState::WaitingTrans => {}
            _ => return Ok(()),
        }
        let mut trans = match self.pool.alloc() {
            Some(t) => t,
            None => {
                self.file_state = FileState::WaitingTrans;
                return Ok(());
            }
        };
        let rname = ctfile::cook_name(name, self.now);
        let (hdr, body) = proto::create_delete(&rname);
        trans.hdr = hdr;
        trans.set_slot(2, &body);
        trans.state = TransState::XmlDelete;
        trans.ctfile_name = Some(rname);
        self.file_state = FileState::Finished;
        self.queue_first(trans);
        Ok(())
    }

    fn collect_start(&mut self) -> Result<(), Error> {
        if let FileState::Starting = self.file_state {
            cull::collect(self)?;
            self.file_state = FileState::Finished;
        }
        Ok(())
    }

    /// Hand a produced transaction to the pipeline. Local sentinel
    /// states skip the network and flow straight to the completer,
    /// still in id order.
    pub(crate) fn queue_first(&mut self, trans: Trans) {
        match trans.state {
            TransState::XmlClose | TransState::ExFileStart => {
                self.complete_buf.insert(trans.id, trans);
            }
            _ => self.queued.push_back(trans),
        }
    }

    // Stamp, encrypt and transmit everything queued, in id order.
    fn flush_queued(&mut self) -> Result<(), Error> {
        while let Some(mut trans) = self.queued.pop_front() {
            trans.hdr.tag = self.packet_id;
            self.packet_id += 1;

            if trans.ttype == TransType::WriteChunk
                && trans.hdr.flags.contains(HeaderFlags::ENCRYPTED)
            {
                if trans.data[0].len() >= CRYPTO_BLOCK_LEN {
                    let n = {
                        let keys = self
                            .keys
                            .as_ref()
                            .ok_or(Error::Protocol("encrypted chunk without keys"))?;
                        vault::create_iv_ctfile(&keys.ivkey, trans.chunkno, &mut trans.iv)?;
                        let (head, tail) = trans.data.split_at_mut(1);
                        tail[0].resize(head[0].len() + CRYPTO_BLOCK_LEN, 0);
                        vault::encrypt(&keys.aeskey, &trans.iv, &head[0], &mut tail[0])?
                    };
                    trans.data[1].truncate(n);
                    trans.dataslot = 1;
                } else {
                    // nothing a block cipher can do with a sub-block
                    // tail; it ships in the clear
                    trans.hdr.flags.remove(HeaderFlags::ENCRYPTED);
                }
            }

            trans.hdr.size = trans.payload().len() as u32;
            self.transport.send(&trans.hdr, trans.payload())?;
            self.inflight.insert(trans.hdr.tag, trans);
        }
        Ok(())
    }

    // Correlate a reply with its transaction by tag and advance the
    // transaction state machine.
    fn dispatch_reply(&mut self, hdr: Header, body: Vec<u8>) -> Result<(), Error> {
        if hdr.version != wire::HDR_VERSION {
            return Err(Error::Protocol("bad header version in reply"));
        }
        let mut trans = self
            .inflight
            .remove(&hdr.tag)
            .ok_or(Error::Protocol("reply for unknown tag"))?;

        match trans.state {
            TransState::XmlOpen
            | TransState::XmlClosing
            | TransState::XmlList
            | TransState::XmlDelete
            | TransState::XmlCullSend
            | TransState::XmlCullShaSend
            | TransState::XmlCullCompleteSend => {
                proto::handle_xml_reply(self, &mut trans, &hdr, &body)?;
            }
            TransState::Read => {
                // write chunk ack; EXISTS means the server already had it
                match hdr.status {
                    status::OK | status::EXISTS => {
                        trans.hdr.status = hdr.status;
                        trans.state = TransState::WmdReady;
                    }
                    other => return Err(Error::Server(other)),
                }
            }
            TransState::ExSha => {
                trans.hdr.status = hdr.status;
                if hdr.status == status::OK {
                    if hdr.flags.contains(HeaderFlags::ENCRYPTED) {
                        trans.set_slot(0, &body);
                        trans.state = TransState::ExRead;
                        let n = {
                            let keys = self
                                .keys
                                .as_ref()
                                .ok_or(Error::Protocol("encrypted chunk without keys"))?;
                            let (head, tail) = trans.data.split_at_mut(1);
                            tail[0].resize(head[0].len(), 0);
                            vault::decrypt(&keys.aeskey, &trans.iv, &head[0], &mut tail[0])?
                        };
                        trans.data[1].truncate(n);
                        trans.dataslot = 1;
                        trans.state = TransState::ExDecrypted;
                    } else {
                        trans.set_slot(0, &body);
                        trans.state = TransState::ExRead;
                    }
                } else {
                    // past the last chunk; the first miss ends the file
                    let first = match self.op_priv {
                        Some(OpPriv::Extract(ref mut st)) => {
                            let first = !st.eof_seen;
                            st.eof_seen = true;
                            first
                        }
                        _ => {
                            return Err(Error::Protocol(
                                "read chunk reply without extract state",
                            ))
                        }
                    };
                    if first {
                        trans.state = TransState::ExFileEnd;
                        trans.eof = true;
                        self.file_state = FileState::Finished;
                    } else {
                        trans.state = TransState::WmdReady;
                    }
                }
            }
            _ => return Err(Error::Protocol("unexpected transaction state for reply")),
        }

        self.complete_buf.insert(trans.id, trans);
        Ok(())
    }

    // Deliver completions strictly in transaction id order.
    fn process_completions(&mut self) -> Result<(), Error> {
        loop {
            let trans = match self.complete_buf.remove(&self.next_complete_id) {
                Some(t) => t,
                None => return Ok(()),
            };
            self.next_complete_id += 1;
            self.complete_one(trans)?;
        }
    }

    fn complete_one(&mut self, mut trans: Trans) -> Result<(), Error> {
        enum Post {
            Nothing,
            Close,
            OpComplete,
            Wake,
        }

        let post = match trans.state {
            TransState::ExFileStart => match self.op_priv {
                Some(OpPriv::Extract(ref mut st)) => {
                    if let Some(dir) = st.target.parent() {
                        fs::create_dir_all(dir)?;
                    }
                    st.writer = Some(File::create(&st.target)?);
                    Post::Nothing
                }
                _ => return Err(Error::Protocol("file start without extract state")),
            },
            TransState::ExRead | TransState::ExDecrypted | TransState::ExUncompressed => {
                if trans.hdr.status == status::OK {
                    match self.op_priv {
                        Some(OpPriv::Extract(ref mut st)) => {
                            let w = st
                                .writer
                                .as_mut()
                                .ok_or(Error::Protocol("no open extract file"))?;
                            debug!("writing packet sz {}", trans.payload().len());
                            w.write_all(trans.payload())?;
                        }
                        _ => return Err(Error::Protocol("extract data without extract state")),
                    }
                } else {
                    self.file_state = FileState::Finished;
                }
                Post::Nothing
            }
            TransState::WmdReady => {
                if trans.eof {
                    trans.fnode.take();
                }
                Post::Nothing
            }
            TransState::ExFileEnd => {
                if let Some(OpPriv::Extract(ref mut st)) = self.op_priv {
                    st.writer.take();
                    st.fnode.take();
                }
                debug!("eof reached, closing file");
                Post::Close
            }
            TransState::XmlClose => {
                trans.fnode.take();
                debug!("eof reached, closing file");
                Post::Close
            }
            TransState::XmlOpened | TransState::Read | TransState::XmlClosing => Post::Nothing,
            TransState::XmlClosed | TransState::Done => Post::OpComplete,
            TransState::XmlCullReplied => Post::Wake,
            _ => return Err(Error::Protocol("unexpected transaction state in completer")),
        };

        self.pool.complete(trans);

        match post {
            Post::Close => self.issue_close()?,
            Post::OpComplete => self.op_complete()?,
            Post::Wake => self.file_state = FileState::Running,
            Post::Nothing => {}
        }
        Ok(())
    }

    fn issue_close(&mut self) -> Result<(), Error> {
        match self.pool.alloc() {
            Some(mut trans) => {
                let (hdr, body) = proto::create_close();
                trans.hdr = hdr;
                trans.set_slot(2, &body);
                trans.state = TransState::XmlClosing;
                self.queued.push_back(trans);
                self.close_pending = false;
            }
            None => {
                debug!("ran out of transactions, waiting to close");
                self.close_pending = true;
            }
        }
        Ok(())
    }

    // The active operation's terminal transaction has completed: run
    // its completion behavior, release its state and move on.
    fn op_complete(&mut self) -> Result<(), Error> {
        let op = self
            .ops
            .take_active()
            .ok_or(Error::Protocol("operation completion without active operation"))?;

        match op {
            Op::List {
                mode,
                ref patterns,
                ref excludes,
            } => {
                let names = ::std::mem::replace(&mut self.ctfile_list, Vec::new());
                self.list_results = ctfile::list_filter(names, mode, patterns, excludes);
            }
            Op::CullList => cull::fetch_all(self)?,
            Op::CullComplete => {
                debug!(
                    "shacnt {} sha payload {}",
                    self.cull.shacnt, self.cull.sha_payload_sz
                );
            }
            _ => {}
        }

        self.op_priv = None;
        self.ops.advance();
        self.file_state = FileState::Starting;
        Ok(())
    }
}
