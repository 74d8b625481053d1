use std::path::PathBuf;

use vault::IV_LEN;
use wire::Header;

/// Payload slots per transaction. Slot 0 carries plaintext, slot 1
/// ciphertext, slot 2 control bodies; `dataslot` names the live one.
pub const TRANS_SLOTS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransState {
    Alloc,
    Read,
    WmdReady,
    ExFileStart,
    ExSha,
    ExRead,
    ExDecrypted,
    ExUncompressed,
    ExFileEnd,
    XmlOpen,
    XmlOpened,
    XmlList,
    XmlDelete,
    XmlCullSend,
    XmlCullShaSend,
    XmlCullCompleteSend,
    XmlCullReplied,
    XmlClose,
    XmlClosing,
    XmlClosed,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransType {
    Nop,
    ReadChunk,
    WriteChunk,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    Regular,
    Dir,
    Symlink,
}

/// Metadata of the local file an operation streams. The producer owns
/// it while streaming; it travels on the terminal transaction and is
/// released by the completer.
#[derive(Debug)]
pub struct FileNode {
    pub name: String,
    pub ftype: FileType,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub atime: i64,
    pub mtime: i64,
    pub parent_dir: PathBuf,
}

/// One unit of work in the pipeline. Records are owned by exactly one
/// stage at a time and move by value: producer, cryptor, network out,
/// network in, completer, pool.
#[derive(Debug)]
pub struct Trans {
    pub id: u64,
    pub state: TransState,
    pub ttype: TransType,
    pub data: [Vec<u8>; TRANS_SLOTS],
    pub dataslot: usize,
    pub chunkno: u32,
    pub iv: [u8; IV_LEN],
    pub fnode: Option<FileNode>,
    pub eof: bool,
    pub hdr: Header,
    pub ctfile_name: Option<String>,
}

impl Trans {
    fn new(id: u64, slot_capacity: usize) -> Self {
        Trans {
            id,
            state: TransState::Alloc,
            ttype: TransType::Nop,
            data: [
                Vec::with_capacity(slot_capacity),
                Vec::with_capacity(slot_capacity),
                Vec::with_capacity(slot_capacity),
            ],
            dataslot: 0,
            chunkno: 0,
            iv: [0; IV_LEN],
            fnode: None,
            eof: false,
            hdr: Header::new(0, 0),
            ctfile_name: None,
        }
    }

    fn reset(&mut self, id: u64) {
        self.id = id;
        self.state = TransState::Alloc;
        self.ttype = TransType::Nop;
        for slot in self.data.iter_mut() {
            slot.clear();
        }
        self.dataslot = 0;
        self.chunkno = 0;
        self.iv = [0; IV_LEN];
        self.fnode = None;
        self.eof = false;
        self.hdr = Header::new(0, 0);
        self.ctfile_name = None;
    }

    pub fn set_slot(&mut self, slot: usize, bytes: &[u8]) {
        self.data[slot].clear();
        self.data[slot].extend_from_slice(bytes);
        self.dataslot = slot;
    }

    /// The live payload.
    pub fn payload(&self) -> &[u8] {
        &self.data[self.dataslot]
    }
}

/// Fixed-capacity pool of transaction records. `alloc` hands out
/// records with fresh monotonic ids until the capacity is reached; a
/// saturated pool returns `None` and the caller parks itself in
/// `WaitingTrans` until a completion recycles a record.
pub struct TransPool {
    free: Vec<Trans>,
    capacity: usize,
    outstanding: usize,
    slot_capacity: usize,
    next_id: u64,
}

impl TransPool {
    pub fn new(capacity: usize, slot_capacity: usize) -> Self {
        TransPool {
            free: Vec::with_capacity(capacity),
            capacity,
            outstanding: 0,
            slot_capacity,
            next_id: 1,
        }
    }

    pub fn alloc(&mut self) -> Option<Trans> {
        if self.outstanding == self.capacity {
            return None;
        }

        let id = self.next_id;
        self.next_id += 1;
        self.outstanding += 1;

        match self.free.pop() {
            Some(mut t) => {
                t.reset(id);
                Some(t)
            }
            None => Some(Trans::new(id, self.slot_capacity)),
        }
    }

    /// Return a record to the pool after its completion.
    pub fn complete(&mut self, trans: Trans) {
        debug_assert!(self.outstanding > 0);
        self.outstanding -= 1;
        self.free.push(trans);
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding
    }
}
