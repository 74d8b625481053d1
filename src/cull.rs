use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use chrono::Duration;
use rand;

use ctfile;
use error::Error;
use ops::{CtfileOpArgs, Op};
use proto;
use session::{FileState, Session, Transport};
use trans::TransState;
use wire::SHA_DIGEST_LEN;

/// Batch bound for a single cull sha packet.
pub const SHA_PER_PACKET: usize = 1000;

/// One referenced chunk as a ctfile records it: the plain identifier
/// and, when the ctfile is crypto-enabled, the encrypted-sha variant.
#[derive(Debug, Clone, Copy)]
pub struct ChunkRef {
    pub sha: [u8; SHA_DIGEST_LEN],
    pub csha: [u8; SHA_DIGEST_LEN],
}

/// What the cull needs from one parsed ctfile.
#[derive(Debug, Clone)]
pub struct CtfileRefs {
    pub previous: Option<String>,
    pub crypto: bool,
    pub chunks: Vec<ChunkRef>,
}

/// The local ctfile catalog, an external collaborator: the on-disk
/// catalog format is not the engine's business, only what it says.
pub trait CtfileStore {
    /// Is this remote name already present in the local cache?
    fn contains(&self, name: &str) -> bool;

    /// The `previous` backup-chain link of a cached ctfile.
    fn previous_of(&self, name: &str) -> Result<Option<String>, Error>;

    /// Every chunk referenced by a cached ctfile.
    fn chunk_refs(&self, name: &str) -> Result<CtfileRefs, Error>;

    /// Full parse pass over a local ctfile, used to refuse archiving a
    /// corrupt catalog before any bytes hit the wire.
    fn validate(&self, path: &Path) -> Result<(), Error>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CullMode {
    Precious,
    Process,
}

impl CullMode {
    pub fn name(&self) -> &'static str {
        match *self {
            CullMode::Precious => "precious",
            CullMode::Process => "process",
        }
    }
}

/// Cull bookkeeping, alive for the duration of the cull operation
/// chain. `shacnt` mirrors the set size at all times.
pub(crate) struct CullState {
    pub shas: BTreeSet<[u8; SHA_DIGEST_LEN]>,
    pub shacnt: u64,
    pub sha_payload_sz: u64,
    pub uuid: u64,
    pub sent_complete: bool,
    /// Remote name to keep-count for every ctfile seen by the list.
    pub all_ctfiles: BTreeMap<String, u32>,
}

impl CullState {
    pub fn new() -> Self {
        CullState {
            shas: BTreeSet::new(),
            shacnt: 0,
            sha_payload_sz: 0,
            uuid: 0,
            sent_complete: false,
            all_ctfiles: BTreeMap::new(),
        }
    }

    pub fn sha_insert(&mut self, sha: [u8; SHA_DIGEST_LEN]) {
        if self.shas.insert(sha) {
            self.shacnt += 1;
        }
    }
}

/// Completion of the cull's list op: every remote ctfile matching the
/// date-stamped name form is recorded, and the ones missing from the
/// cache get an extract spliced in right after this op.
pub(crate) fn fetch_all<S: CtfileStore, T: Transport>(
    sess: &mut Session<S, T>,
) -> Result<(), Error> {
    let names = ::std::mem::replace(&mut sess.ctfile_list, Vec::new());
    for name in names {
        if !ctfile::is_cooked_name(&name) {
            continue;
        }
        if !sess.store.contains(&name) {
            debug!("getting {}", name);
            sess.ops.add_after_active(Op::Extract(CtfileOpArgs {
                localname: name.clone(),
                remotename: Some(name.clone()),
                tdir: Some(sess.config.ctfile_cachedir.clone()),
                ctfile: true,
                encrypted: false,
            }));
        } else {
            debug!("already got {}", name);
        }
        sess.cull.all_ctfiles.insert(name, 0);
    }
    Ok(())
}

// A name is older than the threshold when its date prefix compares
// lexicographically below it, the prefix comparison the date-stamped
// name form was designed for.
fn older_than(name: &str, threshold: &str) -> bool {
    let n = name.as_bytes();
    let t = threshold.as_bytes();
    if n.len() < t.len() {
        return n < &t[..n.len()] || n == &t[..n.len()];
    }
    &n[..t.len()] < t
}

/// Walk every chunk reference of `name` and its whole `previous`
/// chain into the session's chunk set, dropping duplicates.
pub(crate) fn add_shafile<S: CtfileStore>(
    store: &S,
    cull: &mut CullState,
    name: &str,
) -> Result<(), Error> {
    let mut seen = BTreeSet::new();
    let mut cur = name.to_string();
    loop {
        if !seen.insert(cur.clone()) {
            warn!("previous chain of {} loops at {}", name, cur);
            break;
        }
        debug!("processing [{}]", cur);
        let refs = store.chunk_refs(&cur)?;
        for c in refs.chunks {
            cull.sha_insert(if refs.crypto { c.csha } else { c.sha });
        }
        match refs.previous {
            Some(p) => cur = p,
            None => break,
        }
    }
    Ok(())
}

/// Partition the listed ctfiles into keep and delete sets, walk the
/// keep set's previous chains, enqueue deletes for the losers and
/// collect chunk references of the keepers.
pub(crate) fn collect<S: CtfileStore, T: Transport>(
    sess: &mut Session<S, T>,
) -> Result<(), Error> {
    if sess.config.ctfile_keep_days == 0 {
        return Err(Error::Config(
            "cull: ctfile_keep_days must be specified in config",
        ));
    }

    let threshold = (sess.now - Duration::days(sess.config.ctfile_keep_days as i64))
        .format("%Y%m%d-%H%M%S")
        .to_string();

    let mut keep_files = 0;
    for (name, keep) in sess.cull.all_ctfiles.iter_mut() {
        if older_than(name, &threshold) {
            *keep = 0;
        } else {
            *keep = 1;
            keep_files += 1;
        }
    }

    if keep_files == 0 {
        return Err(Error::Fatal(
            "All ctfiles are old and would be deleted, aborting.".to_string(),
        ));
    }

    // Anything an up-to-date backup still references must survive,
    // however old it is.
    let roots: Vec<String> = sess
        .cull
        .all_ctfiles
        .iter()
        .filter(|&(_, &keep)| keep > 0)
        .map(|(name, _)| name.clone())
        .collect();
    for root in roots {
        let mut seen = BTreeSet::new();
        seen.insert(root.clone());
        let mut prev = sess.store.previous_of(&root)?;
        while let Some(p) = prev {
            if !seen.insert(p.clone()) {
                warn!("previous chain of {} loops at {}", root, p);
                break;
            }
            match sess.cull.all_ctfiles.get_mut(&p) {
                Some(keep) => {
                    if *keep == 0 {
                        info!(
                            "Warning, old ctfile {} still referenced by newer backups, keeping",
                            p
                        );
                    }
                    *keep += 1;
                    prev = sess.store.previous_of(&p)?;
                }
                None => {
                    warn!("file not found in ctfile list [{}]", p);
                    prev = None;
                }
            }
        }
    }

    let files: Vec<(String, u32)> = sess
        .cull
        .all_ctfiles
        .iter()
        .map(|(name, &keep)| (name.clone(), keep))
        .collect();
    for (name, keep) in files {
        if keep == 0 {
            debug!("adding {} to delete list", name);
            sess.ops.add(Op::Delete { name });
        } else {
            debug!("adding {} to keep list", name);
            add_shafile(&sess.store, &mut sess.cull, &name)?;
        }
    }

    sess.cull.all_ctfiles.clear();
    Ok(())
}

pub(crate) fn setup_start<S: CtfileStore, T: Transport>(
    sess: &mut Session<S, T>,
) -> Result<(), Error> {
    match sess.file_state {
        FileState::Starting => {
            sess.cull.uuid = rand::random::<u64>();
            sess.cull.sha_payload_sz = 0;
            debug!("cull_setup, shacnt {}", sess.cull.shacnt);
        }
        FileState::WaitingServer | FileState::Finished => return Ok(()),
        _ => {}
    }
    sess.file_state = FileState::Running;

    let mut trans = match sess.pool.alloc() {
        Some(t) => t,
        None => {
            sess.file_state = FileState::WaitingTrans;
            return Ok(());
        }
    };

    let (hdr, body) = proto::create_cull_setup(sess.cull.uuid, CullMode::Precious);
    trans.hdr = hdr;
    trans.set_slot(2, &body);
    trans.state = TransState::XmlCullSend;
    sess.file_state = FileState::WaitingServer;
    sess.queue_first(trans);
    Ok(())
}

/// Ship one batch of up to [`SHA_PER_PACKET`] chunk identifiers, remove
/// them from the set, and flag eof on the batch that empties it.
pub(crate) fn shas_start<S: CtfileStore, T: Transport>(
    sess: &mut Session<S, T>,
) -> Result<(), Error> {
    match sess.file_state {
        FileState::WaitingServer | FileState::Finished => return Ok(()),
        _ => {}
    }
    if sess.cull.shacnt == 0 || sess.cull.shas.is_empty() {
        sess.file_state = FileState::Finished;
        return Ok(());
    }
    sess.file_state = FileState::Running;

    let mut trans = match sess.pool.alloc() {
        Some(t) => t,
        None => {
            sess.file_state = FileState::WaitingTrans;
            return Ok(());
        }
    };

    let batch: Vec<[u8; SHA_DIGEST_LEN]> = sess
        .cull
        .shas
        .iter()
        .take(SHA_PER_PACKET)
        .cloned()
        .collect();
    for sha in &batch {
        sess.cull.shas.remove(sha);
    }
    sess.cull.shacnt -= batch.len() as u64;

    let (hdr, body) = proto::create_cull_shas(sess.cull.uuid, &batch);
    sess.cull.sha_payload_sz += hdr.size as u64;
    debug!("sending shas len {}", hdr.size);

    trans.hdr = hdr;
    trans.set_slot(2, &body);
    trans.state = TransState::XmlCullShaSend;

    if sess.cull.shacnt == 0 {
        debug!("shacnt {}", sess.cull.shacnt);
        trans.eof = true;
        sess.file_state = FileState::Finished;
    } else {
        sess.file_state = FileState::WaitingServer;
    }
    sess.queue_first(trans);
    Ok(())
}

/// Send the final cull commit exactly once; reentry after `sent_complete`
/// is a no-op.
pub(crate) fn complete_start<S: CtfileStore, T: Transport>(
    sess: &mut Session<S, T>,
) -> Result<(), Error> {
    match sess.file_state {
        FileState::WaitingServer | FileState::Finished => return Ok(()),
        _ => {}
    }
    if sess.cull.sent_complete {
        sess.file_state = FileState::Finished;
        return Ok(());
    }

    let mut trans = match sess.pool.alloc() {
        Some(t) => t,
        None => {
            sess.file_state = FileState::WaitingTrans;
            return Ok(());
        }
    };
    sess.cull.sent_complete = true;

    debug!("send cull_complete");
    let (hdr, body) = proto::create_cull_complete(sess.cull.uuid, CullMode::Process);
    trans.hdr = hdr;
    trans.set_slot(2, &body);
    trans.state = TransState::XmlCullCompleteSend;
    sess.file_state = FileState::Finished;
    sess.queue_first(trans);
    Ok(())
}
