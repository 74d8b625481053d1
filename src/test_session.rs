use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fs;
use std::path::Path;
use std::time::Duration;

use byteorder::{BigEndian, ByteOrder};
use chrono::{NaiveDate, NaiveDateTime};
use hex;
use tempfile::tempdir;

use config::Config;
use cull::{ChunkRef, CtfileRefs, CtfileStore};
use error::Error;
use ops::MatchMode;
use proto::{self, OpenMode};
use session::{Session, Transport};
use vault;
use wire::{opcode, status, Header, HeaderFlags, SHA_DIGEST_LEN};

fn attr(text: &str, key: &str) -> Option<String> {
    let needle = format!("{}=\"", key);
    let at = text.find(&needle)?;
    let tail = &text[at + needle.len()..];
    let end = tail.find('"')?;
    Some(tail[..end].to_string())
}

/// Scripted server: answers every frame the moment it is sent, so the
/// client's receive loop always has the next reply available.
#[derive(Default)]
struct FakeServer {
    sent: Vec<(Header, Vec<u8>)>,
    replies: VecDeque<(Header, Vec<u8>)>,
    listing: Vec<String>,
    chunks: Vec<Vec<u8>>,
    encrypted_chunks: bool,
    fail_open: bool,
    reorder_acks: bool,
}

impl FakeServer {
    fn reply_for(&self, hdr: &Header, body: &[u8]) -> (Header, Vec<u8>) {
        match hdr.opcode {
            opcode::WRITE_CHUNK => {
                let mut h = Header::new(0, opcode::WRITE_CHUNK);
                h.status = status::OK;
                (h, Vec::new())
            }
            opcode::READ_CHUNK => {
                let chunkno = BigEndian::read_u32(body) as usize;
                let mut h = Header::new(0, opcode::READ_CHUNK);
                if chunkno < self.chunks.len() {
                    h.status = status::OK;
                    h.flags = HeaderFlags::METADATA;
                    if self.encrypted_chunks {
                        h.flags |= HeaderFlags::ENCRYPTED;
                    }
                    (h, self.chunks[chunkno].clone())
                } else {
                    h.status = status::DOESNTEXIST;
                    (h, Vec::new())
                }
            }
            opcode::XML => {
                let text = String::from_utf8(body.to_vec()).unwrap();
                let mut h = Header::new(0, opcode::XML_REPLY);
                h.status = status::OK;
                let rbody = if text.contains("ct_md_open") {
                    if self.fail_open {
                        h.status = status::FAIL;
                    }
                    format!(
                        "<ct_md_open_read_reply><file name=\"{}\"/></ct_md_open_read_reply>",
                        attr(&text, "name").unwrap_or_default()
                    )
                } else if text.contains("ct_md_close") {
                    "<ct_md_close_reply></ct_md_close_reply>".to_string()
                } else if text.contains("ct_md_list") {
                    let mut b = String::from("<ct_md_list_reply>");
                    for name in &self.listing {
                        b.push_str(&format!("<file name=\"{}\"/>", name));
                    }
                    b.push_str("</ct_md_list_reply>");
                    b
                } else if text.contains("ct_md_delete") {
                    format!(
                        "<ct_md_delete_reply><file name=\"{}\"/></ct_md_delete_reply>",
                        attr(&text, "name").unwrap_or_default()
                    )
                } else if text.contains("ct_cull_setup") {
                    "<ct_cull_setup_reply></ct_cull_setup_reply>".to_string()
                } else if text.contains("ct_cull_shas") {
                    "<ct_cull_shas_reply></ct_cull_shas_reply>".to_string()
                } else if text.contains("ct_cull_complete") {
                    "<ct_cull_complete_reply></ct_cull_complete_reply>".to_string()
                } else {
                    panic!("unhandled control body: {}", text)
                };
                (h, rbody.into_bytes())
            }
            other => panic!("unhandled opcode {}", other),
        }
    }

    fn xml_bodies(&self) -> Vec<String> {
        self.sent
            .iter()
            .filter(|&&(ref h, _)| h.opcode == opcode::XML)
            .map(|&(_, ref b)| String::from_utf8(b.clone()).unwrap())
            .collect()
    }

    fn write_payloads(&self) -> Vec<Vec<u8>> {
        self.sent
            .iter()
            .filter(|&&(ref h, _)| h.opcode == opcode::WRITE_CHUNK)
            .map(|&(_, ref b)| b.clone())
            .collect()
    }
}

impl Transport for FakeServer {
    fn send(&mut self, hdr: &Header, body: &[u8]) -> Result<(), Error> {
        self.sent.push((*hdr, body.to_vec()));
        let (mut rhdr, rbody) = self.reply_for(hdr, body);
        rhdr.tag = hdr.tag;
        rhdr.size = rbody.len() as u32;
        if self.reorder_acks && hdr.opcode == opcode::WRITE_CHUNK {
            self.replies.push_front((rhdr, rbody));
        } else {
            self.replies.push_back((rhdr, rbody));
        }
        Ok(())
    }

    fn recv(&mut self) -> Result<(Header, Vec<u8>), Error> {
        self.replies
            .pop_front()
            .ok_or(Error::Protocol("fake server has no reply queued"))
    }

    fn recv_timeout(&mut self, _timeout: Duration) -> Result<(Header, Vec<u8>), Error> {
        self.recv()
    }
}

#[derive(Default)]
struct FakeStore {
    cached: BTreeSet<String>,
    prev: BTreeMap<String, String>,
    refs: BTreeMap<String, Vec<[u8; SHA_DIGEST_LEN]>>,
    crypto: bool,
}

impl CtfileStore for FakeStore {
    fn contains(&self, name: &str) -> bool {
        self.cached.contains(name)
    }

    fn previous_of(&self, name: &str) -> Result<Option<String>, Error> {
        Ok(self.prev.get(name).cloned())
    }

    fn chunk_refs(&self, name: &str) -> Result<CtfileRefs, Error> {
        let shas = self.refs.get(name).cloned().unwrap_or_default();
        Ok(CtfileRefs {
            previous: self.prev.get(name).cloned(),
            crypto: self.crypto,
            chunks: shas
                .into_iter()
                .map(|sha| ChunkRef {
                    sha,
                    csha: [0; SHA_DIGEST_LEN],
                })
                .collect(),
        })
    }

    fn validate(&self, _path: &Path) -> Result<(), Error> {
        Ok(())
    }
}

fn config(cachedir: &Path) -> Config {
    let mut c = Config::default();
    c.ctfile_cachedir = cachedir.to_path_buf();
    c.max_block_size = 2048;
    c.trans_capacity = 8;
    c
}

fn clock() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 7, 1)
        .unwrap()
        .and_hms_opt(0, 0, 0)
        .unwrap()
}

fn test_keys() -> ([u8; vault::KEY_LEN], [u8; vault::IV_LEN]) {
    let mut aes = [0u8; vault::KEY_LEN];
    let mut iv = [0u8; vault::IV_LEN];
    for i in 0..aes.len() {
        aes[i] = (i * 3) as u8;
    }
    for i in 0..iv.len() {
        iv[i] = 0x51 ^ i as u8;
    }
    (aes, iv)
}

fn sha(b: u8) -> [u8; SHA_DIGEST_LEN] {
    [b; SHA_DIGEST_LEN]
}

#[test]
fn archive_of_empty_file_closes_immediately() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("empty.ct"), b"").unwrap();

    let mut sess = Session::new(config(dir.path()), FakeStore::default(), FakeServer::default())
        .unwrap();
    sess.archive("empty.ct", None, Some(dir.path()), false, false)
        .unwrap();
    sess.run().unwrap();

    assert!(sess.transport.write_payloads().is_empty());
    let xml = sess.transport.xml_bodies();
    assert_eq!(xml.len(), 2);
    assert!(xml[0].contains("ct_md_open_create"));
    assert!(xml[1].contains("ct_md_close"));
    assert_eq!(sess.stats().bytes_tot, 0);
}

#[test]
fn archive_streams_file_in_blocks() {
    let dir = tempdir().unwrap();
    let content: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
    fs::write(dir.path().join("data.ct"), &content).unwrap();

    let mut sess = Session::new(config(dir.path()), FakeStore::default(), FakeServer::default())
        .unwrap();
    sess.archive("data.ct", None, Some(dir.path()), false, false)
        .unwrap();
    sess.run().unwrap();

    let payloads = sess.transport.write_payloads();
    assert_eq!(payloads.len(), 3);
    assert_eq!(payloads[0].len(), 2048);
    assert_eq!(payloads[1].len(), 2048);
    assert_eq!(payloads[2].len(), 904);
    let streamed: Vec<u8> = payloads.into_iter().flat_map(|p| p).collect();
    assert_eq!(streamed, content);

    assert_eq!(sess.stats().bytes_read, 5000);
    assert_eq!(sess.stats().bytes_tot, 5000);
    assert_eq!(sess.stats().truncations, 0);
}

#[test]
fn archive_with_tiny_pool_backpressures_and_resumes() {
    let dir = tempdir().unwrap();
    let content = vec![0xabu8; 9 * 1024];
    fs::write(dir.path().join("big.ct"), &content).unwrap();

    let mut cfg = config(dir.path());
    cfg.trans_capacity = 2;
    let mut sess = Session::new(cfg, FakeStore::default(), FakeServer::default()).unwrap();
    sess.archive("big.ct", None, Some(dir.path()), false, false)
        .unwrap();
    sess.run().unwrap();

    let total: usize = sess.transport.write_payloads().iter().map(|p| p.len()).sum();
    assert_eq!(total, content.len());
}

#[test]
fn archive_survives_reordered_acks() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("r.ct"), vec![5u8; 8 * 1024]).unwrap();

    let mut server = FakeServer::default();
    server.reorder_acks = true;
    let mut sess = Session::new(config(dir.path()), FakeStore::default(), server).unwrap();
    sess.archive("r.ct", None, Some(dir.path()), false, false)
        .unwrap();
    sess.run().unwrap();

    let total: usize = sess.transport.write_payloads().iter().map(|p| p.len()).sum();
    assert_eq!(total, 8 * 1024);
}

#[test]
fn archive_encrypts_chunks_on_the_wire() {
    let dir = tempdir().unwrap();
    let content = vec![0x77u8; 3000];
    fs::write(dir.path().join("enc.ct"), &content).unwrap();

    let (aeskey, ivkey) = test_keys();
    let mut sess = Session::new(config(dir.path()), FakeStore::default(), FakeServer::default())
        .unwrap();
    sess.load_keys(aeskey, ivkey);
    sess.archive("enc.ct", None, Some(dir.path()), true, false)
        .unwrap();
    sess.run().unwrap();

    let frames: Vec<(Header, Vec<u8>)> = sess
        .transport
        .sent
        .iter()
        .filter(|&&(ref h, _)| h.opcode == opcode::WRITE_CHUNK)
        .cloned()
        .collect();
    assert_eq!(frames.len(), 2);

    // every chunk is encrypted with its deterministic per-chunk iv
    let mut recovered = Vec::new();
    for (chunkno, &(ref hdr, ref payload)) in frames.iter().enumerate() {
        assert!(hdr.flags.contains(HeaderFlags::ENCRYPTED));
        assert!(hdr.flags.contains(HeaderFlags::METADATA));

        let mut iv = [0u8; vault::IV_LEN];
        vault::create_iv_ctfile(&ivkey, chunkno as u32, &mut iv).unwrap();
        let mut plain = vec![0u8; payload.len()];
        let n = vault::decrypt(&aeskey, &iv, payload, &mut plain).unwrap();
        recovered.extend_from_slice(&plain[..n]);
    }
    assert_eq!(recovered, content);
}

#[test]
fn archive_warns_when_file_shrinks_mid_stream() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("shrink.ct");
    fs::write(&path, vec![1u8; 4096]).unwrap();

    let mut cfg = config(dir.path());
    cfg.max_block_size = 4096;
    let mut sess = Session::new(cfg, FakeStore::default(), FakeServer::default()).unwrap();
    sess.archive("shrink.ct", None, Some(dir.path()), false, false)
        .unwrap();

    // first turn performs the stat and the remote open only
    assert!(sess.step().unwrap());
    fs::write(&path, vec![1u8; 2048]).unwrap();

    sess.run().unwrap();

    assert_eq!(sess.stats().truncations, 1);
    let payloads = sess.transport.write_payloads();
    assert_eq!(payloads.len(), 1);
    assert_eq!(payloads[0].len(), 2048);
}

#[test]
fn extract_writes_chunks_to_local_file() {
    let dir = tempdir().unwrap();

    let mut server = FakeServer::default();
    server.chunks = vec![b"hello, ".to_vec(), b"world".to_vec()];
    let mut cfg = config(dir.path());
    cfg.trans_capacity = 4;
    let mut sess = Session::new(cfg, FakeStore::default(), server).unwrap();
    sess.extract("out.ct", Some("20240101-000000-out"), Some(dir.path()))
        .unwrap();
    sess.run().unwrap();

    let written = fs::read(dir.path().join("out.ct")).unwrap();
    assert_eq!(written, b"hello, world");

    let xml = sess.transport.xml_bodies();
    assert!(xml.first().unwrap().contains("ct_md_open_read"));
    assert!(xml.last().unwrap().contains("ct_md_close"));
}

#[test]
fn extract_decrypts_encrypted_chunks() {
    let dir = tempdir().unwrap();
    let (aeskey, ivkey) = test_keys();

    let plains: Vec<Vec<u8>> = vec![vec![0x10u8; 64], vec![0x20u8; 50]];
    let mut server = FakeServer::default();
    server.encrypted_chunks = true;
    for (chunkno, plain) in plains.iter().enumerate() {
        let mut iv = [0u8; vault::IV_LEN];
        vault::create_iv_ctfile(&ivkey, chunkno as u32, &mut iv).unwrap();
        let mut ciphertext = vec![0u8; plain.len() + vault::CRYPTO_BLOCK_LEN];
        let n = vault::encrypt(&aeskey, &iv, plain, &mut ciphertext).unwrap();
        ciphertext.truncate(n);
        server.chunks.push(ciphertext);
    }

    let mut cfg = config(dir.path());
    cfg.trans_capacity = 4;
    let mut sess = Session::new(cfg, FakeStore::default(), server).unwrap();
    sess.load_keys(aeskey, ivkey);
    sess.extract("enc.ct", Some("20240101-000000-enc"), Some(dir.path()))
        .unwrap();
    sess.run().unwrap();

    let written = fs::read(dir.path().join("enc.ct")).unwrap();
    let expected: Vec<u8> = plains.into_iter().flat_map(|p| p).collect();
    assert_eq!(written, expected);
}

#[test]
fn list_applies_patterns_and_excludes() {
    let dir = tempdir().unwrap();
    let mut server = FakeServer::default();
    server.listing = vec![
        "20240101-000000-alpha".to_string(),
        "20240101-000000-beta".to_string(),
        "stray".to_string(),
    ];

    let mut sess = Session::new(config(dir.path()), FakeStore::default(), server).unwrap();
    sess.list(
        MatchMode::Substring,
        vec!["2024".to_string()],
        vec!["beta".to_string()],
    );
    sess.run().unwrap();

    assert_eq!(sess.list_results(), ["20240101-000000-alpha"]);
}

#[test]
fn delete_sends_the_cooked_name() {
    let dir = tempdir().unwrap();
    let mut sess = Session::new(config(dir.path()), FakeStore::default(), FakeServer::default())
        .unwrap();
    sess.set_clock(clock());
    sess.delete("stale-backup").unwrap();
    sess.run().unwrap();

    let xml = sess.transport.xml_bodies();
    assert_eq!(xml.len(), 1);
    assert!(xml[0].contains("ct_md_delete"));
    assert!(xml[0].contains("name=\"20240701-000000-stale-backup\""));
}

#[test]
fn rejected_names_never_reach_the_queue() {
    let dir = tempdir().unwrap();
    let mut sess = Session::new(config(dir.path()), FakeStore::default(), FakeServer::default())
        .unwrap();
    assert!(sess.archive("a/b", None, None, false, false).is_err());
    assert!(sess.delete("bad:name").is_err());
    // nothing queued, session ends immediately
    sess.run().unwrap();
    assert!(sess.transport.sent.is_empty());
}

fn cull_session(
    listing: &[&str],
    store: FakeStore,
    keep_days: u64,
    cachedir: &Path,
) -> Session<FakeStore, FakeServer> {
    let mut server = FakeServer::default();
    server.listing = listing.iter().map(|s| s.to_string()).collect();

    let mut cfg = config(cachedir);
    cfg.ctfile_keep_days = keep_days;
    let mut sess = Session::new(cfg, store, server).unwrap();
    sess.set_clock(clock());
    sess.cull();
    sess
}

#[test]
fn cull_refuses_to_delete_everything() {
    let dir = tempdir().unwrap();
    let names = ["20180101-000000-old1", "20180501-000000-old2"];
    let mut store = FakeStore::default();
    for n in &names {
        store.cached.insert(n.to_string());
    }

    let mut sess = cull_session(&names, store, 3650, dir.path());
    // a ten-year window still leaves every 2018 ctfile on the far side
    // of the threshold
    sess.set_clock(
        NaiveDate::from_ymd_opt(2029, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap(),
    );

    match sess.run() {
        Err(Error::Fatal(msg)) => assert!(msg.contains("All ctfiles are old")),
        other => panic!("expected fatal abort, got {:?}", other.map(|_| ())),
    }

    // the abort happened before any delete or cull setup went out
    for body in sess.transport.xml_bodies() {
        assert!(!body.contains("ct_md_delete"));
        assert!(!body.contains("ct_cull_setup"));
    }
}

#[test]
fn cull_keeps_previous_chain_and_sends_union_of_refs() {
    let dir = tempdir().unwrap();
    let a = "20240101-000000-a";
    let b = "20240601-000000-b";
    let c = "20230101-000000-c";

    let mut store = FakeStore::default();
    for n in &[a, b, c] {
        store.cached.insert(n.to_string());
    }
    store.prev.insert(b.to_string(), a.to_string());
    store.refs.insert(a.to_string(), vec![sha(1), sha(2)]);
    store.refs.insert(b.to_string(), vec![sha(2), sha(3)]);
    store.refs.insert(c.to_string(), vec![sha(4)]);

    let mut sess = cull_session(&[a, b, c], store, 30, dir.path());
    sess.run().unwrap();

    let xml = sess.transport.xml_bodies();

    let shas_bodies: Vec<&String> = xml.iter().filter(|b| b.contains("ct_cull_shas")).collect();
    assert_eq!(shas_bodies.len(), 1);
    let shas = shas_bodies[0];
    assert_eq!(shas.matches("<sha ").count(), 3);
    assert!(shas.contains(&hex::encode(&sha(1)[..])));
    assert!(shas.contains(&hex::encode(&sha(2)[..])));
    assert!(shas.contains(&hex::encode(&sha(3)[..])));
    assert!(!shas.contains(&hex::encode(&sha(4)[..])));

    let completes: Vec<&String> = xml
        .iter()
        .filter(|b| b.contains("ct_cull_complete"))
        .collect();
    assert_eq!(completes.len(), 1);

    let deletes: Vec<&String> = xml.iter().filter(|b| b.contains("ct_md_delete")).collect();
    assert_eq!(deletes.len(), 1);
    assert!(deletes[0].contains(c));

    assert_eq!(sess.cull.shacnt, 0);
    assert!(sess.cull.shas.is_empty());
}

#[test]
fn cull_fetches_missing_ctfiles_into_the_cache() {
    let dir = tempdir().unwrap();
    let name = "20240625-000000-recent";

    // not in the cache, so the cull must pull it down first
    let mut store = FakeStore::default();
    store.refs.insert(name.to_string(), vec![sha(9)]);

    let mut server = FakeServer::default();
    server.listing = vec![name.to_string()];
    server.chunks = vec![b"catalog-bytes".to_vec()];

    let mut cfg = config(dir.path());
    cfg.ctfile_keep_days = 30;
    cfg.trans_capacity = 4;
    let mut sess = Session::new(cfg, store, server).unwrap();
    sess.set_clock(clock());
    sess.cull();
    sess.run().unwrap();

    let cached = fs::read(dir.path().join(name)).unwrap();
    assert_eq!(cached, b"catalog-bytes");

    let xml = sess.transport.xml_bodies();
    assert!(xml.iter().any(|b| b.contains("ct_md_open_read")));
    assert!(xml.iter().any(|b| b.contains("ct_cull_shas")));
    assert!(xml
        .iter()
        .filter(|b| b.contains("ct_cull_complete"))
        .count()
        == 1);
}

#[test]
fn cull_batches_shas_per_packet() {
    let dir = tempdir().unwrap();
    let name = "20240625-000000-big";

    let mut store = FakeStore::default();
    store.cached.insert(name.to_string());
    // more refs than fit one packet forces the send / reply / wake loop
    let many: Vec<[u8; SHA_DIGEST_LEN]> = (0..1500u32)
        .map(|i| {
            let mut s = [0u8; SHA_DIGEST_LEN];
            BigEndian::write_u32(&mut s[..4], i);
            s
        })
        .collect();
    store.refs.insert(name.to_string(), many);

    let mut sess = cull_session(&[name], store, 30, dir.path());
    sess.run().unwrap();

    let xml = sess.transport.xml_bodies();
    let counts: Vec<usize> = xml
        .iter()
        .filter(|b| b.contains("ct_cull_shas"))
        .map(|b| b.matches("<sha ").count())
        .collect();
    assert_eq!(counts, [1000, 500]);
    assert_eq!(sess.cull.shacnt, 0);
}

#[test]
fn cull_without_keep_days_is_a_config_error() {
    let dir = tempdir().unwrap();
    let name = "20240625-000000-x";
    let mut store = FakeStore::default();
    store.cached.insert(name.to_string());

    let mut sess = cull_session(&[name], store, 0, dir.path());
    match sess.run() {
        Err(Error::Config(_)) => {}
        other => panic!("expected config error, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn failed_open_is_fatal() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("f.ct"), b"data").unwrap();

    let mut server = FakeServer::default();
    server.fail_open = true;
    let mut sess = Session::new(config(dir.path()), FakeStore::default(), server).unwrap();
    sess.archive("f.ct", None, Some(dir.path()), false, false)
        .unwrap();
    match sess.run() {
        Err(Error::Server(s)) => assert_eq!(s, status::FAIL),
        other => panic!("expected server error, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn run_with_nothing_queued_finishes() {
    let dir = tempdir().unwrap();
    let mut sess = Session::new(config(dir.path()), FakeStore::default(), FakeServer::default())
        .unwrap();
    sess.run().unwrap();
}

#[test]
fn polled_open_round_trip() {
    let mut server = FakeServer::default();
    proto::xml_open_polled(&mut server, "20240101-000000-x", OpenMode::Read, 0, 1).unwrap();

    let mut failing = FakeServer::default();
    failing.fail_open = true;
    assert!(
        proto::xml_open_polled(&mut failing, "20240101-000000-x", OpenMode::Read, 0, 1).is_err()
    );
}
