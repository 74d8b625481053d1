use std::str;
use std::time::Duration;

use hex;
use wire::{opcode, status, Header};

use cull::{CtfileStore, CullMode};
use error::Error;
use session::{FileState, Session, Transport};
use trans::{Trans, TransState};
use wire::SHA_DIGEST_LEN;

// Timeout for the polled control path used before the engine runs.
const POLL_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    Write,
}

// The control bodies below are a self-consistent textual form; the
// exact server schema was never captured bit-exact, so every byte of
// body knowledge stays inside this module.

fn finish(body: String) -> (Header, Vec<u8>) {
    let body = body.into_bytes();
    let mut hdr = Header::new(0, opcode::XML);
    hdr.size = body.len() as u32;
    (hdr, body)
}

pub(crate) fn create_open(file: &str, mode: OpenMode, chunkno: u32) -> (Header, Vec<u8>) {
    let root = match mode {
        OpenMode::Read => "ct_md_open_read",
        OpenMode::Write => "ct_md_open_create",
    };
    finish(format!(
        "<{root}><file name=\"{file}\" chunkno=\"{chunkno}\"/></{root}>",
        root = root,
        file = file,
        chunkno = chunkno
    ))
}

pub(crate) fn create_close() -> (Header, Vec<u8>) {
    finish("<ct_md_close></ct_md_close>".to_string())
}

pub(crate) fn create_list() -> (Header, Vec<u8>) {
    finish("<ct_md_list></ct_md_list>".to_string())
}

pub(crate) fn create_delete(file: &str) -> (Header, Vec<u8>) {
    finish(format!(
        "<ct_md_delete><file name=\"{}\"/></ct_md_delete>",
        file
    ))
}

pub(crate) fn create_cull_setup(uuid: u64, mode: CullMode) -> (Header, Vec<u8>) {
    finish(format!(
        "<ct_cull_setup uuid=\"{:016x}\" mode=\"{}\"></ct_cull_setup>",
        uuid,
        mode.name()
    ))
}

pub(crate) fn create_cull_shas(uuid: u64, shas: &[[u8; SHA_DIGEST_LEN]]) -> (Header, Vec<u8>) {
    let mut body = format!("<ct_cull_shas uuid=\"{:016x}\">", uuid);
    for sha in shas {
        body.push_str("<sha sha=\"");
        body.push_str(&hex::encode(&sha[..]));
        body.push_str("\"/>");
    }
    body.push_str("</ct_cull_shas>");
    finish(body)
}

pub(crate) fn create_cull_complete(uuid: u64, mode: CullMode) -> (Header, Vec<u8>) {
    finish(format!(
        "<ct_cull_complete uuid=\"{:016x}\" mode=\"{}\"></ct_cull_complete>",
        uuid,
        mode.name()
    ))
}

// Collect every value of `key="..."` in document order.
fn attr_values<'a>(body: &'a str, key: &str) -> Vec<&'a str> {
    let needle = format!("{}=\"", key);
    let mut out = Vec::new();
    let mut rest = body;
    while let Some(at) = rest.find(&needle) {
        let tail = &rest[at + needle.len()..];
        match tail.find('"') {
            Some(end) => {
                out.push(&tail[..end]);
                rest = &tail[end + 1..];
            }
            None => break,
        }
    }
    out
}

fn body_str(body: &[u8]) -> Result<&str, Error> {
    str::from_utf8(body).map_err(|_| Error::Protocol("control body is not valid text"))
}

pub(crate) fn parse_open_reply(body: &[u8]) -> Result<String, Error> {
    let text = body_str(body)?;
    attr_values(text, "name")
        .first()
        .map(|s| s.to_string())
        .ok_or(Error::Protocol("malformed open reply"))
}

pub(crate) fn parse_close_reply(body: &[u8]) -> Result<(), Error> {
    if body_str(body)?.contains("ct_md_close_reply") {
        Ok(())
    } else {
        Err(Error::Protocol("malformed close reply"))
    }
}

pub(crate) fn parse_list_reply(body: &[u8]) -> Result<Vec<String>, Error> {
    let text = body_str(body)?;
    if !text.contains("ct_md_list_reply") {
        return Err(Error::Protocol("malformed list reply"));
    }
    Ok(attr_values(text, "name")
        .into_iter()
        .map(|s| s.to_string())
        .collect())
}

pub(crate) fn parse_delete_reply(body: &[u8]) -> Result<Option<String>, Error> {
    let text = body_str(body)?;
    if !text.contains("ct_md_delete_reply") {
        return Err(Error::Protocol("malformed delete reply"));
    }
    Ok(attr_values(text, "name").first().map(|s| s.to_string()))
}

pub(crate) fn parse_cull_setup_reply(body: &[u8]) -> Result<(), Error> {
    if body_str(body)?.contains("ct_cull_setup_reply") {
        Ok(())
    } else {
        Err(Error::Protocol("malformed cull setup reply"))
    }
}

pub(crate) fn parse_cull_shas_reply(body: &[u8]) -> Result<(), Error> {
    if body_str(body)?.contains("ct_cull_shas_reply") {
        Ok(())
    } else {
        Err(Error::Protocol("malformed cull shas reply"))
    }
}

pub(crate) fn parse_cull_complete_reply(body: &[u8]) -> Result<(), Error> {
    if body_str(body)?.contains("ct_cull_complete_reply") {
        Ok(())
    } else {
        Err(Error::Protocol("malformed cull complete reply"))
    }
}

/// Dispatch a control reply against the transaction that asked for it.
/// A reply in any state not listed here fails the session.
pub(crate) fn handle_xml_reply<S: CtfileStore, T: Transport>(
    sess: &mut Session<S, T>,
    trans: &mut Trans,
    hdr: &Header,
    body: &[u8],
) -> Result<(), Error> {
    if hdr.opcode != opcode::XML_REPLY {
        return Err(Error::Protocol("unexpected opcode for control reply"));
    }
    if hdr.status != status::OK {
        return Err(Error::Server(hdr.status));
    }

    match trans.state {
        TransState::XmlOpen => {
            let filename = parse_open_reply(body)?;
            debug!("{} opened", filename);
            sess.file_state = FileState::Running;
            trans.state = TransState::XmlOpened;
        }
        TransState::XmlClosing => {
            parse_close_reply(body)?;
            trans.state = TransState::XmlClosed;
        }
        TransState::XmlList => {
            let names = parse_list_reply(body)?;
            sess.ctfile_list = names;
            trans.state = TransState::Done;
        }
        TransState::XmlDelete => {
            match parse_delete_reply(body)? {
                Some(name) => info!("{} deleted", name),
                None => info!("specified archive does not exist"),
            }
            trans.state = TransState::Done;
        }
        TransState::XmlCullSend => {
            parse_cull_setup_reply(body)?;
            trans.state = TransState::Done;
        }
        TransState::XmlCullShaSend => {
            parse_cull_shas_reply(body)?;
            trans.state = if trans.eof {
                TransState::Done
            } else {
                TransState::XmlCullReplied
            };
        }
        TransState::XmlCullCompleteSend => {
            parse_cull_complete_reply(body)?;
            trans.state = TransState::Done;
        }
        _ => return Err(Error::Protocol("unexpected transaction state for control reply")),
    }
    Ok(())
}

/// Synchronous control open used before the asynchronous engine runs
/// (the secrets/ctfile handshake). Writes the request, then polls for
/// the reply with a bounded timeout; only `OK`/`XML_REPLY` passes.
pub fn xml_open_polled<T: Transport>(
    transport: &mut T,
    file: &str,
    mode: OpenMode,
    chunkno: u32,
    tag: u32,
) -> Result<(), Error> {
    let (mut hdr, body) = create_open(file, mode, chunkno);
    hdr.tag = tag;
    transport.send(&hdr, &body)?;

    let (rhdr, _rbody) = transport.recv_timeout(POLL_TIMEOUT)?;
    if rhdr.opcode != opcode::XML_REPLY {
        return Err(Error::Protocol("unexpected opcode for control reply"));
    }
    if rhdr.status != status::OK {
        return Err(Error::Server(rhdr.status));
    }
    Ok(())
}
