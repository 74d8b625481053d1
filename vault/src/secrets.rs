use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::Path;

use byteorder::{BigEndian, ByteOrder};
use hex;
use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2_hmac;
use rand::rngs::OsRng;
use rand::RngCore;
use sha1::Sha1;
use sha2::Sha256;
use zeroize::Zeroizing;

use chunk::{self, CRYPTO_BLOCK_LEN, IV_LEN, KEY_LEN};
use Error;

/// Salt length for the passphrase KDF.
pub const SALT_LEN: usize = 128;

/// Default PBKDF2 iteration count.
pub const DEF_ROUNDS: u32 = 256_000;

// Passphrase-derived and mask keys are plain AES-256 keys.
const PWDKEY_LEN: usize = 32;
const HMAC_LEN: usize = 32;

const F_ROUNDS: &'static str = "rounds";
const F_SALT: &'static str = "salt";
const F_AESKEY: &'static str = "e_aeskey";
const F_IVKEY: &'static str = "e_ivkey";
const F_MASKKEY: &'static str = "e_maskkey";
const F_HMACMASKKEY: &'static str = "hmac_maskkey";

// The mask-key check tag is an HMAC-SHA256 with an empty message: it
// proves knowledge of the mask key without exposing any structure.
fn mask_check_tag(mask_key: &[u8]) -> Result<[u8; HMAC_LEN], Error> {
    let hmac = Hmac::<Sha256>::new_from_slice(mask_key)
        .map_err(|_| Error::Crypto("can't init hmac"))?;
    let mut tag = [0u8; HMAC_LEN];
    tag.copy_from_slice(&hmac.finalize().into_bytes());
    Ok(tag)
}

/// Create the secrets file at `path`:
///
/// 1. derive a key from the passphrase (PBKDF2-HMAC-SHA1 over a random
///    salt),
/// 2. generate a random mask key,
/// 3. encrypt the data and iv keys under the mask key,
/// 4. encrypt the mask key under the passphrase key,
/// 5. store an HMAC of the plain mask key as the passphrase check tag.
///
/// The file is written with mode 0600 and left at 0400.
pub fn create_secrets(path: &Path, passphrase: &str, rounds: u32) -> Result<(), Error> {
    if rounds == 0 {
        return Err(Error::MalformedSecrets("rounds is zero"));
    }

    let mut salt = Zeroizing::new([0u8; SALT_LEN]);
    OsRng.fill_bytes(&mut salt[..]);

    let mut pass_key = Zeroizing::new([0u8; PWDKEY_LEN]);
    pbkdf2_hmac::<Sha1>(passphrase.as_bytes(), &salt[..], rounds, &mut pass_key[..]);

    let mut mask_key = Zeroizing::new([0u8; PWDKEY_LEN]);
    let mut aes_key = Zeroizing::new([0u8; KEY_LEN]);
    let mut iv_key = Zeroizing::new([0u8; IV_LEN]);
    OsRng.fill_bytes(&mut mask_key[..]);
    OsRng.fill_bytes(&mut aes_key[..]);
    OsRng.fill_bytes(&mut iv_key[..]);

    let mut e_aeskey = Zeroizing::new([0u8; KEY_LEN + CRYPTO_BLOCK_LEN]);
    let aes_len = chunk::passphrase_encrypt(&mask_key[..], &aes_key[..], &mut e_aeskey[..])?;

    let mut e_ivkey = Zeroizing::new([0u8; IV_LEN + CRYPTO_BLOCK_LEN]);
    let iv_len = chunk::passphrase_encrypt(&mask_key[..], &iv_key[..], &mut e_ivkey[..])?;

    let mut e_maskkey = Zeroizing::new([0u8; PWDKEY_LEN + CRYPTO_BLOCK_LEN]);
    let mask_len = chunk::passphrase_encrypt(&pass_key[..], &mask_key[..], &mut e_maskkey[..])?;

    let hmac_maskkey = mask_check_tag(&mask_key[..])?;

    let mut f = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;

    let mut rounds_wire = [0u8; 4];
    BigEndian::write_u32(&mut rounds_wire, rounds);

    // Stable field order on disk; the parser accepts any order.
    let res = write_fields(
        &mut f,
        &rounds_wire,
        &salt[..],
        &e_aeskey[..aes_len],
        &e_ivkey[..iv_len],
        &e_maskkey[..mask_len],
        &hmac_maskkey,
    );

    // The file must end up read-only even when a write failed midway.
    let chmod = fs::set_permissions(path, fs::Permissions::from_mode(0o400));
    res?;
    chmod?;

    debug!("created secrets file {}", path.display());
    Ok(())
}

fn write_fields(
    f: &mut File,
    rounds: &[u8],
    salt: &[u8],
    e_aeskey: &[u8],
    e_ivkey: &[u8],
    e_maskkey: &[u8],
    hmac_maskkey: &[u8],
) -> Result<(), Error> {
    writeln!(f, "{} = {}", F_ROUNDS, hex::encode(rounds))?;
    writeln!(f, "{} = {}", F_SALT, hex::encode(salt))?;
    writeln!(f, "{} = {}", F_AESKEY, hex::encode(e_aeskey))?;
    writeln!(f, "{} = {}", F_IVKEY, hex::encode(e_ivkey))?;
    writeln!(f, "{} = {}", F_MASKKEY, hex::encode(e_maskkey))?;
    writeln!(f, "{} = {}", F_HMACMASKKEY, hex::encode(hmac_maskkey))?;
    f.flush()?;
    Ok(())
}

fn field(dst: &mut [u8], value: &str, what: &'static str) -> Result<(), Error> {
    if value.len() % 2 != 0 || value.len() != dst.len() * 2 {
        return Err(Error::MalformedSecrets(what));
    }
    hex::decode_to_slice(value.as_bytes(), dst).map_err(|_| Error::MalformedSecrets(what))
}

/// Unlock the secrets file:
///
/// 1. derive the passphrase key and decrypt the mask key,
/// 2. recompute the check tag and compare it with the stored one
///    (constant time) to detect a wrong passphrase before touching any
///    further material,
/// 3. decrypt the data and iv keys into the caller's buffers.
pub fn unlock_secrets(
    path: &Path,
    passphrase: &str,
    out_aeskey: &mut [u8; KEY_LEN],
    out_ivkey: &mut [u8; IV_LEN],
) -> Result<(), Error> {
    let mut rounds_wire = [0u8; 4];
    let mut salt = Zeroizing::new([0u8; SALT_LEN]);
    let mut e_aeskey = Zeroizing::new([0u8; KEY_LEN + CRYPTO_BLOCK_LEN]);
    let mut e_ivkey = Zeroizing::new([0u8; IV_LEN + CRYPTO_BLOCK_LEN]);
    let mut e_maskkey = Zeroizing::new([0u8; PWDKEY_LEN + CRYPTO_BLOCK_LEN]);
    let mut hmac_maskkey = [0u8; HMAC_LEN];
    let mut seen = [false; 6];

    let f = File::open(path)?;
    for line in BufReader::new(f).lines() {
        let line = line.map_err(Error::Io)?;
        let mut parts = line.splitn(2, " = ");
        let name = parts.next().unwrap_or("");
        let value = match parts.next() {
            Some(v) => v,
            None => return Err(Error::MalformedSecrets("invalid entry")),
        };

        match name {
            F_ROUNDS => {
                field(&mut rounds_wire, value, "invalid rounds")?;
                seen[0] = true;
            }
            F_SALT => {
                field(&mut salt[..], value, "invalid salt")?;
                seen[1] = true;
            }
            F_AESKEY => {
                field(&mut e_aeskey[..], value, "invalid e_aeskey")?;
                seen[2] = true;
            }
            F_IVKEY => {
                field(&mut e_ivkey[..], value, "invalid e_ivkey")?;
                seen[3] = true;
            }
            F_MASKKEY => {
                field(&mut e_maskkey[..], value, "invalid e_maskkey")?;
                seen[4] = true;
            }
            F_HMACMASKKEY => {
                field(&mut hmac_maskkey, value, "invalid hmac_maskkey")?;
                seen[5] = true;
            }
            _ => return Err(Error::MalformedSecrets("invalid entry")),
        }
    }

    if seen.iter().any(|&s| !s) {
        return Err(Error::MalformedSecrets("missing field"));
    }

    let rounds = BigEndian::read_u32(&rounds_wire);
    if rounds == 0 {
        return Err(Error::MalformedSecrets("rounds is zero"));
    }

    let mut pass_key = Zeroizing::new([0u8; PWDKEY_LEN]);
    pbkdf2_hmac::<Sha1>(passphrase.as_bytes(), &salt[..], rounds, &mut pass_key[..]);

    // A wrong passphrase key almost always trips the padding check
    // here; the HMAC below catches the remainder.
    let mut mask_buf = Zeroizing::new([0u8; PWDKEY_LEN + CRYPTO_BLOCK_LEN]);
    let mask_len = chunk::passphrase_decrypt(&pass_key[..], &e_maskkey[..], &mut mask_buf[..])
        .map_err(|_| Error::WrongPassphrase)?;
    if mask_len != PWDKEY_LEN {
        return Err(Error::WrongPassphrase);
    }
    let mask_key = &mask_buf[..PWDKEY_LEN];

    let hmac = Hmac::<Sha256>::new_from_slice(mask_key)
        .map_err(|_| Error::Crypto("can't init hmac"))?;
    if hmac.verify_slice(&hmac_maskkey).is_err() {
        warn!("invalid passphrase for {}", path.display());
        return Err(Error::WrongPassphrase);
    }

    let mut iv_buf = Zeroizing::new([0u8; IV_LEN + CRYPTO_BLOCK_LEN]);
    let iv_len = chunk::passphrase_decrypt(mask_key, &e_ivkey[..], &mut iv_buf[..])?;

    let mut aes_buf = Zeroizing::new([0u8; KEY_LEN + CRYPTO_BLOCK_LEN]);
    let aes_len = chunk::passphrase_decrypt(mask_key, &e_aeskey[..], &mut aes_buf[..])?;

    // The decrypted lengths must match what the caller declared.
    if aes_len != out_aeskey.len() {
        return Err(Error::Crypto("invalid aes key length"));
    }
    if iv_len != out_ivkey.len() {
        return Err(Error::Crypto("invalid iv key length"));
    }

    out_aeskey.copy_from_slice(&aes_buf[..aes_len]);
    out_ivkey.copy_from_slice(&iv_buf[..iv_len]);
    Ok(())
}
