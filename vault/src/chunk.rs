use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyInit};
use aes::Aes256;
use byteorder::{BigEndian, ByteOrder};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use xts_mode::Xts128;

use Error;

/// Chunk cipher key length: AES-256-XTS takes a double-length key, the
/// first half for the data cipher and the second for the tweak cipher.
pub const KEY_LEN: usize = 64;

/// Per-chunk IV length. IVs are full SHA-256 outputs; the cipher
/// consumes the leading 16 bytes as the XTS tweak.
pub const IV_LEN: usize = 32;

/// Cipher block length, the sizing margin callers must leave on the
/// destination buffer.
pub const CRYPTO_BLOCK_LEN: usize = 16;

// IVs are bound to the chunk content: the HMAC of the plaintext prefix
// under the iv key. Two chunks with equal prefixes get equal IVs, which
// is what makes server-side dedup of encrypted chunks possible.
const IV_SRC_LEN: usize = 32;

/// Derive the IV for a content chunk from the first 32 bytes (or all,
/// for shorter chunks) of its plaintext.
pub fn create_iv(iv_key: &[u8; IV_LEN], src: &[u8], iv: &mut [u8]) -> Result<(), Error> {
    if iv.len() != IV_LEN {
        return Err(Error::Crypto("invalid iv length"));
    }

    let mut hmac = <Hmac<Sha256> as Mac>::new_from_slice(iv_key)
        .map_err(|_| Error::Crypto("can't init iv hmac"))?;
    let n = if src.len() >= IV_SRC_LEN { IV_SRC_LEN } else { src.len() };
    hmac.update(&src[..n]);
    iv.copy_from_slice(&hmac.finalize().into_bytes());
    Ok(())
}

/// Derive the IV for ctfile chunk `chunkno`. Catalog chunks cannot use
/// content-derived IVs (the extract side has no plaintext yet), so the
/// chunk number in network byte order stands in for the plaintext
/// prefix. Both the archive and extract paths derive from here.
pub fn create_iv_ctfile(iv_key: &[u8; IV_LEN], chunkno: u32, iv: &mut [u8]) -> Result<(), Error> {
    let mut src = [0u8; 4];
    BigEndian::write_u32(&mut src, chunkno);
    create_iv(iv_key, &src, iv)
}

fn xts(key: &[u8; KEY_LEN]) -> Result<Xts128<Aes256>, Error> {
    let data_cipher = Aes256::new_from_slice(&key[..32])
        .map_err(|_| Error::Crypto("invalid key length"))?;
    let tweak_cipher = Aes256::new_from_slice(&key[32..])
        .map_err(|_| Error::Crypto("invalid key length"))?;
    Ok(Xts128::new(data_cipher, tweak_cipher))
}

fn tweak_of(iv: &[u8; IV_LEN]) -> [u8; 16] {
    let mut tweak = [0u8; 16];
    tweak.copy_from_slice(&iv[..16]);
    tweak
}

/// Encrypt one chunk in a single pass. The destination must leave one
/// block of margin over the source; the returned length is the
/// authoritative ciphertext size.
pub fn encrypt(
    key: &[u8; KEY_LEN],
    iv: &[u8; IV_LEN],
    src: &[u8],
    dst: &mut [u8],
) -> Result<usize, Error> {
    if src.len() < CRYPTO_BLOCK_LEN {
        return Err(Error::Crypto("chunk shorter than cipher block"));
    }
    if dst.len() < src.len() + CRYPTO_BLOCK_LEN {
        return Err(Error::Crypto("invalid dstlen while encrypting"));
    }

    dst[..src.len()].copy_from_slice(src);
    xts(key)?.encrypt_sector(&mut dst[..src.len()], tweak_of(iv));
    Ok(src.len())
}

/// Decrypt one chunk. XTS is length-preserving, so the destination must
/// hold `src.len()` bytes; the returned length is authoritative.
pub fn decrypt(
    key: &[u8; KEY_LEN],
    iv: &[u8; IV_LEN],
    src: &[u8],
    dst: &mut [u8],
) -> Result<usize, Error> {
    if src.len() < CRYPTO_BLOCK_LEN {
        return Err(Error::Crypto("chunk shorter than cipher block"));
    }
    if dst.len() < src.len() {
        return Err(Error::Crypto("invalid dstlen while decrypting"));
    }

    dst[..src.len()].copy_from_slice(src);
    xts(key)?.decrypt_sector(&mut dst[..src.len()], tweak_of(iv));
    Ok(src.len())
}

// Key wrapping for the secrets envelope: ECB-AES-256 with PKCS7
// padding, no IV. Only ever applied to uniformly random key material.
pub(crate) fn passphrase_encrypt(key: &[u8], src: &[u8], dst: &mut [u8]) -> Result<usize, Error> {
    let enc = ecb::Encryptor::<Aes256>::new_from_slice(key)
        .map_err(|_| Error::Crypto("invalid key length"))?;
    let out = enc
        .encrypt_padded_b2b_mut::<Pkcs7>(src, dst)
        .map_err(|_| Error::Crypto("invalid dstlen while encrypting"))?;
    Ok(out.len())
}

pub(crate) fn passphrase_decrypt(key: &[u8], src: &[u8], dst: &mut [u8]) -> Result<usize, Error> {
    let dec = ecb::Decryptor::<Aes256>::new_from_slice(key)
        .map_err(|_| Error::Crypto("invalid key length"))?;
    let out = dec
        .decrypt_padded_b2b_mut::<Pkcs7>(src, dst)
        .map_err(|_| Error::Crypto("bad padding"))?;
    Ok(out.len())
}
