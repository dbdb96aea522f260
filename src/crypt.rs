//! Encryption of internal error details.
//!
//! User-visible failure messages must not leak raw RPC errors, so the
//! internal detail is sealed with AES-256-GCM under a compile-time key and
//! appended as an opaque base64 blob. Operators holding the key can decode
//! it with [`open_internal_message`].

use crate::errors::Error;
use openssl::symm::{decrypt_aead, encrypt_aead, Cipher};
use rand::{thread_rng, Rng};

const INTERNAL_ERROR_KEY: &str = "6f0d1c2a9b84e3757d66504f3b2a19c8d7e6f5a4b3c2d1e0f9a8b7c6d5e4f3a2";

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Seals the error text and returns the `" Internal Error: <base64>"`
/// suffix appended to user-visible failure messages. Returns an empty
/// string if sealing fails, so callers never lose the outer message.
pub fn encrypt_internal_message(err: &Error) -> String {
    match seal(&s!(err)) {
        Ok(blob) => format!(" Internal Error: {}", blob),
        Err(_) => String::new(),
    }
}

fn seal(plaintext: &str) -> Result<String, Error> {
    let key = crate::ser::from_hex(INTERNAL_ERROR_KEY)?;
    let mut nonce = [0u8; NONCE_LEN];
    thread_rng().fill(&mut nonce);
    let mut tag = [0u8; TAG_LEN];
    let ciphertext = encrypt_aead(
        Cipher::aes_256_gcm(),
        &key,
        Some(&nonce),
        &[],
        plaintext.as_bytes(),
        &mut tag,
    )?;
    let mut sealed = nonce.to_vec();
    sealed.extend_from_slice(&ciphertext);
    sealed.extend_from_slice(&tag);
    Ok(base64::encode(&sealed))
}

pub fn open_internal_message(blob: &str) -> Result<String, Error> {
    let sealed = base64::decode(blob).map_err(|e| Error::General(s!(e)))?;
    if sealed.len() < NONCE_LEN + TAG_LEN {
        return Err(Error::General(s!("sealed message too short")));
    }
    let key = crate::ser::from_hex(INTERNAL_ERROR_KEY)?;
    let (nonce, rest) = sealed.split_at(NONCE_LEN);
    let (ciphertext, tag) = rest.split_at(rest.len() - TAG_LEN);
    let plaintext = decrypt_aead(Cipher::aes_256_gcm(), &key, Some(nonce), &[], ciphertext, tag)
        .map_err(|_| Error::General(s!("cannot decrypt internal message")))?;
    String::from_utf8(plaintext).map_err(|e| Error::General(s!(e)))
}
