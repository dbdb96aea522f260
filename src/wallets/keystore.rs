//! Local keystore for the account-model wallet: one scrypt-encrypted key
//! file per account. Keys are decrypted into memory by `unlock`, must be
//! used through `secret`, and are dropped again by `lock`.

use super::keccak256;
use crate::errors::Error;
use crate::ser::{from_hex, to_hex};
use openssl::pkcs5::scrypt;
use openssl::symm::{decrypt_aead, encrypt_aead, Cipher};
use parking_lot::Mutex;
use rand::{thread_rng, Rng};
use secp256k1::{PublicKey, Secp256k1, SecretKey};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{create_dir_all, read_dir, read_to_string, File};
use std::io::Write;
use std::path::PathBuf;

// go-ethereum's standard scrypt cost: 256 MiB of memory per derivation.
const SCRYPT_N: u64 = 1 << 18;
const SCRYPT_R: u64 = 8;
const SCRYPT_P: u64 = 1;
const SCRYPT_MAXMEM: u64 = 1 << 30;
const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

#[derive(Serialize, Deserialize)]
struct CipherParams {
    kdf: String,
    n: u64,
    r: u64,
    p: u64,
    salt: String,
    nonce: String,
    ciphertext: String,
    tag: String,
}

#[derive(Serialize, Deserialize)]
struct KeyFile {
    address: String,
    crypto: CipherParams,
}

pub struct Keystore {
    dir: PathBuf,
    passphrase: String,
    scrypt_n: u64,
    unlocked: Mutex<HashMap<String, SecretKey>>,
}

impl Keystore {
    pub fn new(dir: &str, passphrase: &str) -> Keystore {
        Keystore {
            dir: PathBuf::from(dir),
            passphrase: passphrase.to_owned(),
            scrypt_n: SCRYPT_N,
            unlocked: Mutex::new(HashMap::new()),
        }
    }

    /// Weak KDF cost for unit tests; production cost makes tests minutes long.
    #[cfg(test)]
    pub fn with_light_kdf(dir: &str, passphrase: &str) -> Keystore {
        Keystore {
            dir: PathBuf::from(dir),
            passphrase: passphrase.to_owned(),
            scrypt_n: 1 << 4,
            unlocked: Mutex::new(HashMap::new()),
        }
    }

    fn derive_cipher_key(&self, salt: &[u8], n: u64) -> Result<[u8; KEY_LEN], Error> {
        let mut key = [0u8; KEY_LEN];
        scrypt(
            self.passphrase.as_bytes(),
            salt,
            n,
            SCRYPT_R,
            SCRYPT_P,
            SCRYPT_MAXMEM,
            &mut key,
        )?;
        Ok(key)
    }

    /// Creates a fresh account and returns its address.
    pub fn new_account(&self) -> Result<String, Error> {
        let secp = Secp256k1::new();
        let mut rng = thread_rng();
        let secret = loop {
            let mut bytes = [0u8; 32];
            rng.fill(&mut bytes);
            if let Ok(secret) = SecretKey::from_slice(&bytes) {
                break secret;
            }
        };
        let address = address_of(&secp, &secret);

        let mut salt = [0u8; 32];
        rng.fill(&mut salt);
        let mut nonce = [0u8; NONCE_LEN];
        rng.fill(&mut nonce);
        let cipher_key = self.derive_cipher_key(&salt, self.scrypt_n)?;
        let mut tag = [0u8; TAG_LEN];
        let ciphertext = encrypt_aead(
            Cipher::aes_256_gcm(),
            &cipher_key,
            Some(&nonce),
            &[],
            &secret[..],
            &mut tag,
        )?;

        let key_file = KeyFile {
            address: address.clone(),
            crypto: CipherParams {
                kdf: s!("scrypt"),
                n: self.scrypt_n,
                r: SCRYPT_R,
                p: SCRYPT_P,
                salt: to_hex(&salt),
                nonce: to_hex(&nonce),
                ciphertext: to_hex(&ciphertext),
                tag: to_hex(&tag),
            },
        };
        create_dir_all(&self.dir)?;
        let path = self.key_path(&address);
        let mut file = File::create(&path)?;
        file.write_all(serde_json::to_string_pretty(&key_file)?.as_bytes())?;
        Ok(address)
    }

    fn key_path(&self, address: &str) -> PathBuf {
        self.dir.join(format!("{}.json", address))
    }

    /// All account addresses in the keystore, in stable order.
    pub fn accounts(&self) -> Result<Vec<String>, Error> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut addresses = Vec::new();
        for entry in read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                addresses.push(stem.to_owned());
            }
        }
        addresses.sort();
        Ok(addresses)
    }

    /// Decrypts the account key into memory. Costs one scrypt derivation.
    pub fn unlock(&self, address: &str) -> Result<(), Error> {
        let raw = read_to_string(self.key_path(address))
            .map_err(|e| Error::General(format!("cannot read key for {}: {}", address, e)))?;
        let key_file: KeyFile = serde_json::from_str(&raw)?;
        if key_file.crypto.kdf != "scrypt" {
            return Err(Error::General(format!(
                "unsupported kdf {}",
                key_file.crypto.kdf
            )));
        }
        let salt = from_hex(&key_file.crypto.salt)?;
        let nonce = from_hex(&key_file.crypto.nonce)?;
        let ciphertext = from_hex(&key_file.crypto.ciphertext)?;
        let tag = from_hex(&key_file.crypto.tag)?;
        let cipher_key = self.derive_cipher_key(&salt, key_file.crypto.n)?;
        let secret_bytes = decrypt_aead(
            Cipher::aes_256_gcm(),
            &cipher_key,
            Some(&nonce),
            &[],
            &ciphertext,
            &tag,
        )
        .map_err(|_| Error::General(format!("cannot decrypt key for {}", address)))?;
        let secret = SecretKey::from_slice(&secret_bytes)
            .map_err(|e| Error::General(format!("corrupt key for {}: {}", address, e)))?;
        self.unlocked.lock().insert(address.to_owned(), secret);
        Ok(())
    }

    /// The decrypted key of an unlocked account.
    pub fn secret(&self, address: &str) -> Result<SecretKey, Error> {
        self.unlocked
            .lock()
            .get(address)
            .cloned()
            .ok_or_else(|| Error::General(format!("account {} is locked", address)))
    }

    pub fn lock(&self, address: &str) {
        self.unlocked.lock().remove(address);
    }

    pub fn is_unlocked(&self, address: &str) -> bool {
        self.unlocked.lock().contains_key(address)
    }
}

/// The account address: keccak-256 of the uncompressed public key, last
/// twenty bytes, lowercase hex.
pub fn address_of(secp: &Secp256k1<secp256k1::All>, secret: &SecretKey) -> String {
    let public = PublicKey::from_secret_key(secp, secret);
    let uncompressed = public.serialize_uncompressed();
    let hash = keccak256(&uncompressed[1..]);
    format!("0x{}", to_hex(&hash[12..]))
}
