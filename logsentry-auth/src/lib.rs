//! API key issuance, hashing and device-authorization codes.
//!
//! API keys are bearer secrets authenticating a single app for ingest. The
//! plaintext only ever exists at two points: when a key is minted during the
//! device-authorization flow, and when an incoming key is validated. At rest,
//! only the [`KeyHash`] is stored: a deterministic Argon2id digest derived
//! with a fixed per-installation pepper, slow enough that offline enumeration
//! of keys is expensive. The hot ingest path may additionally cache lookups
//! under a fast [`CacheKey`], an HMAC-SHA-256 under an in-memory secret that
//! never leaves the process.

#![warn(missing_docs)]

use std::fmt;

use data_encoding::{BASE32_NOPAD, BASE64URL_NOPAD, HEXLOWER};
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Prefix of all API keys in plaintext form.
pub const KEY_PREFIX: &str = "sk_";

/// Number of random characters following the prefix.
const KEY_RANDOM_CHARS: usize = 32;

/// Length of the Argon2id digest in bytes.
const KEY_HASH_LEN: usize = 32;

/// Alphabet for user codes: no vowels, no look-alike characters.
pub const USER_CODE_ALPHABET: &[u8] = b"BCDFGHJKLMNPQRSTVWXYZ";

/// Number of characters in a user code.
pub const USER_CODE_LEN: usize = 8;

/// Compares two byte strings without early exit.
fn constant_time_eq(left: &[u8], right: &[u8]) -> bool {
    if left.len() != right.len() {
        return false;
    }

    let mut diff = 0u8;
    for (l, r) in left.iter().zip(right) {
        diff |= l ^ r;
    }
    diff == 0
}

/// An API key in plaintext form.
///
/// The `Debug` representation is redacted so that keys cannot leak through
/// logging. Keys are never persisted in this form.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ApiKey(String);

impl ApiKey {
    /// Mints a fresh API key from the OS random number generator.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 24];
        OsRng.fill_bytes(&mut bytes);
        Self(format!("{KEY_PREFIX}{}", BASE64URL_NOPAD.encode(&bytes)))
    }

    /// Parses a plaintext key, checking the client-side format only.
    ///
    /// The server performs the authoritative check against the stored hash;
    /// this merely rejects values that cannot possibly be keys.
    pub fn parse(value: &str) -> Result<Self, InvalidApiKey> {
        let rest = value.strip_prefix(KEY_PREFIX).ok_or(InvalidApiKey)?;
        if rest.len() != KEY_RANDOM_CHARS {
            return Err(InvalidApiKey);
        }

        Ok(Self(value.to_owned()))
    }

    /// Returns the plaintext for transmission to the server.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ApiKey(\"{KEY_PREFIX}***\")")
    }
}

/// An error parsing an [`ApiKey`] from its plaintext form.
#[derive(Clone, Copy, Debug, thiserror::Error, PartialEq, Eq)]
#[error("malformed API key")]
pub struct InvalidApiKey;

/// The at-rest digest of an [`ApiKey`].
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyHash(String);

impl KeyHash {
    /// Returns the hex representation stored in the key registry.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Reconstructs a hash from its stored representation.
    pub fn from_stored(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for KeyHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An error produced while hashing keys.
#[derive(Clone, Copy, Debug, thiserror::Error, PartialEq, Eq)]
#[error("key hashing failed")]
pub struct HashError;

/// Derives at-rest digests of API keys.
///
/// The digest is Argon2id keyed with the per-installation pepper and salted
/// with a digest of the pepper, which makes it deterministic for a given
/// installation: the registry can look keys up by their hash with a single
/// indexed query.
pub struct KeyHasher {
    pepper: Vec<u8>,
    salt: [u8; 16],
}

impl KeyHasher {
    /// Creates a hasher from the installation pepper.
    pub fn new(pepper: &[u8]) -> Self {
        let digest = Sha256::digest(pepper);
        let mut salt = [0u8; 16];
        salt.copy_from_slice(&digest[..16]);

        Self {
            pepper: pepper.to_vec(),
            salt,
        }
    }

    fn argon2(&self) -> Result<argon2::Argon2<'_>, HashError> {
        let params = argon2::Params::new(19_456, 2, 1, Some(KEY_HASH_LEN)).map_err(|_| HashError)?;
        argon2::Argon2::new_with_secret(
            &self.pepper,
            argon2::Algorithm::Argon2id,
            argon2::Version::V0x13,
            params,
        )
        .map_err(|_| HashError)
    }

    /// Computes the at-rest digest of a key.
    ///
    /// This is deliberately slow; do not call it on the hot ingest path
    /// without going through the lookup cache first.
    pub fn hash(&self, key: &ApiKey) -> Result<KeyHash, HashError> {
        let mut out = [0u8; KEY_HASH_LEN];
        self.argon2()?
            .hash_password_into(key.expose().as_bytes(), &self.salt, &mut out)
            .map_err(|_| HashError)?;

        Ok(KeyHash(HEXLOWER.encode(&out)))
    }

    /// Verifies a plaintext key against a stored digest in constant time.
    pub fn verify(&self, key: &ApiKey, stored: &KeyHash) -> Result<bool, HashError> {
        let computed = self.hash(key)?;
        Ok(constant_time_eq(
            computed.as_str().as_bytes(),
            stored.as_str().as_bytes(),
        ))
    }
}

/// A fast keyed digest of an [`ApiKey`] for the in-memory lookup cache.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct CacheKey([u8; 32]);

/// Derives [`CacheKey`]s under a per-process random secret.
///
/// The secret never leaves memory, so cache keys are useless outside the
/// process that created them. The authoritative check always consults the
/// slow [`KeyHasher`] digest in the store.
pub struct CacheKeyer {
    secret: [u8; 32],
}

impl CacheKeyer {
    /// Creates a keyer with a fresh random secret.
    pub fn random() -> Self {
        let mut secret = [0u8; 32];
        OsRng.fill_bytes(&mut secret);
        Self { secret }
    }

    /// Computes the cache key for a plaintext API key.
    pub fn cache_key(&self, key: &ApiKey) -> CacheKey {
        let mut mac = Hmac::<Sha256>::new_from_slice(&self.secret)
            .expect("HMAC accepts keys of any length");
        mac.update(key.expose().as_bytes());

        let mut out = [0u8; 32];
        out.copy_from_slice(&mac.finalize().into_bytes());
        CacheKey(out)
    }
}

/// An opaque device code identifying one device-authorization session.
///
/// Carries at least 128 bits of entropy, base32-encoded.
pub fn generate_device_code() -> String {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    BASE32_NOPAD.encode(&bytes)
}

/// A short code the user types into the browser to identify their session.
///
/// Drawn from a confusion-free alphabet without vowels or look-alikes.
pub fn generate_user_code() -> String {
    let mut rng = OsRng;
    (0..USER_CODE_LEN)
        .map(|_| USER_CODE_ALPHABET[rng.gen_range(0..USER_CODE_ALPHABET.len())] as char)
        .collect()
}
