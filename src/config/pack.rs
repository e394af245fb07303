//! `.tscfg` authenticated envelope.
//!
//! ```text
//!  0      4    5       6          18        22             22+len   +16
//!  ┌──────┬────┬───────┬──────────┬─────────┬──────────────┬────────┐
//!  │"TSCF"│ ver│ cipher│ nonce[12]│ len u32 │ ciphertext   │ tag    │
//!  └──────┴────┴───────┴──────────┴─────────┴──────────────┴────────┘
//!  └──────────── header, bound as associated data ─────────┘
//! ```
//!
//! AES-256-GCM with a detached tag.  The tag is checked before any
//! plaintext leaves [`unseal`].

use core::fmt;

use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce, Tag};
use hmac_sha256::{HKDF, HMAC};

use crate::error::Error;

pub const MAGIC: &[u8; 4] = b"TSCF";
pub const VERSION: u8 = 1;
pub const CIPHER_AES256_GCM: u8 = 1;
pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;
pub const HEADER_LEN: usize = 4 + 1 + 1 + NONCE_LEN + 4;
pub const KEY_LEN: usize = 32;

const KDF_SALT: &[u8] = b"tscfg";
const KDF_INFO: &[u8] = b"tscfg-aes-key-v1";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackError {
    TooShort,
    BadMagic,
    UnsupportedVersion(u8),
    UnsupportedCipher(u8),
    LengthMismatch,
    AuthFailed,
    BadKey,
}

impl fmt::Display for PackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooShort => write!(f, "frame too short"),
            Self::BadMagic => write!(f, "bad magic"),
            Self::UnsupportedVersion(v) => write!(f, "unsupported version {v}"),
            Self::UnsupportedCipher(c) => write!(f, "unsupported cipher {c}"),
            Self::LengthMismatch => write!(f, "length mismatch"),
            Self::AuthFailed => write!(f, "authentication failed"),
            Self::BadKey => write!(f, "bad key"),
        }
    }
}

impl From<PackError> for Error {
    fn from(e: PackError) -> Self {
        match e {
            PackError::BadKey => Error::InvalidState,
            PackError::AuthFailed => Error::NoPermission,
            _ => Error::InvalidArg,
        }
    }
}

/// File-encryption key from the 32-byte device key.
pub fn derive_key(device_key: &[u8]) -> [u8; KEY_LEN] {
    let prk = HKDF::extract(KDF_SALT, device_key);
    let mut key = [0u8; KEY_LEN];
    HKDF::expand(&mut key, prk, KDF_INFO);
    key
}

/// Deterministic nonce from the global save counter and the file path.
/// `seq` never repeats, so neither does the nonce under one key.
pub fn nonce_for(key: &[u8; KEY_LEN], seq: u32, path: &str) -> [u8; NONCE_LEN] {
    let mut mac = HMAC::new(key);
    mac.update(seq.to_le_bytes());
    mac.update(path.as_bytes());
    let digest = mac.finalize();
    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(&digest[..NONCE_LEN]);
    nonce
}

pub fn is_sealed(bytes: &[u8]) -> bool {
    bytes.starts_with(MAGIC)
}

fn header(nonce: &[u8; NONCE_LEN], len: u32) -> [u8; HEADER_LEN] {
    let mut h = [0u8; HEADER_LEN];
    h[..4].copy_from_slice(MAGIC);
    h[4] = VERSION;
    h[5] = CIPHER_AES256_GCM;
    h[6..18].copy_from_slice(nonce);
    h[18..22].copy_from_slice(&len.to_le_bytes());
    h
}

pub fn seal(key: &[u8; KEY_LEN], nonce: &[u8; NONCE_LEN], plaintext: &[u8]) -> Result<Vec<u8>, PackError> {
    let len = u32::try_from(plaintext.len()).map_err(|_| PackError::LengthMismatch)?;
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| PackError::BadKey)?;
    let hdr = header(nonce, len);

    let mut frame = Vec::with_capacity(HEADER_LEN + plaintext.len() + TAG_LEN);
    frame.extend_from_slice(&hdr);
    frame.extend_from_slice(plaintext);
    let tag = cipher
        .encrypt_in_place_detached(Nonce::from_slice(nonce), &hdr, &mut frame[HEADER_LEN..])
        .map_err(|_| PackError::AuthFailed)?;
    frame.extend_from_slice(&tag);
    Ok(frame)
}

pub fn unseal(key: &[u8; KEY_LEN], frame: &[u8]) -> Result<Vec<u8>, PackError> {
    if frame.len() < HEADER_LEN + TAG_LEN {
        return Err(PackError::TooShort);
    }
    let (hdr, rest) = frame.split_at(HEADER_LEN);
    if &hdr[..4] != MAGIC {
        return Err(PackError::BadMagic);
    }
    if hdr[4] != VERSION {
        return Err(PackError::UnsupportedVersion(hdr[4]));
    }
    if hdr[5] != CIPHER_AES256_GCM {
        return Err(PackError::UnsupportedCipher(hdr[5]));
    }
    let len = u32::from_le_bytes([hdr[18], hdr[19], hdr[20], hdr[21]]) as usize;
    if rest.len() != len + TAG_LEN {
        return Err(PackError::LengthMismatch);
    }

    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| PackError::BadKey)?;
    let (ct, tag) = rest.split_at(len);
    let mut buf = ct.to_vec();
    cipher
        .decrypt_in_place_detached(
            Nonce::from_slice(&hdr[6..18]),
            hdr,
            &mut buf,
            Tag::from_slice(tag),
        )
        .map_err(|_| PackError::AuthFailed)?;
    Ok(buf)
}
