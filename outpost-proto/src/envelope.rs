//! Authenticated envelope around a serialised batch.
//!
//! AES-256-GCM with a pre-shared 32 byte key. On the wire an envelope is
//! `nonce (12) || ciphertext || tag (16)`, a fixed 28 bytes of overhead.
//! Nonces are drawn fresh from the OS RNG for every envelope; operators
//! rotate the key long before the ~2^32 envelope birthday bound.
//!
//! There is no replay window and no version byte. A recorded envelope can
//! be replayed until the key rotates, which only duplicates positions the
//! database already de-duplicates by treating samples as a set.

use std::{
    fmt::Debug,
    path::{
        Path,
        PathBuf,
    },
};

use aes_gcm::{
    Aes256Gcm,
    Key,
    Nonce,
    aead::{
        Aead,
        AeadCore,
        KeyInit,
        OsRng,
    },
};

/// Key length in bytes.
pub const KEY_LENGTH: usize = 32;

/// Nonce length in bytes.
pub const NONCE_LENGTH: usize = 12;

/// Authentication tag length in bytes.
pub const TAG_LENGTH: usize = 16;

/// Fixed envelope overhead: nonce plus tag.
pub const OVERHEAD: usize = NONCE_LENGTH + TAG_LENGTH;

/// The pre-shared key both endpoints hold.
///
/// Loaded once at startup and immutable afterwards. The `Debug` impl never
/// prints key material.
#[derive(Clone)]
pub struct Psk([u8; KEY_LENGTH]);

impl Psk {
    pub fn from_bytes(bytes: [u8; KEY_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Loads the key from a file containing exactly 32 raw bytes.
    pub fn load(path: &Path) -> Result<Self, PskError> {
        let data = std::fs::read(path).map_err(|source| {
            PskError::Io {
                path: path.to_owned(),
                source,
            }
        })?;

        let bytes: [u8; KEY_LENGTH] = data.as_slice().try_into().map_err(|_| {
            PskError::BadLength {
                path: path.to_owned(),
                length: data.len(),
            }
        })?;

        Ok(Self(bytes))
    }
}

impl Debug for Psk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Psk(..)")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PskError {
    #[error("failed to read key file {}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("key file {} must be exactly {} bytes, got {}", .path.display(), KEY_LENGTH, .length)]
    BadLength { path: PathBuf, length: usize },
}

#[derive(Debug, thiserror::Error)]
pub enum OpenError {
    #[error("envelope is {length} bytes, shorter than the {OVERHEAD} byte minimum")]
    Truncated { length: usize },

    /// Tag verification failed, or the ciphertext was malformed. The two
    /// cases are indistinguishable on purpose.
    #[error("envelope authentication failed")]
    AuthFailed,
}

/// Encrypts a payload under the key with a fresh random nonce.
pub fn seal(psk: &Psk, plaintext: &[u8]) -> Vec<u8> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&psk.0));
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .expect("AES-GCM encryption of an in-memory payload cannot fail");

    let mut envelope = Vec::with_capacity(NONCE_LENGTH + ciphertext.len());
    envelope.extend_from_slice(&nonce);
    envelope.extend_from_slice(&ciphertext);
    envelope
}

/// Decrypts and authenticates an envelope.
pub fn open(psk: &Psk, envelope: &[u8]) -> Result<Vec<u8>, OpenError> {
    if envelope.len() < OVERHEAD {
        return Err(OpenError::Truncated {
            length: envelope.len(),
        });
    }

    let (nonce, ciphertext) = envelope.split_at(NONCE_LENGTH);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&psk.0));

    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| OpenError::AuthFailed)
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::{
        NONCE_LENGTH,
        OVERHEAD,
        OpenError,
        Psk,
        open,
        seal,
    };

    fn test_key() -> Psk {
        Psk::from_bytes([0; 32])
    }

    #[test]
    fn it_round_trips() {
        let psk = test_key();
        let plaintext = b"\x65\x4d\x5e\x00\x1a\xd2\x74\x80";
        let envelope = seal(&psk, plaintext);
        assert_eq!(envelope.len(), plaintext.len() + OVERHEAD);
        assert_eq!(open(&psk, &envelope).unwrap(), plaintext);
    }

    #[test]
    fn it_has_fixed_overhead() {
        let envelope = seal(&test_key(), &[0; 16]);
        assert_eq!(envelope.len(), 44);
    }

    #[test]
    fn it_rejects_a_wrong_key() {
        let envelope = seal(&test_key(), b"payload");
        let other = Psk::from_bytes([1; 32]);
        assert!(matches!(
            open(&other, &envelope),
            Err(OpenError::AuthFailed)
        ));
    }

    #[test]
    fn it_rejects_any_flipped_bit() {
        let psk = test_key();
        let envelope = seal(&psk, b"payload");

        for index in 0..envelope.len() {
            for bit in 0..8 {
                let mut tampered = envelope.clone();
                tampered[index] ^= 1 << bit;
                assert!(
                    matches!(open(&psk, &tampered), Err(OpenError::AuthFailed)),
                    "bit {bit} of byte {index} survived tampering"
                );
            }
        }
    }

    #[test]
    fn it_rejects_truncated_envelopes() {
        let psk = test_key();
        for length in 0..OVERHEAD {
            assert!(matches!(
                open(&psk, &vec![0; length]),
                Err(OpenError::Truncated { .. })
            ));
        }
    }

    #[test]
    fn it_never_reuses_a_nonce() {
        let psk = test_key();
        let mut seen = HashSet::new();
        for _ in 0..1_000_000 {
            let envelope = seal(&psk, b"");
            let nonce: [u8; NONCE_LENGTH] = envelope[..NONCE_LENGTH].try_into().unwrap();
            assert!(seen.insert(nonce), "nonce reused");
        }
    }
}
