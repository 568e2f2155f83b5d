//! Per-session transport AEAD.
//!
//! Sessions encrypt with AES-256-GCM. For normal encrypted frames the 16-byte
//! overlay header is the associated data and the rest of the datagram is
//! ciphertext plus the trailing tag. Relayed frames are authenticated but not
//! encrypted: the whole body before the tag is associated data and the
//! plaintext is empty. The nonce is derived from the 64-bit message counter
//! into a caller-owned scratch buffer so nothing is allocated per packet.

use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::{AeadInPlace, Aes256Gcm, KeyInit};

use crate::error::PacketError;

/// AEAD tag length appended to every encrypted or authenticated frame.
pub const TAG_LEN: usize = 16;
/// Nonce scratch size, 96-bit GCM nonce.
pub const NONCE_LEN: usize = 12;

/// One direction of a session's transport keys.
pub struct SessionCipher {
    cipher: Aes256Gcm,
}

impl SessionCipher {
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: Aes256Gcm::new(GenericArray::from_slice(key)),
        }
    }

    /// Bytes of AEAD overhead on the wire.
    pub fn overhead(&self) -> usize {
        TAG_LEN
    }

    // Nonce = 4 zero bytes || counter (big-endian). Counters never repeat
    // within a session, which is the GCM uniqueness requirement.
    fn fill_nonce(counter: u64, nb: &mut [u8; NONCE_LEN]) {
        nb[..4].fill(0);
        nb[4..].copy_from_slice(&counter.to_be_bytes());
    }

    /// Decrypt `ciphertext || tag` into `out`, authenticating `ad`.
    ///
    /// `out` is cleared and reused; the returned slice aliases it.
    pub fn decrypt<'a>(
        &self,
        out: &'a mut Vec<u8>,
        ad: &[u8],
        ciphertext_and_tag: &[u8],
        counter: u64,
        nb: &mut [u8; NONCE_LEN],
    ) -> Result<&'a [u8], PacketError> {
        if ciphertext_and_tag.len() < TAG_LEN {
            return Err(PacketError::DecryptionFailed);
        }
        let split = ciphertext_and_tag.len() - TAG_LEN;
        let (ciphertext, tag) = ciphertext_and_tag.split_at(split);

        Self::fill_nonce(counter, nb);
        out.clear();
        out.extend_from_slice(ciphertext);

        self.cipher
            .decrypt_in_place_detached(
                GenericArray::from_slice(nb),
                ad,
                out.as_mut_slice(),
                GenericArray::from_slice(tag),
            )
            .map_err(|_| PacketError::DecryptionFailed)?;

        Ok(out.as_slice())
    }

    /// Verify a tag over associated data only (no ciphertext). This is the
    /// relayed-frame case: the body is visible to the relay but the tag still
    /// proves the sender held the session key.
    pub fn verify_detached(
        &self,
        ad: &[u8],
        tag: &[u8],
        counter: u64,
        nb: &mut [u8; NONCE_LEN],
    ) -> Result<(), PacketError> {
        if tag.len() != TAG_LEN {
            return Err(PacketError::DecryptionFailed);
        }
        Self::fill_nonce(counter, nb);
        let mut empty: [u8; 0] = [];
        self.cipher
            .decrypt_in_place_detached(
                GenericArray::from_slice(nb),
                ad,
                &mut empty,
                GenericArray::from_slice(tag),
            )
            .map_err(|_| PacketError::DecryptionFailed)
    }

    /// Encrypt `plaintext` with `ad` authenticated, appending the result and
    /// tag to `out`.
    pub fn encrypt(
        &self,
        out: &mut Vec<u8>,
        ad: &[u8],
        plaintext: &[u8],
        counter: u64,
        nb: &mut [u8; NONCE_LEN],
    ) -> Result<(), PacketError> {
        Self::fill_nonce(counter, nb);
        let start = out.len();
        out.extend_from_slice(plaintext);
        let tag = self
            .cipher
            .encrypt_in_place_detached(GenericArray::from_slice(nb), ad, &mut out[start..])
            .map_err(|_| PacketError::DecryptionFailed)?;
        out.extend_from_slice(&tag);
        Ok(())
    }

    /// Produce a tag over associated data only.
    pub fn tag_detached(
        &self,
        ad: &[u8],
        counter: u64,
        nb: &mut [u8; NONCE_LEN],
    ) -> Result<[u8; TAG_LEN], PacketError> {
        Self::fill_nonce(counter, nb);
        let mut empty: [u8; 0] = [];
        let tag = self
            .cipher
            .encrypt_in_place_detached(GenericArray::from_slice(nb), ad, &mut empty)
            .map_err(|_| PacketError::DecryptionFailed)?;
        let mut bytes = [0u8; TAG_LEN];
        bytes.copy_from_slice(&tag);
        Ok(bytes)
    }
}
