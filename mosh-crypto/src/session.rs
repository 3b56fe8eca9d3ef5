use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::Aes128Gcm;

use crate::base64key::Base64Key;
use crate::error::{Error, Result};
use crate::nonce::Nonce;

/// One per-direction AEAD context. `encrypt`/`decrypt` satisfy the AE-0.12
/// contract described in the protocol's external interface: a 128-bit key,
/// a 96-bit nonce built from a 4-byte zero pad plus an 8-byte
/// sequence/direction word, and a 16-byte tag. AES-OCB itself is treated as
/// a black box upstream; this substitutes AES-128-GCM, which satisfies the
/// same init/encrypt/decrypt shape.
pub struct Session {
    cipher: Aes128Gcm,
}

impl Session {
    pub fn new(key: &Base64Key) -> Self {
        tracing::debug!(
            fingerprint = %hex::encode(&key.as_bytes()[..4]),
            "initializing AEAD session"
        );
        let cipher = Aes128Gcm::new_from_slice(key.as_bytes()).expect("16-byte key");
        Self { cipher }
    }

    /// Encrypts `plaintext` under `nonce`, returning `nonce_low ‖ ciphertext ‖ tag`.
    pub fn encrypt(&self, nonce: Nonce, plaintext: &[u8]) -> Vec<u8> {
        let ciphertext = self
            .cipher
            .encrypt(
                nonce.as_aead_nonce().into(),
                Payload {
                    msg: plaintext,
                    aad: &[],
                },
            )
            .expect("encryption with a fixed-size key/nonce cannot fail");

        let mut out = Vec::with_capacity(8 + ciphertext.len());
        out.extend_from_slice(&nonce.wire_low());
        out.extend_from_slice(&ciphertext);
        out
    }

    /// Splits the wire form into its nonce and decrypts the remainder.
    /// Any integrity or shape failure is reported as `Error::Decrypt`; the
    /// caller drops the datagram and the session continues.
    pub fn decrypt(&self, wire: &[u8]) -> Result<(Nonce, Vec<u8>)> {
        if wire.len() < 8 + 16 {
            return Err(Error::Truncated);
        }

        let mut low = [0u8; 8];
        low.copy_from_slice(&wire[..8]);
        let nonce = Nonce::from_wire_low(low);

        let plaintext = self
            .cipher
            .decrypt(
                nonce.as_aead_nonce().into(),
                Payload {
                    msg: &wire[8..],
                    aad: &[],
                },
            )
            .map_err(|_| Error::Decrypt)?;

        Ok((nonce, plaintext))
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Session(..)")
    }
}
