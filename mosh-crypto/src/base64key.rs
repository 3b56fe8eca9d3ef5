use base64::Engine;
use rand::{RngCore, SeedableRng};
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Error, Result};

const PRINTABLE_LEN: usize = 22;

/// The 128-bit session key in both raw and 22-character printable form.
///
/// The printable form carries two implicit `=` pads; re-encoding is checked
/// against the input so a 22-character string that happens to decode to the
/// same 16 bytes via a different (malleable) base64 representation is
/// rejected rather than silently accepted. Zeroized on drop: this key lives
/// for the whole connection lifetime, unlike the short-lived wire values
/// `mosh_newtype!` usually wraps.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Base64Key {
    key: [u8; 16],
}

impl Base64Key {
    pub fn generate() -> Self {
        let mut key = [0u8; 16];
        rand::rngs::StdRng::from_entropy().fill_bytes(&mut key);
        Self { key }
    }

    pub fn from_printable(printable_key: &str) -> Result<Self> {
        if printable_key.len() != PRINTABLE_LEN {
            return Err(Error::BadKeyLength(printable_key.len()));
        }

        let padded = format!("{printable_key}==");
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(padded.as_bytes())
            .map_err(|_| Error::BadKeyEncoding)?;

        if decoded.len() != 16 {
            return Err(Error::BadKeyEncoding);
        }

        let mut key = [0u8; 16];
        key.copy_from_slice(&decoded);
        let candidate = Self { key };

        if candidate.printable_key() != printable_key {
            return Err(Error::MalleableKeyEncoding);
        }

        Ok(candidate)
    }

    pub fn printable_key(&self) -> String {
        let encoded = base64::engine::general_purpose::STANDARD.encode(self.key);
        debug_assert_eq!(&encoded[PRINTABLE_LEN..], "==");
        encoded[..PRINTABLE_LEN].to_string()
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.key
    }
}

impl std::fmt::Debug for Base64Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Base64Key([REDACTED])")
    }
}

/// Constant-time, so comparing a guessed key against the real one (e.g. a
/// forged `MOSH_KEY`) can't be timed to learn how many leading bytes matched.
impl PartialEq for Base64Key {
    fn eq(&self, other: &Self) -> bool {
        self.key.ct_eq(&other.key).into()
    }
}
impl Eq for Base64Key {}
