use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Crypto-layer failures. `Decrypt` is the session's only non-fatal kind —
/// callers drop the datagram and keep the session alive.
#[derive(Debug, Error)]
pub enum Error {
    #[error("AEAD decryption failed (tag mismatch or truncated ciphertext)")]
    Decrypt,

    #[error("key must be 22 base64 characters, got {0}")]
    BadKeyLength(usize),

    #[error("key is not well-formed base64")]
    BadKeyEncoding,

    #[error("key does not round-trip: base64 representation is malleable")]
    MalleableKeyEncoding,

    #[error("ciphertext too short to contain a nonce and tag")]
    Truncated,
}
