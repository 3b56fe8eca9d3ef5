use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Transport-layer failures. `Io` distinguishes transient from permanent
/// per the protocol's error taxonomy: a transient failure is recorded and
/// surfaced once via `Connection::take_send_exception`, a permanent one is
/// fatal to the session.
#[derive(Debug, Error)]
pub enum Error {
    #[error("network I/O error: {source}")]
    Io {
        #[source]
        source: std::io::Error,
        permanent: bool,
    },

    #[error(transparent)]
    Crypto(#[from] mosh_crypto::Error),

    #[error("malformed fragment or instruction: {0}")]
    Decode(String),

    #[error("protocol version mismatch: expected {expected}, got {actual}")]
    ProtocolMismatch { expected: u32, actual: u32 },

    #[error("received oversize datagram ({0} bytes, limit {1})")]
    OversizeDatagram(usize, usize),
}

impl Error {
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Io { permanent: true, .. } | Error::ProtocolMismatch { .. }
        )
    }
}
