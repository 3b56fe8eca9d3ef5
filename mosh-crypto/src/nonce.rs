/// The 96-bit AEAD nonce: a 4-byte zero pad followed by the 8-byte
/// big-endian sequence/direction word. Only the low 8 bytes travel on the
/// wire; the receiver reconstructs the pad itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Nonce {
    bytes: [u8; 12],
}

impl Nonce {
    pub fn from_seq(val: u64) -> Self {
        let mut bytes = [0u8; 12];
        bytes[4..12].copy_from_slice(&val.to_be_bytes());
        Self { bytes }
    }

    /// Reconstructs a nonce from the 8-byte low word carried on the wire.
    pub fn from_wire_low(low: [u8; 8]) -> Self {
        let mut bytes = [0u8; 12];
        bytes[4..12].copy_from_slice(&low);
        Self { bytes }
    }

    pub fn val(&self) -> u64 {
        u64::from_be_bytes(self.bytes[4..12].try_into().unwrap())
    }

    pub fn wire_low(&self) -> [u8; 8] {
        self.bytes[4..12].try_into().unwrap()
    }

    pub fn as_aead_nonce(&self) -> &[u8; 12] {
        &self.bytes
    }
}
