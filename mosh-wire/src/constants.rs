//! Fundamental and derived constants for the SSP wire format.

// --- Physical limits (spec S6.2) ---

/// Largest datagram the connection layer will accept from `recv`.
pub const RECEIVE_MTU: usize = 2048;

/// Default outbound MTU on the server; a discovered Path MTU may enlarge it.
pub const SEND_MTU: usize = 1400;

/// AEAD tag length in bytes (spec S4.1).
pub const TAG_SIZE: usize = 16;

/// AEAD key length in bytes (spec S4.1).
pub const KEY_SIZE: usize = 16;

/// AEAD nonce length in bytes: 4-byte zero pad + 8-byte sequence/direction word.
pub const NONCE_SIZE: usize = 12;

/// Length of the sequence/direction word prepended on the wire so the
/// receiver can reconstruct the nonce (spec S4.1/S6.2).
pub const NONCE_LOW_SIZE: usize = 8;

/// Length of the cleartext timestamp pair prefixed to the plaintext (spec S6.2).
pub const TIMESTAMP_PAIR_SIZE: usize = 4;

/// Sentinel meaning "timestamp absent" in the 16-bit timestamp fields.
pub const TIMESTAMP_ABSENT: u16 = 0xffff;

// --- Fragmentation (spec S4.3) ---

/// Fixed allowance subtracted from the MTU for fragment + datagram headers
/// before computing how much Instruction payload fits per fragment.
pub const FRAGMENT_HEADER_ALLOWANCE: usize = 66;

/// Largest `fragment_num` a single Instruction may carry (15 bits).
pub const MAX_FRAGMENT_NUM: u16 = 32767;

// --- Protocol version (spec S3.1) ---

/// The only protocol version this implementation speaks; a mismatch is
/// fatal to the session (spec S4.6).
pub const PROTOCOL_VERSION: u32 = 2;

// --- Sent/received state bookkeeping (spec S3.3, S4.5, S4.6) ---

/// Soft cap on the sender's `sent_states` queue before interior erasure kicks in.
pub const SENT_STATES_SOFT_CAP: usize = 32;

/// Offset from the end of `sent_states` at which an interior entry is erased
/// once the soft cap is exceeded.
pub const SENT_STATES_ERASE_FROM_END: usize = 16;

/// Hard cap on the receiver's `received_states` queue before quenching.
pub const RECEIVED_STATES_QUENCH_CAP: usize = 1024;

/// Minimum spacing between quench events.
pub const QUENCH_INTERVAL_MS: u64 = 15_000;

/// Maximum chaff (random padding) length appended to an Instruction.
pub const MAX_CHAFF_LEN: usize = 16;
