//! AEAD session and base64 key handling for the state-synchronization protocol.

pub mod base64key;
pub mod error;
pub mod nonce;
pub mod session;

pub use base64key::Base64Key;
pub use error::{Error, Result};
pub use nonce::Nonce;
pub use session::Session;

pub const KEY_SIZE: usize = 16;
pub const NONCE_SIZE: usize = 12;
pub const TAG_SIZE: usize = 16;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_round_trips_through_printable_form() {
        let key = Base64Key::generate();
        let printable = key.printable_key();
        let parsed = Base64Key::from_printable(&printable).unwrap();
        assert_eq!(key.as_bytes(), parsed.as_bytes());
    }

    #[test]
    fn key_wrong_length_rejected() {
        assert!(Base64Key::from_printable("tooshort").is_err());
    }

    #[test]
    fn key_bad_base64_rejected() {
        assert!(Base64Key::from_printable("!!!!!!!!!!!!!!!!!!!!!!").is_err());
    }

    #[test]
    fn encrypt_decrypt_round_trip() {
        let key = Base64Key::generate();
        let session = Session::new(&key);

        let nonce = Nonce::from_seq(42);
        let wire = session.encrypt(nonce, b"hello, mosh");
        let (decoded_nonce, plaintext) = session.decrypt(&wire).unwrap();

        assert_eq!(decoded_nonce.val(), 42);
        assert_eq!(plaintext, b"hello, mosh");
    }

    #[test]
    fn tampered_ciphertext_is_rejected_not_fatal() {
        let key = Base64Key::generate();
        let session = Session::new(&key);

        let nonce = Nonce::from_seq(1);
        let mut wire = session.encrypt(nonce, b"payload");
        let last = wire.len() - 1;
        wire[last] ^= 0xff;

        assert!(matches!(session.decrypt(&wire), Err(Error::Decrypt)));
    }

    #[test]
    fn truncated_ciphertext_is_rejected() {
        let key = Base64Key::generate();
        let session = Session::new(&key);
        assert!(matches!(session.decrypt(&[0u8; 4]), Err(Error::Truncated)));
    }

    #[test]
    fn direction_bit_is_carried_in_nonce_value() {
        const DIRECTION_MASK: u64 = 1 << 63;
        let to_client = Nonce::from_seq(DIRECTION_MASK | 7);
        let to_server = Nonce::from_seq(7);
        assert_ne!(to_client.val(), to_server.val());
        assert_eq!(to_client.val() & !DIRECTION_MASK, 7);
        assert_eq!(to_server.val() & !DIRECTION_MASK, 7);
    }
}
