//! Session payload cipher
//!
//! AES-128-CFB keyed from a shared 16-byte base key and a random per-session
//! seed. The seed picks a byte rotation of the base key and stamps four bytes
//! of the IV, and is sent to the peer once (plaintext) so it can derive the
//! same schedule. Each call runs a fresh CFB stream, so any frame decrypts
//! independently of the ones before it.

use aes::cipher::{AsyncStreamCipher, KeyIvInit};
use aes::Aes128;

use crate::error::CipherError;

type Aes128CfbEnc = cfb_mode::Encryptor<Aes128>;
type Aes128CfbDec = cfb_mode::Decryptor<Aes128>;

/// Length of the base key, the derived key and the IV
pub const KEY_LEN: usize = 16;

/// IV byte positions carrying the seed, least-significant byte first
const IV_SEED_POSITIONS: [usize; 4] = [1, 4, 9, 12];

/// Immutable per-session cipher; safe to share across threads without locks.
pub struct SessionCipher {
    seed: u32,
    key: [u8; KEY_LEN],
    iv: [u8; KEY_LEN],
}

impl SessionCipher {
    /// Create a cipher with a freshly rolled random seed.
    ///
    /// Fails if `base_key` is not exactly 16 bytes; that is a static
    /// configuration bug, not a runtime condition.
    pub fn new(base_key: &[u8]) -> Result<Self, CipherError> {
        Self::with_seed(base_key, rand::random())
    }

    /// Create a cipher with an explicit seed, e.g. to mirror the peer's view.
    pub fn with_seed(base_key: &[u8], seed: u32) -> Result<Self, CipherError> {
        if base_key.len() != KEY_LEN {
            return Err(CipherError::BadKeyLength {
                expected: KEY_LEN,
                actual: base_key.len(),
            });
        }

        let mut key = [0u8; KEY_LEN];
        for (i, byte) in key.iter_mut().enumerate() {
            *byte = base_key[(seed as usize + i) % KEY_LEN];
        }

        let mut iv = [0u8; KEY_LEN];
        for (i, pos) in IV_SEED_POSITIONS.iter().enumerate() {
            iv[*pos] = (seed >> (8 * i)) as u8;
        }

        Ok(Self { seed, key, iv })
    }

    /// Seed transmitted to the peer during the encryption handshake
    pub fn seed(&self) -> u32 {
        self.seed
    }

    /// Transform `data` in place. Returns false for an empty buffer, in which
    /// case nothing was encrypted.
    pub fn encrypt(&self, data: &mut [u8]) -> bool {
        if data.is_empty() {
            return false;
        }
        Aes128CfbEnc::new(&self.key.into(), &self.iv.into()).encrypt(data);
        true
    }

    /// Inverse of [`encrypt`](Self::encrypt), same contract.
    pub fn decrypt(&self, data: &mut [u8]) -> bool {
        if data.is_empty() {
            return false;
        }
        Aes128CfbDec::new(&self.key.into(), &self.iv.into()).decrypt(data);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::ENCRYPTION_BASE_KEY;
    use proptest::prelude::*;

    #[test]
    fn rejects_wrong_key_length() {
        assert!(matches!(
            SessionCipher::new(b"short"),
            Err(CipherError::BadKeyLength {
                expected: 16,
                actual: 5
            })
        ));
        assert!(SessionCipher::new(ENCRYPTION_BASE_KEY).is_ok());
    }

    #[test]
    fn key_schedule_rotates_base_key() {
        let cipher = SessionCipher::with_seed(ENCRYPTION_BASE_KEY, 3).unwrap();
        assert_eq!(cipher.key[0], ENCRYPTION_BASE_KEY[3]);
        assert_eq!(cipher.key[13], ENCRYPTION_BASE_KEY[0]);
        assert_eq!(cipher.key[15], ENCRYPTION_BASE_KEY[2]);
    }

    #[test]
    fn iv_carries_seed_bytes() {
        let cipher = SessionCipher::with_seed(ENCRYPTION_BASE_KEY, 0x0403_0201).unwrap();
        assert_eq!(cipher.iv[1], 0x01);
        assert_eq!(cipher.iv[4], 0x02);
        assert_eq!(cipher.iv[9], 0x03);
        assert_eq!(cipher.iv[12], 0x04);
        let zero: usize = cipher
            .iv
            .iter()
            .enumerate()
            .filter(|(i, _)| !IV_SEED_POSITIONS.contains(i))
            .map(|(_, b)| *b as usize)
            .sum();
        assert_eq!(zero, 0);
    }

    #[test]
    fn empty_buffer_is_refused() {
        let cipher = SessionCipher::new(ENCRYPTION_BASE_KEY).unwrap();
        let mut empty: [u8; 0] = [];
        assert!(!cipher.encrypt(&mut empty));
        assert!(!cipher.decrypt(&mut empty));
    }

    #[test]
    fn frames_decrypt_independently() {
        // No stream state carries over between calls: decrypting the second
        // frame works without having seen the first.
        let tx = SessionCipher::with_seed(ENCRYPTION_BASE_KEY, 77).unwrap();
        let rx = SessionCipher::with_seed(ENCRYPTION_BASE_KEY, 77).unwrap();

        let mut first = b"frame one".to_vec();
        let mut second = b"frame two, longer than one block....".to_vec();
        assert!(tx.encrypt(&mut first));
        assert!(tx.encrypt(&mut second));

        assert!(rx.decrypt(&mut second));
        assert_eq!(second, b"frame two, longer than one block....");
    }

    proptest! {
        #[test]
        fn round_trip(data in proptest::collection::vec(any::<u8>(), 1..512), seed in any::<u32>()) {
            let cipher = SessionCipher::with_seed(ENCRYPTION_BASE_KEY, seed).unwrap();
            let mut buf = data.clone();
            prop_assert!(cipher.encrypt(&mut buf));
            prop_assert!(cipher.decrypt(&mut buf));
            prop_assert_eq!(buf, data);
        }
    }
}
