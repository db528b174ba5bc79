//! Hash primitives used by the SCRAM mechanisms.

use hmac::{Hmac, Mac};
use sha1::Sha1;
use sha2::{Digest, Sha256};

/// Keyed hash, digest and password-based key derivation for one hash family.
pub trait CryptoProvider: Send + Sync {
    /// Digest output length in bytes.
    fn output_len(&self) -> usize;

    fn hmac(&self, key: &[u8], data: &[u8]) -> Vec<u8>;

    fn hash(&self, data: &[u8]) -> Vec<u8>;

    /// PBKDF2 with this provider's HMAC and a single output block (`Hi()` in RFC 5802).
    fn derive_key(&self, password: &[u8], salt: &[u8], iterations: u32) -> Vec<u8> {
        let mut block = salt.to_vec();
        block.extend_from_slice(&1u32.to_be_bytes());
        let mut u = self.hmac(password, &block);
        let mut out = u.clone();
        for _ in 1..iterations {
            u = self.hmac(password, &u);
            out.iter_mut().zip(&u).for_each(|(o, x)| *o ^= x);
        }
        out
    }
}

macro_rules! provider {
    ($name:ident, $digest:ty, $len:expr) => {
        #[derive(Debug, Default, Clone, Copy)]
        pub struct $name;

        impl CryptoProvider for $name {
            fn output_len(&self) -> usize {
                $len
            }

            fn hmac(&self, key: &[u8], data: &[u8]) -> Vec<u8> {
                let mut mac =
                    <Hmac<$digest>>::new_from_slice(key).expect("HMAC accepts any key size");
                mac.update(data);
                mac.finalize().into_bytes().to_vec()
            }

            fn hash(&self, data: &[u8]) -> Vec<u8> {
                <$digest>::digest(data).to_vec()
            }
        }
    };
}

provider!(Sha1Provider, Sha1, 20);
provider!(Sha256Provider, Sha256, 32);
