use aes::cipher::{generic_array::GenericArray, BlockDecrypt, BlockEncrypt, KeyInit};
use rand::RngCore;

pub const KEY_SIZE: usize = 16;
pub const BLOCK_SIZE: usize = 16;

/// AES-128 services the secure-channel layer is built on.
///
/// `encrypt`/`decrypt` operate in place on whole blocks: single-block ECB
/// when `iv` is `None`, CBC chaining otherwise. The data length must be a
/// multiple of the block size.
pub trait CryptoSuite {
    /// Returns true when the suite can actually perform AES-128 operations.
    /// A suite that returns false disables the secure-channel paths of any
    /// peer built on top of it.
    fn is_available(&self) -> bool;

    /// Fills the buffer with cryptographically secure random bytes.
    fn fill_random(&mut self, buf: &mut [u8]);

    fn encrypt(&self, key: &[u8; KEY_SIZE], iv: Option<&[u8; BLOCK_SIZE]>, data: &mut [u8]);

    fn decrypt(&self, key: &[u8; KEY_SIZE], iv: Option<&[u8; BLOCK_SIZE]>, data: &mut [u8]);
}

#[inline]
fn assert_block_sized(len: usize) {
    if len == 0 || len % BLOCK_SIZE != 0 {
        panic!(
            "Cipher data length ({}) must be a non-zero multiple of the block size ({})",
            len, BLOCK_SIZE
        )
    }
}

/// Software AES-128 suite.
pub struct Aes128Suite;

impl CryptoSuite for Aes128Suite {
    #[inline]
    fn is_available(&self) -> bool {
        true
    }

    #[inline]
    fn fill_random(&mut self, buf: &mut [u8]) {
        rand::thread_rng().fill_bytes(buf);
    }

    fn encrypt(&self, key: &[u8; KEY_SIZE], iv: Option<&[u8; BLOCK_SIZE]>, data: &mut [u8]) {
        assert_block_sized(data.len());

        let cipher = aes::Aes128::new(GenericArray::from_slice(key));

        match iv {
            Some(iv) => {
                let mut chain = *iv;
                for block in data.chunks_exact_mut(BLOCK_SIZE) {
                    for (b, c) in block.iter_mut().zip(chain.iter()) {
                        *b ^= c;
                    }
                    cipher.encrypt_block(GenericArray::from_mut_slice(block));
                    chain.copy_from_slice(block);
                }
            }
            None => {
                for block in data.chunks_exact_mut(BLOCK_SIZE) {
                    cipher.encrypt_block(GenericArray::from_mut_slice(block));
                }
            }
        }
    }

    fn decrypt(&self, key: &[u8; KEY_SIZE], iv: Option<&[u8; BLOCK_SIZE]>, data: &mut [u8]) {
        assert_block_sized(data.len());

        let cipher = aes::Aes128::new(GenericArray::from_slice(key));

        match iv {
            Some(iv) => {
                let mut chain = *iv;
                for block in data.chunks_exact_mut(BLOCK_SIZE) {
                    let mut cipher_text = [0u8; BLOCK_SIZE];
                    cipher_text.copy_from_slice(block);
                    cipher.decrypt_block(GenericArray::from_mut_slice(block));
                    for (b, c) in block.iter_mut().zip(chain.iter()) {
                        *b ^= c;
                    }
                    chain = cipher_text;
                }
            }
            None => {
                for block in data.chunks_exact_mut(BLOCK_SIZE) {
                    cipher.decrypt_block(GenericArray::from_mut_slice(block));
                }
            }
        }
    }
}

/// Stand-in suite for peers built without secure-channel support. Every
/// operation is inert; callers must gate on `is_available`.
pub struct NullSuite;

impl CryptoSuite for NullSuite {
    #[inline]
    fn is_available(&self) -> bool {
        false
    }

    fn fill_random(&mut self, buf: &mut [u8]) {
        for b in buf.iter_mut() {
            *b = 0;
        }
    }

    fn encrypt(&self, _key: &[u8; KEY_SIZE], _iv: Option<&[u8; BLOCK_SIZE]>, _data: &mut [u8]) {}

    fn decrypt(&self, _key: &[u8; KEY_SIZE], _iv: Option<&[u8; BLOCK_SIZE]>, _data: &mut [u8]) {}
}

/// Fills the provided buffer with cryptographically secure random bytes.
#[inline]
pub fn random_bytes(out: &mut [u8]) {
    rand::thread_rng().fill_bytes(out);
}
