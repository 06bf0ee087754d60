//! Block decryption for encrypted entities.
//!
//! Encrypted content is AES-256 in CBC mode with PKCS#7 padding on the final
//! block. Because CBC only needs the previous ciphertext block as the IV, any
//! block-aligned chunk can be decrypted independently, which is what lets the
//! engine decrypt chunks out of order.

use aes::Aes256;
use cbc::cipher::block_padding::{NoPadding, Pkcs7};
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use thiserror::Error;

use crate::remote::AES_BLOCK_SIZE;

type Aes256CbcDec = cbc::Decryptor<Aes256>;
type Aes256CbcEnc = cbc::Encryptor<Aes256>;

/// Errors from the block cipher.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CipherError {
    /// Key or IV has the wrong length.
    #[error("invalid key or IV length")]
    InvalidLength,

    /// Ciphertext is not a whole number of blocks.
    #[error("ciphertext length {0} is not a multiple of the block size")]
    Misaligned(usize),

    /// PKCS#7 padding on the final block is malformed.
    #[error("invalid padding")]
    BadPadding,
}

/// A block cipher able to decrypt independent, block-aligned chunks.
pub trait ChunkCipher: Send + Sync {
    /// Decrypt `ciphertext` with `key` and `iv`.
    ///
    /// `unpad` is set for the final chunk of an entity, whose last block
    /// carries padding.
    fn decrypt(
        &self,
        ciphertext: &[u8],
        key: &[u8],
        iv: &[u8],
        unpad: bool,
    ) -> Result<Vec<u8>, CipherError>;
}

/// AES-256-CBC.
#[derive(Debug, Default, Clone, Copy)]
pub struct AesCbcCipher;

impl AesCbcCipher {
    pub fn new() -> Self {
        Self
    }

    /// Encrypt `plaintext` with PKCS#7 padding.
    ///
    /// The engine never encrypts; this exists so stores and tests can
    /// produce content the engine can read back.
    pub fn encrypt(
        &self,
        plaintext: &[u8],
        key: &[u8],
        iv: &[u8],
    ) -> Result<Vec<u8>, CipherError> {
        let encryptor =
            Aes256CbcEnc::new_from_slices(key, iv).map_err(|_| CipherError::InvalidLength)?;
        Ok(encryptor.encrypt_padded_vec_mut::<Pkcs7>(plaintext))
    }
}

impl ChunkCipher for AesCbcCipher {
    fn decrypt(
        &self,
        ciphertext: &[u8],
        key: &[u8],
        iv: &[u8],
        unpad: bool,
    ) -> Result<Vec<u8>, CipherError> {
        if ciphertext.len() % AES_BLOCK_SIZE as usize != 0 {
            return Err(CipherError::Misaligned(ciphertext.len()));
        }

        let decryptor =
            Aes256CbcDec::new_from_slices(key, iv).map_err(|_| CipherError::InvalidLength)?;

        if unpad {
            decryptor
                .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
                .map_err(|_| CipherError::BadPadding)
        } else {
            decryptor
                .decrypt_padded_vec_mut::<NoPadding>(ciphertext)
                .map_err(|_| CipherError::BadPadding)
        }
    }
}
