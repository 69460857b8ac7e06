//! Reversible obfuscation of passwords stored in `config.json`.
//!
//! AES-256-CBC with a fixed key and IV, hex encoded. The key material ships with the binary,
//! so this only keeps secrets from being readable at a glance; it is kept stable so existing
//! configuration files keep decrypting.

use aes::Aes256;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, block_padding::Pkcs7};
use thiserror::Error as ThisError;

type Encryptor = cbc::Encryptor<Aes256>;
type Decryptor = cbc::Decryptor<Aes256>;

const KEY: [u8; 32] = [
    30, 109, 66, 153, 47, 66, 187, 238, 218, 5, 30, 168, 33, 238, 88, 86, 95, 253, 56, 134, 228,
    52, 99, 22, 251, 177, 232, 174, 238, 220, 29, 126,
];
const IV: [u8; 16] = [
    157, 22, 24, 132, 59, 136, 219, 139, 49, 175, 15, 214, 90, 102, 202, 4,
];

#[derive(Debug, ThisError)]
pub enum SecretError {
    #[error("not a hex string: {0}")]
    Hex(#[from] hex::FromHexError),

    #[error("bad padding")]
    Padding,

    #[error("plaintext is not UTF-8")]
    Utf8(#[from] std::string::FromUtf8Error),
}

pub fn encrypt(plain: &str) -> String {
    let cipher = Encryptor::new(&KEY.into(), &IV.into())
        .encrypt_padded_vec_mut::<Pkcs7>(plain.as_bytes());
    hex::encode(cipher)
}

pub fn decrypt(cipher_hex: &str) -> Result<String, SecretError> {
    let bytes = hex::decode(cipher_hex)?;
    let plain = Decryptor::new(&KEY.into(), &IV.into())
        .decrypt_padded_vec_mut::<Pkcs7>(&bytes)
        .map_err(|_| SecretError::Padding)?;
    Ok(String::from_utf8(plain)?)
}

/// Whether `value` already is the encrypted form of some password.
pub fn is_encrypted(value: &str) -> bool {
    decrypt(value).is_ok()
}
