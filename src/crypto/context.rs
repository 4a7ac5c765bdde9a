//! Key material for the cipher stage.

use std::fmt;
use std::str::FromStr;

use zeroize::Zeroizing;

use crate::{Error, Result};

/// Cipher algorithm identifier recorded in manifests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum EncryptionAlgorithm {
    /// AES with a 128-bit key in CBC mode, PKCS#7 padded.
    #[default]
    Aes128Cbc,
}

impl EncryptionAlgorithm {
    /// Cipher name as understood by `openssl enc`.
    pub fn openssl_name(&self) -> &'static str {
        match self {
            Self::Aes128Cbc => "aes-128-cbc",
        }
    }
}

impl fmt::Display for EncryptionAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Aes128Cbc => write!(f, "AES-128-CBC"),
        }
    }
}

impl FromStr for EncryptionAlgorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.eq_ignore_ascii_case("aes-128-cbc") {
            Ok(Self::Aes128Cbc)
        } else {
            Err(Error::InvalidKey(format!("unsupported algorithm '{s}'")))
        }
    }
}

/// A 128-bit key and IV for AES-128-CBC.
///
/// The pipeline treats both values as opaque. They are zeroed on drop and
/// never appear in `Debug` output.
///
/// ```rust
/// use imgbundle::EncryptionContext;
///
/// let ctx = EncryptionContext::from_hex(
///     "2b7e151628aed2a6abf7158809cf4f3c",
///     "000102030405060708090a0b0c0d0e0f",
/// ).unwrap();
/// assert_eq!(ctx.iv_hex(), "000102030405060708090a0b0c0d0e0f");
/// assert!(!format!("{ctx:?}").contains("2b7e"));
/// ```
#[derive(Clone)]
pub struct EncryptionContext {
    key: Zeroizing<[u8; 16]>,
    iv: Zeroizing<[u8; 16]>,
}

impl EncryptionContext {
    /// Creates a context from raw bytes.
    pub fn new(key: [u8; 16], iv: [u8; 16]) -> Self {
        Self {
            key: Zeroizing::new(key),
            iv: Zeroizing::new(iv),
        }
    }

    /// Parses a key and IV given as 32 hex characters each.
    pub fn from_hex(key: &str, iv: &str) -> Result<Self> {
        Ok(Self {
            key: Zeroizing::new(parse_block(key, "key")?),
            iv: Zeroizing::new(parse_block(iv, "iv")?),
        })
    }

    /// Draws a fresh key and IV from the operating system's CSPRNG.
    pub fn generate() -> Result<Self> {
        let mut key = Zeroizing::new([0u8; 16]);
        let mut iv = Zeroizing::new([0u8; 16]);
        getrandom::getrandom(&mut key[..])
            .and_then(|()| getrandom::getrandom(&mut iv[..]))
            .map_err(|e| Error::InvalidKey(format!("random source unavailable: {e}")))?;
        Ok(Self { key, iv })
    }

    /// The cipher this context is for.
    pub fn algorithm(&self) -> EncryptionAlgorithm {
        EncryptionAlgorithm::Aes128Cbc
    }

    /// The key as 32 lowercase hex characters.
    pub fn key_hex(&self) -> Zeroizing<String> {
        Zeroizing::new(hex::encode(*self.key))
    }

    /// The IV as 32 lowercase hex characters.
    pub fn iv_hex(&self) -> String {
        hex::encode(*self.iv)
    }

    pub(crate) fn key(&self) -> &[u8; 16] {
        &self.key
    }

    pub(crate) fn iv(&self) -> &[u8; 16] {
        &self.iv
    }
}

fn parse_block(value: &str, what: &str) -> Result<[u8; 16]> {
    let value = value.trim();
    if value.len() != 32 {
        return Err(Error::InvalidKey(format!(
            "{what} must be 32 hex characters, got {}",
            value.len()
        )));
    }
    let mut out = [0u8; 16];
    hex::decode_to_slice(value, &mut out)
        .map_err(|e| Error::InvalidKey(format!("{what}: {e}")))?;
    Ok(out)
}

impl fmt::Debug for EncryptionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionContext")
            .field("algorithm", &self.algorithm())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_round_trip() {
        let ctx = EncryptionContext::from_hex(
            "00112233445566778899AABBCCDDEEFF",
            "ffeeddccbbaa99887766554433221100",
        )
        .unwrap();
        assert_eq!(ctx.key_hex().as_str(), "00112233445566778899aabbccddeeff");
        assert_eq!(ctx.iv_hex(), "ffeeddccbbaa99887766554433221100");
        assert_eq!(ctx.key()[0], 0x00);
        assert_eq!(ctx.iv()[0], 0xff);
    }

    #[test]
    fn test_rejects_bad_lengths() {
        let err =
            EncryptionContext::from_hex("abcd", "00112233445566778899aabbccddeeff").unwrap_err();
        assert!(matches!(err, Error::InvalidKey(ref msg) if msg.starts_with("key")));
        let err = EncryptionContext::from_hex("00112233445566778899aabbccddeeff", "").unwrap_err();
        assert!(matches!(err, Error::InvalidKey(ref msg) if msg.starts_with("iv")));
    }

    #[test]
    fn test_rejects_non_hex() {
        assert!(EncryptionContext::from_hex(&"g".repeat(32), &"0".repeat(32)).is_err());
    }

    #[test]
    fn test_generate_is_random() {
        let a = EncryptionContext::generate().unwrap();
        let b = EncryptionContext::generate().unwrap();
        assert_ne!(a.key_hex().as_str(), b.key_hex().as_str());
        assert_eq!(a.key_hex().len(), 32);
        assert_eq!(a.iv_hex().len(), 32);
    }

    #[test]
    fn test_debug_is_redacted() {
        let ctx = EncryptionContext::new([0xab; 16], [0xcd; 16]);
        let debug = format!("{ctx:?}");
        assert!(!debug.contains("ab"));
        assert!(!debug.contains("cd"));
        assert!(debug.contains("Aes128Cbc"));
    }

    #[test]
    fn test_algorithm_names() {
        assert_eq!(EncryptionAlgorithm::Aes128Cbc.to_string(), "AES-128-CBC");
        assert_eq!(EncryptionAlgorithm::Aes128Cbc.openssl_name(), "aes-128-cbc");
        assert_eq!(
            "AES-128-CBC".parse::<EncryptionAlgorithm>().unwrap(),
            EncryptionAlgorithm::Aes128Cbc
        );
    }
}
