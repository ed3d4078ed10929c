use crate::base32;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HashAlgo {
    Md5,
    Sha1,
    Sha256,
    Sha512,
}

impl HashAlgo {
    pub fn name(&self) -> &'static str {
        match self {
            HashAlgo::Md5 => "md5",
            HashAlgo::Sha1 => "sha1",
            HashAlgo::Sha256 => "sha256",
            HashAlgo::Sha512 => "sha512",
        }
    }

    pub fn digest_size(&self) -> usize {
        match self {
            HashAlgo::Md5 => 16,
            HashAlgo::Sha1 => 20,
            HashAlgo::Sha256 => 32,
            HashAlgo::Sha512 => 64,
        }
    }

    pub fn base16_len(&self) -> usize {
        self.digest_size() * 2
    }

    pub fn base32_len(&self) -> usize {
        base32::encode_len(self.digest_size())
    }

    pub fn base64_len(&self) -> usize {
        self.digest_size().div_ceil(3) * 4
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ParseHashError> {
        match bytes {
            b"md5" => Ok(HashAlgo::Md5),
            b"sha1" => Ok(HashAlgo::Sha1),
            b"sha256" => Ok(HashAlgo::Sha256),
            b"sha512" => Ok(HashAlgo::Sha512),
            _ => Err(ParseHashError::UnknownAlgorithm(
                String::from_utf8_lossy(bytes).into_owned(),
            )),
        }
    }
}

impl fmt::Display for HashAlgo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseHashError {
    #[error("unknown hash algorithm '{0}'")]
    UnknownAlgorithm(String),

    #[error("hash '{hash}' has wrong length for algorithm {algo}")]
    WrongLength { algo: &'static str, hash: String },

    #[error("hash '{0}' has no algorithm prefix and none was implied")]
    MissingAlgorithm(String),

    #[error("invalid {encoding} encoding in hash '{hash}'")]
    InvalidEncoding {
        encoding: &'static str,
        hash: String,
    },

    #[error("digest is {actual} bytes, expected {expected}")]
    InvalidDigestSize { expected: usize, actual: usize },
}

/// A hash digest together with its algorithm.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Hash {
    pub algo: HashAlgo,
    digest: Vec<u8>,
}

impl Hash {
    pub fn new(algo: HashAlgo, digest: Vec<u8>) -> Result<Self, ParseHashError> {
        if digest.len() != algo.digest_size() {
            return Err(ParseHashError::InvalidDigestSize {
                expected: algo.digest_size(),
                actual: digest.len(),
            });
        }
        Ok(Hash { algo, digest })
    }

    /// Parse `algo:digest` with the digest in base16, base32 or base64,
    /// distinguished by length.
    pub fn parse(bytes: &[u8]) -> Result<Self, ParseHashError> {
        Self::parse_any(bytes, None)
    }

    /// Like [`Hash::parse`], but also accepts a bare digest when `implied`
    /// names the algorithm (the daemon sends NAR hashes as bare base16).
    pub fn parse_any(bytes: &[u8], implied: Option<HashAlgo>) -> Result<Self, ParseHashError> {
        let (algo, digest_bytes) = match bytes.iter().position(|&b| b == b':') {
            Some(i) => (HashAlgo::from_bytes(&bytes[..i])?, &bytes[i + 1..]),
            None => match implied {
                Some(algo) => (algo, bytes),
                None => {
                    return Err(ParseHashError::MissingAlgorithm(
                        String::from_utf8_lossy(bytes).into_owned(),
                    ))
                }
            },
        };

        let lossy = || String::from_utf8_lossy(digest_bytes).into_owned();

        let digest = if digest_bytes.len() == algo.base16_len() {
            hex::decode(digest_bytes).map_err(|_| ParseHashError::InvalidEncoding {
                encoding: "base16",
                hash: lossy(),
            })?
        } else if digest_bytes.len() == algo.base32_len() {
            base32::decode(digest_bytes).map_err(|_| ParseHashError::InvalidEncoding {
                encoding: "base32",
                hash: lossy(),
            })?
        } else if digest_bytes.len() == algo.base64_len() {
            BASE64
                .decode(digest_bytes)
                .map_err(|_| ParseHashError::InvalidEncoding {
                    encoding: "base64",
                    hash: lossy(),
                })?
        } else {
            return Err(ParseHashError::WrongLength {
                algo: algo.name(),
                hash: lossy(),
            });
        };

        Hash::new(algo, digest)
    }

    pub fn digest(&self) -> &[u8] {
        &self.digest
    }

    /// Bare lowercase base16, the form `AddToStoreNar` puts on the wire.
    pub fn to_hex(&self) -> String {
        hex::encode(&self.digest)
    }

    /// Bare base32, the canonical rendering inside content addresses.
    pub fn to_nix_base32(&self) -> String {
        String::from_utf8(base32::encode(&self.digest)).expect("base32 alphabet is ASCII")
    }

    /// `algo:base32`, the prefixed rendering.
    pub fn to_string_base32(&self) -> String {
        format!("{}:{}", self.algo, self.to_nix_base32())
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algo, self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHA256_HEX: &str = "1b8e53ea4a4e0ee96ddf34585e6ca61b4b41cb152ae59e17b2e156b01b57f586";

    #[test]
    fn parses_prefixed_base16() {
        let h = Hash::parse(format!("sha256:{SHA256_HEX}").as_bytes()).unwrap();
        assert_eq!(h.algo, HashAlgo::Sha256);
        assert_eq!(h.to_hex(), SHA256_HEX);
    }

    #[test]
    fn parses_bare_with_implied_algo() {
        let h = Hash::parse_any(SHA256_HEX.as_bytes(), Some(HashAlgo::Sha256)).unwrap();
        assert_eq!(h.to_hex(), SHA256_HEX);
        assert!(Hash::parse_any(SHA256_HEX.as_bytes(), None).is_err());
    }

    #[test]
    fn base32_roundtrip() {
        let h = Hash::parse(format!("sha256:{SHA256_HEX}").as_bytes()).unwrap();
        let b32 = h.to_string_base32();
        let back = Hash::parse(b32.as_bytes()).unwrap();
        assert_eq!(h, back);
        assert_eq!(b32.len(), "sha256:".len() + 52);
    }

    #[test]
    fn rejects_wrong_length() {
        assert!(matches!(
            Hash::parse(b"sha256:abcd"),
            Err(ParseHashError::WrongLength { .. })
        ));
    }
}
