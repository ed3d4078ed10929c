use crate::{FileIngestionMethod, Hash, HashAlgo, ParseHashError};
use std::fmt;
use thiserror::Error;

/// A content address: how a store object's contents determine its path.
///
/// Rendered as `text:<algo>:<base32>` or `fixed:[r:]<algo>:<base32>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentAddress {
    Text {
        hash: Hash,
    },
    Fixed {
        method: FileIngestionMethod,
        hash: Hash,
    },
}

impl ContentAddress {
    pub fn hash(&self) -> &Hash {
        match self {
            Self::Text { hash } | Self::Fixed { hash, .. } => hash,
        }
    }

    pub fn parse(s: &[u8]) -> Result<Self, ContentAddressError> {
        let lossy = || String::from_utf8_lossy(s).into_owned();
        let colon = s
            .iter()
            .position(|&b| b == b':')
            .ok_or_else(|| ContentAddressError::InvalidFormat(lossy()))?;

        match &s[..colon] {
            b"text" => {
                let hash = Hash::parse(&s[colon + 1..])?;
                Ok(Self::Text { hash })
            }
            b"fixed" => {
                let rest = &s[colon + 1..];
                let (method, hash_bytes) = match rest.strip_prefix(b"r:") {
                    Some(stripped) => (FileIngestionMethod::Recursive, stripped),
                    None => (FileIngestionMethod::Flat, rest),
                };
                let hash = Hash::parse(hash_bytes)?;
                Ok(Self::Fixed { method, hash })
            }
            _ => Err(ContentAddressError::InvalidFormat(lossy())),
        }
    }

    /// Parse the empty-string-means-absent encoding used on the wire.
    pub fn parse_opt(s: &[u8]) -> Result<Option<Self>, ContentAddressError> {
        if s.is_empty() {
            Ok(None)
        } else {
            Self::parse(s).map(Some)
        }
    }

    /// The wire rendering; `None` renders as the empty string.
    pub fn render_opt(ca: Option<&ContentAddress>) -> String {
        ca.map(ToString::to_string).unwrap_or_default()
    }
}

impl fmt::Display for ContentAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text { hash } => {
                write!(f, "text:{}", hash.to_string_base32())
            }
            Self::Fixed { method, hash } => {
                write!(f, "fixed:{}{}", method.prefix(), hash.to_string_base32())
            }
        }
    }
}

/// A content-address *method*: the recipe without the resulting hash, as
/// sent by `add_to_store` on protocol ≥ 1.25.
///
/// This is a closed sum; dispatch over it is a plain `match`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentAddressMethod {
    Text,
    Fixed {
        method: FileIngestionMethod,
        algo: HashAlgo,
    },
}

impl ContentAddressMethod {
    pub fn render(&self) -> String {
        match self {
            Self::Text => "text:sha256".to_string(),
            Self::Fixed { method, algo } => format!("fixed:{}{}", method.prefix(), algo),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ContentAddressError {
    #[error("invalid content address '{0}'")]
    InvalidFormat(String),

    #[error("invalid hash in content address: {0}")]
    InvalidHash(#[from] ParseHashError),
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHA256_HEX: &str = "1b8e53ea4a4e0ee96ddf34585e6ca61b4b41cb152ae59e17b2e156b01b57f586";

    fn sha256() -> Hash {
        Hash::parse(format!("sha256:{SHA256_HEX}").as_bytes()).unwrap()
    }

    #[test]
    fn renders_and_parses_fixed_recursive() {
        let ca = ContentAddress::Fixed {
            method: FileIngestionMethod::Recursive,
            hash: sha256(),
        };
        let rendered = ca.to_string();
        assert!(rendered.starts_with("fixed:r:sha256:"));
        assert_eq!(ContentAddress::parse(rendered.as_bytes()).unwrap(), ca);
    }

    #[test]
    fn renders_and_parses_text() {
        let ca = ContentAddress::Text { hash: sha256() };
        let rendered = ca.to_string();
        assert!(rendered.starts_with("text:sha256:"));
        assert_eq!(ContentAddress::parse(rendered.as_bytes()).unwrap(), ca);
    }

    #[test]
    fn accepts_base16_digest_on_parse() {
        let parsed = ContentAddress::parse(format!("fixed:sha256:{SHA256_HEX}").as_bytes());
        assert_eq!(
            parsed.unwrap(),
            ContentAddress::Fixed {
                method: FileIngestionMethod::Flat,
                hash: sha256(),
            }
        );
    }

    #[test]
    fn empty_string_is_no_content_address() {
        assert_eq!(ContentAddress::parse_opt(b"").unwrap(), None);
        assert_eq!(ContentAddress::render_opt(None), "");
    }

    #[test]
    fn method_rendering() {
        assert_eq!(ContentAddressMethod::Text.render(), "text:sha256");
        assert_eq!(
            ContentAddressMethod::Fixed {
                method: FileIngestionMethod::Recursive,
                algo: HashAlgo::Sha256,
            }
            .render(),
            "fixed:r:sha256"
        );
        assert_eq!(
            ContentAddressMethod::Fixed {
                method: FileIngestionMethod::Flat,
                algo: HashAlgo::Sha1,
            }
            .render(),
            "fixed:sha1"
        );
    }
}
