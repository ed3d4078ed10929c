use crate::store_path::{ParseStorePathError, StoreDir, StorePath};
use std::collections::BTreeSet;
use thiserror::Error;

/// A store path plus the derivation outputs requested from it, rendered on
/// the wire as `path!out1,out2`. An empty output set renders as the bare
/// path and, for a derivation, means "all outputs".
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct StorePathWithOutputs {
    pub path: StorePath,
    pub outputs: BTreeSet<String>,
}

impl StorePathWithOutputs {
    pub fn opaque(path: StorePath) -> Self {
        Self {
            path,
            outputs: BTreeSet::new(),
        }
    }

    pub fn new(path: StorePath, outputs: impl IntoIterator<Item = String>) -> Self {
        Self {
            path,
            outputs: outputs.into_iter().collect(),
        }
    }

    pub fn to_wire_string(&self) -> Vec<u8> {
        let mut out = self.path.as_bytes().to_vec();
        if !self.outputs.is_empty() {
            out.push(b'!');
            for (i, name) in self.outputs.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                out.extend_from_slice(name.as_bytes());
            }
        }
        out
    }

    pub fn parse(store_dir: &StoreDir, s: &[u8]) -> Result<Self, ParseDerivedPathError> {
        match s.iter().position(|&b| b == b'!') {
            None => Ok(Self::opaque(store_dir.parse_path(s)?)),
            Some(i) => {
                let path = store_dir.parse_path(&s[..i])?;
                let outputs = s[i + 1..]
                    .split(|&b| b == b',')
                    .map(|name| {
                        if name.is_empty() {
                            Err(ParseDerivedPathError::EmptyOutputName(
                                String::from_utf8_lossy(s).into_owned(),
                            ))
                        } else {
                            Ok(String::from_utf8_lossy(name).into_owned())
                        }
                    })
                    .collect::<Result<_, _>>()?;
                Ok(Self { path, outputs })
            }
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseDerivedPathError {
    #[error(transparent)]
    Path(#[from] ParseStorePathError),

    #[error("empty output name in '{0}'")]
    EmptyOutputName(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_outputs_sorted_and_comma_joined() {
        let dir = StoreDir::default();
        let p = dir
            .parse_path(b"/nix/store/aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa-foo.drv")
            .unwrap();
        let sp = StorePathWithOutputs::new(p, ["out".to_string(), "dev".to_string()]);
        assert_eq!(
            sp.to_wire_string(),
            b"/nix/store/aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa-foo.drv!dev,out".to_vec()
        );
    }

    #[test]
    fn bare_path_roundtrips() {
        let dir = StoreDir::default();
        let s = b"/nix/store/aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa-foo";
        let sp = StorePathWithOutputs::parse(&dir, s).unwrap();
        assert!(sp.outputs.is_empty());
        assert_eq!(sp.to_wire_string(), s.to_vec());
    }

    #[test]
    fn parse_rejects_empty_output() {
        let dir = StoreDir::default();
        assert!(StorePathWithOutputs::parse(
            &dir,
            b"/nix/store/aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa-foo.drv!out,"
        )
        .is_err());
    }
}
