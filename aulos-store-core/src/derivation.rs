//! The derivation model and the ATerm parser for on-disk `.drv` files.
//!
//! ```text
//! Derive([outputs],[input-drvs],[input-srcs],"platform","builder",[args],[env])
//! ```
//!
//! Parsing is byte-compatible with the store's `parseDerivation`: strings
//! are double-quoted with `\"`, `\\`, `\n`, `\r`, `\t` escapes, lists are
//! bracketed and comma-separated.

use crate::store_path::{ParseStorePathError, StoreDir, StorePath};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

/// One output slot of a derivation.
///
/// Fixed-output and input-addressed derivations carry their output path in
/// the `.drv`; floating content-addressed ones leave it empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivationOutput {
    pub path: Option<StorePath>,
    /// Hash algorithm spec for fixed outputs, e.g. `sha256` or `r:sha256`;
    /// empty otherwise.
    pub hash_algo: String,
    /// Expected output hash (base16) for fixed outputs; empty otherwise.
    pub hash: String,
}

/// A build recipe.
///
/// Only the "basic" part (everything except `input_drvs`) travels on the
/// wire for `build_derivation`; `input_drvs` exists for derivations parsed
/// from disk.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Derivation {
    pub outputs: BTreeMap<String, DerivationOutput>,
    pub input_drvs: BTreeMap<StorePath, BTreeSet<String>>,
    pub input_srcs: BTreeSet<StorePath>,
    pub platform: Vec<u8>,
    pub builder: Vec<u8>,
    pub args: Vec<Vec<u8>>,
    pub env: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl Derivation {
    pub fn parse(store_dir: &StoreDir, input: &[u8]) -> Result<Self, DerivationParseError> {
        let mut p = Parser { input, pos: 0 };

        p.expect_str(b"Derive(")?;
        let outputs = p.parse_outputs(store_dir)?;
        p.expect_byte(b',')?;
        let input_drvs = p.parse_input_drvs(store_dir)?;
        p.expect_byte(b',')?;
        let input_srcs = p.parse_path_list(store_dir)?;
        p.expect_byte(b',')?;
        let platform = p.parse_string()?;
        p.expect_byte(b',')?;
        let builder = p.parse_string()?;
        p.expect_byte(b',')?;
        let args = p.parse_string_list()?;
        p.expect_byte(b',')?;
        let env = p.parse_env()?;
        p.expect_byte(b')')?;

        Ok(Derivation {
            outputs,
            input_drvs,
            input_srcs: input_srcs.into_iter().collect(),
            platform,
            builder,
            args,
            env,
        })
    }

    /// The output paths computable from the derivation alone, keyed by
    /// output name. Floating content-addressed outputs map to `None`.
    pub fn output_paths(&self) -> BTreeMap<String, Option<StorePath>> {
        self.outputs
            .iter()
            .map(|(name, out)| (name.clone(), out.path.clone()))
            .collect()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DerivationParseError {
    #[error("unexpected end of derivation at byte {0}")]
    UnexpectedEof(usize),

    #[error("expected {expected} at byte {pos}")]
    Expected { pos: usize, expected: String },

    #[error("invalid store path in derivation: {0}")]
    InvalidPath(#[from] ParseStorePathError),

    #[error("output name is not UTF-8 at byte {0}")]
    InvalidOutputName(usize),
}

struct Parser<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Result<u8, DerivationParseError> {
        self.input
            .get(self.pos)
            .copied()
            .ok_or(DerivationParseError::UnexpectedEof(self.pos))
    }

    fn expect_byte(&mut self, b: u8) -> Result<(), DerivationParseError> {
        if self.peek()? == b {
            self.pos += 1;
            Ok(())
        } else {
            Err(DerivationParseError::Expected {
                pos: self.pos,
                expected: format!("'{}'", b as char),
            })
        }
    }

    fn expect_str(&mut self, s: &[u8]) -> Result<(), DerivationParseError> {
        if self.input[self.pos..].starts_with(s) {
            self.pos += s.len();
            Ok(())
        } else {
            Err(DerivationParseError::Expected {
                pos: self.pos,
                expected: format!("\"{}\"", String::from_utf8_lossy(s)),
            })
        }
    }

    fn parse_string(&mut self) -> Result<Vec<u8>, DerivationParseError> {
        self.expect_byte(b'"')?;
        let mut out = Vec::new();
        loop {
            match self.peek()? {
                b'"' => {
                    self.pos += 1;
                    return Ok(out);
                }
                b'\\' => {
                    self.pos += 1;
                    let c = self.peek()?;
                    self.pos += 1;
                    out.push(match c {
                        b'n' => b'\n',
                        b'r' => b'\r',
                        b't' => b'\t',
                        other => other,
                    });
                }
                other => {
                    self.pos += 1;
                    out.push(other);
                }
            }
        }
    }

    fn parse_string_utf8(&mut self) -> Result<String, DerivationParseError> {
        let pos = self.pos;
        String::from_utf8(self.parse_string()?)
            .map_err(|_| DerivationParseError::InvalidOutputName(pos))
    }

    /// `[ elem, elem, ... ]` with `f` consuming each element.
    fn parse_list(
        &mut self,
        mut f: impl FnMut(&mut Self) -> Result<(), DerivationParseError>,
    ) -> Result<(), DerivationParseError> {
        self.expect_byte(b'[')?;
        if self.peek()? == b']' {
            self.pos += 1;
            return Ok(());
        }
        loop {
            f(self)?;
            match self.peek()? {
                b',' => self.pos += 1,
                b']' => {
                    self.pos += 1;
                    return Ok(());
                }
                _ => {
                    return Err(DerivationParseError::Expected {
                        pos: self.pos,
                        expected: "',' or ']'".to_string(),
                    })
                }
            }
        }
    }

    fn parse_outputs(
        &mut self,
        store_dir: &StoreDir,
    ) -> Result<BTreeMap<String, DerivationOutput>, DerivationParseError> {
        let mut outputs = BTreeMap::new();
        self.parse_list(|p| {
            p.expect_byte(b'(')?;
            let name = p.parse_string_utf8()?;
            p.expect_byte(b',')?;
            let path_str = p.parse_string()?;
            p.expect_byte(b',')?;
            let hash_algo = p.parse_string_utf8()?;
            p.expect_byte(b',')?;
            let hash = p.parse_string_utf8()?;
            p.expect_byte(b')')?;

            let path = if path_str.is_empty() {
                None
            } else {
                Some(store_dir.parse_path(&path_str)?)
            };
            outputs.insert(
                name,
                DerivationOutput {
                    path,
                    hash_algo,
                    hash,
                },
            );
            Ok(())
        })?;
        Ok(outputs)
    }

    fn parse_input_drvs(
        &mut self,
        store_dir: &StoreDir,
    ) -> Result<BTreeMap<StorePath, BTreeSet<String>>, DerivationParseError> {
        let mut input_drvs = BTreeMap::new();
        self.parse_list(|p| {
            p.expect_byte(b'(')?;
            let drv = store_dir.parse_path(&p.parse_string()?)?;
            p.expect_byte(b',')?;
            let mut outputs = BTreeSet::new();
            p.parse_list(|p| {
                outputs.insert(p.parse_string_utf8()?);
                Ok(())
            })?;
            p.expect_byte(b')')?;
            input_drvs.insert(drv, outputs);
            Ok(())
        })?;
        Ok(input_drvs)
    }

    fn parse_path_list(
        &mut self,
        store_dir: &StoreDir,
    ) -> Result<Vec<StorePath>, DerivationParseError> {
        let mut paths = Vec::new();
        self.parse_list(|p| {
            paths.push(store_dir.parse_path(&p.parse_string()?)?);
            Ok(())
        })?;
        Ok(paths)
    }

    fn parse_string_list(&mut self) -> Result<Vec<Vec<u8>>, DerivationParseError> {
        let mut items = Vec::new();
        self.parse_list(|p| {
            items.push(p.parse_string()?);
            Ok(())
        })?;
        Ok(items)
    }

    fn parse_env(&mut self) -> Result<BTreeMap<Vec<u8>, Vec<u8>>, DerivationParseError> {
        let mut env = BTreeMap::new();
        self.parse_list(|p| {
            p.expect_byte(b'(')?;
            let key = p.parse_string()?;
            p.expect_byte(b',')?;
            let value = p.parse_string()?;
            p.expect_byte(b')')?;
            env.insert(key, value);
            Ok(())
        })?;
        Ok(env)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DRV: &[u8] = br#"Derive([("dev","/nix/store/cccccccccccccccccccccccccccccccc-foo-dev","",""),("out","/nix/store/bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb-foo","","")],[("/nix/store/dddddddddddddddddddddddddddddddd-bar.drv",["out"])],["/nix/store/eeeeeeeeeeeeeeeeeeeeeeeeeeeeeeee-builder.sh"],"x86_64-linux","/bin/bash",["-e","builder.sh"],[("ENV","a\nb"),("out","/nix/store/bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb-foo")])"#;

    #[test]
    fn parses_a_full_derivation() {
        let dir = StoreDir::default();
        let drv = Derivation::parse(&dir, DRV).unwrap();

        assert_eq!(drv.outputs.len(), 2);
        assert_eq!(
            drv.outputs["out"].path.as_ref().unwrap().name(),
            b"foo"
        );
        assert_eq!(drv.input_drvs.len(), 1);
        assert_eq!(drv.input_srcs.len(), 1);
        assert_eq!(drv.platform, b"x86_64-linux");
        assert_eq!(drv.args, vec![b"-e".to_vec(), b"builder.sh".to_vec()]);
        assert_eq!(drv.env[b"ENV".as_slice()], b"a\nb");
    }

    #[test]
    fn output_paths_map_floating_outputs_to_none() {
        let dir = StoreDir::default();
        let floating = br#"Derive([("out","","r:sha256","")],[],[],"x86_64-linux","/bin/sh",[],[])"#;
        let drv = Derivation::parse(&dir, floating).unwrap();
        assert_eq!(drv.output_paths()["out"], None);
        assert_eq!(drv.outputs["out"].hash_algo, "r:sha256");
    }

    #[test]
    fn empty_lists_parse() {
        let dir = StoreDir::default();
        let minimal = br#"Derive([("out","/nix/store/bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb-m","","")],[],[],"","",[],[])"#;
        let drv = Derivation::parse(&dir, minimal).unwrap();
        assert!(drv.input_drvs.is_empty());
        assert!(drv.args.is_empty());
    }

    #[test]
    fn truncated_input_is_rejected() {
        let dir = StoreDir::default();
        assert!(matches!(
            Derivation::parse(&dir, b"Derive([(\"out\""),
            Err(DerivationParseError::UnexpectedEof(_))
        ));
    }
}
