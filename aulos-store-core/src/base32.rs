//! The store's base32 codec.
//!
//! This is not RFC 4648: the alphabet omits `e`, `o`, `u` and `t`, and the
//! digits are emitted in reverse bit order, lowest five bits of the digest
//! becoming the *last* character.

use thiserror::Error;

pub const ALPHABET: &[u8; 32] = b"0123456789abcdfghijklmnpqrsvwxyz";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Base32DecodeError {
    #[error("invalid base32 character '{0}'")]
    InvalidChar(char),

    #[error("invalid base32 length {0}")]
    InvalidLength(usize),

    #[error("nonzero carry in base32 input")]
    NonzeroCarry,
}

/// Encoded length for `len` decoded bytes.
pub const fn encode_len(len: usize) -> usize {
    if len == 0 {
        0
    } else {
        (len * 8 - 1) / 5 + 1
    }
}

/// Decoded length for `len` encoded characters.
pub const fn decode_len(len: usize) -> usize {
    len * 5 / 8
}

pub fn encode(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(encode_len(input.len()));
    for n in (0..encode_len(input.len())).rev() {
        let b = n * 5;
        let i = b / 8;
        let j = b % 8;
        let mut c = input[i] >> j;
        if i + 1 < input.len() {
            c |= input[i + 1] << (8 - j);
        }
        out.push(ALPHABET[(c & 0x1f) as usize]);
    }
    out
}

pub fn decode(input: &[u8]) -> Result<Vec<u8>, Base32DecodeError> {
    let mut out = vec![0u8; decode_len(input.len())];
    if out.is_empty() && !input.is_empty() {
        return Err(Base32DecodeError::InvalidLength(input.len()));
    }

    for (n, &c) in input.iter().rev().enumerate() {
        let digit = ALPHABET
            .iter()
            .position(|&a| a == c)
            .ok_or(Base32DecodeError::InvalidChar(c as char))? as u8;

        let b = n * 5;
        let i = b / 8;
        let j = b % 8;
        out[i] |= digit << j;

        let carry = digit.checked_shr(8 - j as u32).unwrap_or(0);
        if i + 1 < out.len() {
            out[i + 1] |= carry;
        } else if carry != 0 {
            return Err(Base32DecodeError::NonzeroCarry);
        }
    }

    Ok(out)
}
