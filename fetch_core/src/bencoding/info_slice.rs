//! Locating the raw "info" value inside a bencoded descriptor.

use super::bencode::Bencode;
use super::decoder::decode;
use crate::error::{CoreError, CoreResult};

/// Returns the exact bytes of the value stored under the top-level "info" key.
///
/// The info hash must be computed over these original bytes, not over a
/// re-encoding, so the slice is taken directly from `input`.
pub fn find_info_slice(input: &[u8]) -> CoreResult<&[u8]> {
    if input.first() != Some(&b'd') {
        return Err(CoreError::InvalidMetainfo {
            reason: "descriptor root is not a dictionary",
        });
    }
    let mut pos = 1;

    while pos < input.len() && input[pos] != b'e' {
        let key_pos = pos;
        let Bencode::Bytes(key) = decode(input, &mut pos)? else {
            return Err(CoreError::invalid(key_pos, "dict key must be bytes"));
        };
        let value_start = pos;
        decode(input, &mut pos)?;
        if key == b"info" {
            return Ok(&input[value_start..pos]);
        }
    }

    Err(CoreError::MissingField { field: "info" })
}
