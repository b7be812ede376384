//! Magnet URI parsing (BEP 9).

use url::Url;

use crate::error::{CoreError, CoreResult};

/// The parts of a magnet link needed to start a transfer without a descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MagnetLink {
    /// 20-byte info hash from the `xt=urn:btih:` parameter.
    pub info_hash: [u8; 20],
    /// Optional display name (`dn`).
    pub display_name: Option<String>,
    /// Tracker URLs (`tr`), in link order without duplicates.
    pub trackers: Vec<String>,
}

impl MagnetLink {
    /// Parses a magnet URI.
    ///
    /// Supports `magnet:?xt=urn:btih:<hash>` where the hash is either 40 hex
    /// characters or 32 base32 characters.
    pub fn parse(uri: &str) -> CoreResult<Self> {
        if uri.trim().is_empty() {
            return Err(CoreError::magnet("empty magnet link"));
        }
        let url = Url::parse(uri).map_err(|e| CoreError::magnet(e.to_string()))?;
        if url.scheme() != "magnet" {
            return Err(CoreError::magnet(format!(
                "unexpected scheme `{}`",
                url.scheme()
            )));
        }

        let mut info_hash = None;
        let mut display_name = None;
        let mut trackers: Vec<String> = Vec::new();

        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "xt" => {
                    if let Some(hash) = value.strip_prefix("urn:btih:") {
                        info_hash = Some(decode_btih(hash)?);
                    }
                }
                "dn" => display_name = Some(value.into_owned()),
                "tr" => {
                    if !trackers.iter().any(|t| *t == value) {
                        trackers.push(value.into_owned());
                    }
                }
                _ => {}
            }
        }

        let info_hash = info_hash.ok_or_else(|| CoreError::magnet("missing info hash"))?;
        Ok(Self {
            info_hash,
            display_name,
            trackers,
        })
    }
}

fn decode_btih(hash: &str) -> CoreResult<[u8; 20]> {
    let mut out = [0u8; 20];
    match hash.len() {
        40 => {
            hex::decode_to_slice(hash, &mut out)
                .map_err(|_| CoreError::magnet("info hash is not valid hex"))?;
        }
        32 => decode_base32(hash, &mut out)?,
        n => {
            return Err(CoreError::magnet(format!(
                "info hash has {n} characters, expected 40 or 32"
            )));
        }
    }
    Ok(out)
}

// RFC 4648 alphabet, no padding: 32 chars * 5 bits = 160 bits.
fn decode_base32(input: &str, out: &mut [u8; 20]) -> CoreResult<()> {
    let mut buffer: u64 = 0;
    let mut bits = 0;
    let mut idx = 0;
    for c in input.bytes() {
        let value = match c.to_ascii_uppercase() {
            b @ b'A'..=b'Z' => b - b'A',
            b @ b'2'..=b'7' => b - b'2' + 26,
            _ => return Err(CoreError::magnet("info hash is not valid base32")),
        };
        buffer = (buffer << 5) | u64::from(value);
        bits += 5;
        if bits >= 8 {
            bits -= 8;
            out[idx] = (buffer >> bits) as u8;
            idx += 1;
        }
    }
    Ok(())
}
