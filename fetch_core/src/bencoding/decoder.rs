use super::bencode::Bencode;
use crate::error::{CoreError, CoreResult};
use std::collections::BTreeMap;

/// Decodes one value starting at `*pos`, leaving `*pos` just past it.
///
/// Trailing bytes are not an error: `ut_metadata` data messages append raw
/// payload after the bencoded header, and callers read it from `*pos` onwards.
pub fn decode(input: &[u8], pos: &mut usize) -> CoreResult<Bencode> {
    let Some(&lead) = input.get(*pos) else {
        return Err(CoreError::UnexpectedEof { context: "value" });
    };
    match lead {
        b'i' => {
            *pos += 1;
            let digits = take_until(input, pos, b'e', "integer")?;
            let num = parse_ascii::<i64>(digits, *pos)?;
            *pos += 1;
            Ok(Bencode::Int(num))
        }
        b'l' => {
            *pos += 1;
            let mut list = Vec::new();
            loop {
                match input.get(*pos) {
                    None => return Err(CoreError::UnexpectedEof { context: "list" }),
                    Some(b'e') => break,
                    Some(_) => list.push(decode(input, pos)?),
                }
            }
            *pos += 1;
            Ok(Bencode::List(list))
        }
        b'd' => {
            *pos += 1;
            let mut dict = BTreeMap::new();
            loop {
                match input.get(*pos) {
                    None => return Err(CoreError::UnexpectedEof { context: "dict" }),
                    Some(b'e') => break,
                    Some(_) => {
                        let key_pos = *pos;
                        let Bencode::Bytes(key) = decode(input, pos)? else {
                            return Err(CoreError::invalid(key_pos, "dict key must be bytes"));
                        };
                        let value = decode(input, pos)?;
                        dict.insert(key, value);
                    }
                }
            }
            *pos += 1;
            Ok(Bencode::Dict(dict))
        }
        b'0'..=b'9' => {
            let digits = take_until(input, pos, b':', "string length")?;
            let len = parse_ascii::<usize>(digits, *pos)?;
            *pos += 1;
            let end = pos
                .checked_add(len)
                .filter(|end| *end <= input.len())
                .ok_or(CoreError::UnexpectedEof { context: "string" })?;
            let bytes = input[*pos..end].to_vec();
            *pos = end;
            Ok(Bencode::Bytes(bytes))
        }
        c => Err(CoreError::invalid(
            *pos,
            format!("unexpected byte '{}'", c as char),
        )),
    }
}

/// Decodes a whole buffer, rejecting trailing garbage.
pub fn decode_all(input: &[u8]) -> CoreResult<Bencode> {
    let mut pos = 0;
    let value = decode(input, &mut pos)?;
    if pos != input.len() {
        return Err(CoreError::invalid(pos, "trailing data after value"));
    }
    Ok(value)
}

fn take_until<'a>(
    input: &'a [u8],
    pos: &mut usize,
    terminator: u8,
    context: &'static str,
) -> CoreResult<&'a [u8]> {
    let start = *pos;
    let offset = input[start..]
        .iter()
        .position(|&b| b == terminator)
        .ok_or(CoreError::UnexpectedEof { context })?;
    *pos = start + offset;
    Ok(&input[start..*pos])
}

fn parse_ascii<T: std::str::FromStr>(digits: &[u8], pos: usize) -> CoreResult<T> {
    std::str::from_utf8(digits)
        .ok()
        .and_then(|s| s.parse::<T>().ok())
        .ok_or_else(|| {
            CoreError::invalid(
                pos,
                format!("malformed number '{}'", String::from_utf8_lossy(digits)),
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_nested() {
        let input = b"d4:listli1ei-20ee4:name4:spame";
        let value = decode_all(input).expect("valid bencode");
        assert_eq!(value.get(b"name").and_then(Bencode::as_string), Some("spam".to_string()));
        let list = value.get(b"list").and_then(Bencode::as_list).unwrap();
        assert_eq!(list, &[Bencode::Int(1), Bencode::Int(-20)]);
    }

    #[test]
    fn test_decode_leaves_position_after_value() {
        let input = b"d8:msg_typei1eeRAWDATA";
        let mut pos = 0;
        decode(input, &mut pos).unwrap();
        assert_eq!(&input[pos..], b"RAWDATA");
    }

    #[test]
    fn test_decode_truncated_string() {
        let mut pos = 0;
        let err = decode(b"10:short", &mut pos).unwrap_err();
        assert!(matches!(err, CoreError::UnexpectedEof { context: "string" }));
    }

    #[test]
    fn test_decode_rejects_non_bytes_key() {
        assert!(decode_all(b"di1ei2ee").is_err());
    }

    #[test]
    fn test_decode_all_rejects_trailing() {
        assert!(decode_all(b"i1ejunk").is_err());
    }

    #[test]
    fn test_decode_invalid_lead_byte() {
        let mut pos = 0;
        match decode(b"x", &mut pos) {
            Err(CoreError::InvalidBencode { pos, .. }) => assert_eq!(pos, 0),
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
