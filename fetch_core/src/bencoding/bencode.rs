use std::collections::BTreeMap;

/// A decoded bencode value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Bencode {
    Int(i64),
    Bytes(Vec<u8>),
    List(Vec<Bencode>),
    Dict(BTreeMap<Vec<u8>, Bencode>),
}

impl Bencode {
    /// Serializes the value. Dictionary keys come out sorted because the map is ordered.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode_into(&mut out);
        out
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            Bencode::Int(i) => {
                out.push(b'i');
                out.extend_from_slice(i.to_string().as_bytes());
                out.push(b'e');
            }
            Bencode::Bytes(bytes) => encode_bytes(bytes, out),
            Bencode::List(items) => {
                out.push(b'l');
                for item in items {
                    item.encode_into(out);
                }
                out.push(b'e');
            }
            Bencode::Dict(dict) => {
                out.push(b'd');
                for (key, value) in dict {
                    encode_bytes(key, out);
                    value.encode_into(out);
                }
                out.push(b'e');
            }
        }
    }

    /// Looks up `key` when the value is a dictionary.
    pub fn get(&self, key: &[u8]) -> Option<&Bencode> {
        match self {
            Bencode::Dict(dict) => dict.get(key),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Bencode::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Bencode::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Bencode]> {
        match self {
            Bencode::List(l) => Some(l),
            _ => None,
        }
    }

    /// Bytes value decoded lossily as UTF-8.
    pub fn as_string(&self) -> Option<String> {
        self.as_bytes()
            .map(|b| String::from_utf8_lossy(b).into_owned())
    }
}

fn encode_bytes(bytes: &[u8], out: &mut Vec<u8>) {
    out.extend_from_slice(bytes.len().to_string().as_bytes());
    out.push(b':');
    out.extend_from_slice(bytes);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_dict_sorts_keys() {
        let mut dict = BTreeMap::new();
        dict.insert(b"zeta".to_vec(), Bencode::Int(-3));
        dict.insert(b"alpha".to_vec(), Bencode::List(vec![Bencode::Bytes(b"x".to_vec())]));
        let encoded = Bencode::Dict(dict).encode();
        assert_eq!(encoded, b"d5:alphal1:xe4:zetai-3ee".to_vec());
    }

    #[test]
    fn test_accessors() {
        let mut dict = BTreeMap::new();
        dict.insert(b"n".to_vec(), Bencode::Int(7));
        let value = Bencode::Dict(dict);
        assert_eq!(value.get(b"n").and_then(Bencode::as_int), Some(7));
        assert!(value.get(b"missing").is_none());
        assert!(Bencode::Int(1).get(b"n").is_none());
    }
}
