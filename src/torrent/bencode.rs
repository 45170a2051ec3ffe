//! Bencode decoding
//!
//! Tolerant decoder for inbound data (metainfo, tracker responses, extension
//! messages) plus a canonical encoder for values built in memory.

use std::collections::BTreeMap;

use anyhow::Result;
use tracing::trace;

use crate::error::TorrentError;

/// Nesting limit for lists and dictionaries
const MAX_DEPTH: usize = 64;

/// Bencode value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BencodeValue {
    Int(i64),
    Bytes(Vec<u8>),
    List(Vec<BencodeValue>),
    Dict(BTreeMap<Vec<u8>, BencodeValue>),
}

impl BencodeValue {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            BencodeValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            BencodeValue::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Lossy UTF-8 view of a byte string
    pub fn as_string(&self) -> Option<String> {
        self.as_bytes().map(|b| String::from_utf8_lossy(b).into_owned())
    }

    pub fn as_list(&self) -> Option<&[BencodeValue]> {
        match self {
            BencodeValue::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<Vec<u8>, BencodeValue>> {
        match self {
            BencodeValue::Dict(d) => Some(d),
            _ => None,
        }
    }

    /// Dictionary lookup; `None` for non-dictionaries
    pub fn get(&self, key: &[u8]) -> Option<&BencodeValue> {
        self.as_dict().and_then(|d| d.get(key))
    }

    /// Canonical encoding (dictionary keys in sorted order)
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode_into(&mut out);
        out
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            BencodeValue::Int(i) => {
                out.push(b'i');
                out.extend_from_slice(i.to_string().as_bytes());
                out.push(b'e');
            }
            BencodeValue::Bytes(b) => {
                out.extend_from_slice(b.len().to_string().as_bytes());
                out.push(b':');
                out.extend_from_slice(b);
            }
            BencodeValue::List(items) => {
                out.push(b'l');
                for item in items {
                    item.encode_into(out);
                }
                out.push(b'e');
            }
            BencodeValue::Dict(entries) => {
                out.push(b'd');
                for (key, value) in entries {
                    out.extend_from_slice(key.len().to_string().as_bytes());
                    out.push(b':');
                    out.extend_from_slice(key);
                    value.encode_into(out);
                }
                out.push(b'e');
            }
        }
    }
}

/// Decode a complete bencoded document; trailing bytes are an error
pub fn decode(data: &[u8]) -> Result<BencodeValue> {
    let (value, used) = decode_prefix(data)?;
    if used != data.len() {
        return Err(TorrentError::parse_error_with_source(
            "Trailing data after bencode value",
            format!("parsed {}/{} bytes", used, data.len()),
        )
        .into());
    }
    Ok(value)
}

/// Decode the first value in `data`, returning it with the number of bytes consumed
pub fn decode_prefix(data: &[u8]) -> Result<(BencodeValue, usize)> {
    let mut idx = 0;
    let value = parse_value(data, &mut idx, 0)?;
    trace!("Decoded bencode value spanning {} bytes", idx);
    Ok((value, idx))
}

/// Byte span of the value stored under `key` in a top-level dictionary.
///
/// The info hash must be computed over the exact bytes of the `info` value as
/// they appear in the metainfo file, so re-encoding is not an option.
pub fn dict_value_span(data: &[u8], key: &[u8]) -> Result<Option<(usize, usize)>> {
    if data.first() != Some(&b'd') {
        return Err(TorrentError::parse_error("Root must be a dictionary").into());
    }
    let mut idx = 1;
    while idx < data.len() && data[idx] != b'e' {
        let entry_key = match parse_value(data, &mut idx, 1)? {
            BencodeValue::Bytes(b) => b,
            _ => return Err(TorrentError::parse_error("Dictionary key must be bytes").into()),
        };
        let start = idx;
        parse_value(data, &mut idx, 1)?;
        if entry_key == key {
            return Ok(Some((start, idx)));
        }
    }
    Ok(None)
}

fn parse_error(message: &str, idx: usize) -> anyhow::Error {
    TorrentError::parse_error_with_source(message.to_string(), format!("at byte {}", idx)).into()
}

fn parse_value(data: &[u8], idx: &mut usize, depth: usize) -> Result<BencodeValue> {
    if depth > MAX_DEPTH {
        return Err(parse_error("Bencode nesting too deep", *idx));
    }
    let byte = *data.get(*idx).ok_or_else(|| parse_error("Unexpected end of data", *idx))?;

    match byte {
        b'i' => {
            *idx += 1;
            let end = data[*idx..]
                .iter()
                .position(|&b| b == b'e')
                .ok_or_else(|| parse_error("Unterminated integer", *idx))?
                + *idx;
            let num_str = std::str::from_utf8(&data[*idx..end]).map_err(|_| parse_error("Integer is not ASCII", *idx))?;
            let value: i64 = num_str.parse().map_err(|_| parse_error("Invalid integer", *idx))?;
            *idx = end + 1;
            Ok(BencodeValue::Int(value))
        }
        b'l' => {
            *idx += 1;
            let mut list = Vec::new();
            loop {
                match data.get(*idx) {
                    None => return Err(parse_error("Unterminated list", *idx)),
                    Some(b'e') => break,
                    Some(_) => list.push(parse_value(data, idx, depth + 1)?),
                }
            }
            *idx += 1;
            Ok(BencodeValue::List(list))
        }
        b'd' => {
            *idx += 1;
            let mut dict = BTreeMap::new();
            loop {
                match data.get(*idx) {
                    None => return Err(parse_error("Unterminated dictionary", *idx)),
                    Some(b'e') => break,
                    Some(_) => {
                        let key = match parse_value(data, idx, depth + 1)? {
                            BencodeValue::Bytes(b) => b,
                            _ => return Err(parse_error("Dictionary key must be bytes", *idx)),
                        };
                        let value = parse_value(data, idx, depth + 1)?;
                        dict.insert(key, value);
                    }
                }
            }
            *idx += 1;
            Ok(BencodeValue::Dict(dict))
        }
        b'0'..=b'9' => {
            let colon = data[*idx..]
                .iter()
                .position(|&b| b == b':')
                .ok_or_else(|| parse_error("Unterminated string length", *idx))?
                + *idx;
            let len_str = std::str::from_utf8(&data[*idx..colon]).map_err(|_| parse_error("String length is not ASCII", *idx))?;
            let length: usize = len_str.parse().map_err(|_| parse_error("Invalid string length", *idx))?;
            let start = colon + 1;
            let end = start
                .checked_add(length)
                .filter(|&end| end <= data.len())
                .ok_or_else(|| parse_error("String runs past end of data", *idx))?;
            *idx = end;
            Ok(BencodeValue::Bytes(data[start..end].to_vec()))
        }
        _ => Err(parse_error(&format!("Unknown bencode type: {}", byte), *idx)),
    }
}
