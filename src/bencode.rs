//! Bencode encoding and decoding ([BEP-3]).
//!
//! KRPC messages are bencoded dictionaries, so this module underpins the
//! whole wire layer. The decoder is strict: integers may not carry leading
//! zeros, nesting is depth-limited, and trailing bytes after the value are
//! an error.
//!
//! [BEP-3]: http://bittorrent.org/beps/bep_0003.html

use std::collections::BTreeMap;

use bytes::Bytes;
use thiserror::Error;

const MAX_DEPTH: usize = 64;

/// Errors produced while encoding or decoding bencode.
#[derive(Debug, Error)]
pub enum BencodeError {
    /// Input ended before a complete value was parsed.
    #[error("unexpected end of input")]
    UnexpectedEof,

    /// Integer is malformed (leading zeros, empty, or overflowing).
    #[error("invalid integer: {0}")]
    InvalidInteger(String),

    /// Byte string length prefix is not a valid number.
    #[error("invalid string length")]
    InvalidStringLength,

    /// Encountered a byte that cannot start or continue a value.
    #[error("unexpected character: {0}")]
    UnexpectedChar(char),

    /// Extra data exists after the value.
    #[error("trailing data after value")]
    TrailingData,

    /// Recursion limit exceeded.
    #[error("nesting too deep")]
    NestingTooDeep,
}

/// A bencode value: integer, byte string, list, or dictionary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Integer(i64),
    Bytes(Bytes),
    List(Vec<Value>),
    Dict(BTreeMap<Bytes, Value>),
}

impl Value {
    /// Creates a byte string value from a UTF-8 string.
    pub fn string(s: &str) -> Self {
        Value::Bytes(Bytes::copy_from_slice(s.as_bytes()))
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// The value as a UTF-8 string, if it is a valid UTF-8 byte string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Bytes(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<Bytes, Value>> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }

    /// Looks up a key if this value is a dictionary.
    pub fn get(&self, key: &[u8]) -> Option<&Value> {
        self.as_dict()?.get(key)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::string(s)
    }
}

impl From<Bytes> for Value {
    fn from(b: Bytes) -> Self {
        Value::Bytes(b)
    }
}

/// Decodes exactly one bencode value from `data`.
pub fn decode(data: &[u8]) -> Result<Value, BencodeError> {
    let mut parser = Parser { data, pos: 0 };
    let value = parser.value(0)?;
    if parser.pos != data.len() {
        return Err(BencodeError::TrailingData);
    }
    Ok(value)
}

/// Encodes a value into a fresh buffer. Dictionary keys are emitted in
/// sorted order, as the format requires.
pub fn encode(value: &Value) -> Vec<u8> {
    let mut buf = Vec::new();
    encode_into(value, &mut buf);
    buf
}

fn encode_into(value: &Value, buf: &mut Vec<u8>) {
    match value {
        Value::Integer(i) => {
            buf.push(b'i');
            buf.extend_from_slice(i.to_string().as_bytes());
            buf.push(b'e');
        }
        Value::Bytes(b) => {
            buf.extend_from_slice(b.len().to_string().as_bytes());
            buf.push(b':');
            buf.extend_from_slice(b);
        }
        Value::List(l) => {
            buf.push(b'l');
            for item in l {
                encode_into(item, buf);
            }
            buf.push(b'e');
        }
        Value::Dict(d) => {
            buf.push(b'd');
            for (key, val) in d {
                buf.extend_from_slice(key.len().to_string().as_bytes());
                buf.push(b':');
                buf.extend_from_slice(key);
                encode_into(val, buf);
            }
            buf.push(b'e');
        }
    }
}

struct Parser<'a> {
    data: &'a [u8],
    pos: usize,
}

impl Parser<'_> {
    fn peek(&self) -> Result<u8, BencodeError> {
        self.data
            .get(self.pos)
            .copied()
            .ok_or(BencodeError::UnexpectedEof)
    }

    fn value(&mut self, depth: usize) -> Result<Value, BencodeError> {
        if depth > MAX_DEPTH {
            return Err(BencodeError::NestingTooDeep);
        }
        match self.peek()? {
            b'i' => self.integer(),
            b'l' => self.list(depth),
            b'd' => self.dict(depth),
            b'0'..=b'9' => self.bytes(),
            c => Err(BencodeError::UnexpectedChar(c as char)),
        }
    }

    fn integer(&mut self) -> Result<Value, BencodeError> {
        self.pos += 1;
        let digits = self.take_until(b'e')?;
        let s = std::str::from_utf8(digits)
            .map_err(|_| BencodeError::InvalidInteger("invalid utf8".into()))?;
        if s.is_empty() {
            return Err(BencodeError::InvalidInteger("empty".into()));
        }
        if s.starts_with("-0") || (s.starts_with('0') && s.len() > 1) {
            return Err(BencodeError::InvalidInteger("leading zeros".into()));
        }
        let value: i64 = s
            .parse()
            .map_err(|_| BencodeError::InvalidInteger(s.into()))?;
        Ok(Value::Integer(value))
    }

    fn bytes(&mut self) -> Result<Value, BencodeError> {
        let digits = self.take_until(b':')?;
        let len: usize = std::str::from_utf8(digits)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or(BencodeError::InvalidStringLength)?;
        if self.pos + len > self.data.len() {
            return Err(BencodeError::UnexpectedEof);
        }
        let bytes = Bytes::copy_from_slice(&self.data[self.pos..self.pos + len]);
        self.pos += len;
        Ok(Value::Bytes(bytes))
    }

    fn list(&mut self, depth: usize) -> Result<Value, BencodeError> {
        self.pos += 1;
        let mut list = Vec::new();
        while self.peek()? != b'e' {
            list.push(self.value(depth + 1)?);
        }
        self.pos += 1;
        Ok(Value::List(list))
    }

    fn dict(&mut self, depth: usize) -> Result<Value, BencodeError> {
        self.pos += 1;
        let mut dict = BTreeMap::new();
        while self.peek()? != b'e' {
            let key = match self.value(depth + 1)? {
                Value::Bytes(b) => b,
                _ => return Err(BencodeError::UnexpectedChar('?')),
            };
            let value = self.value(depth + 1)?;
            dict.insert(key, value);
        }
        self.pos += 1;
        Ok(Value::Dict(dict))
    }

    /// Consumes bytes up to (and including) the terminator, returning the
    /// bytes before it.
    fn take_until(&mut self, terminator: u8) -> Result<&[u8], BencodeError> {
        let start = self.pos;
        while self.peek()? != terminator {
            self.pos += 1;
        }
        let inner = &self.data[start..self.pos];
        self.pos += 1;
        Ok(inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_scalars() {
        assert_eq!(decode(b"i42e").unwrap().as_integer(), Some(42));
        assert_eq!(decode(b"i-7e").unwrap().as_integer(), Some(-7));
        assert_eq!(decode(b"i0e").unwrap().as_integer(), Some(0));
        assert_eq!(decode(b"5:hello").unwrap().as_str(), Some("hello"));
        assert_eq!(decode(b"0:").unwrap().as_bytes().unwrap().len(), 0);
    }

    #[test]
    fn decode_rejects_bad_integers() {
        assert!(matches!(
            decode(b"i007e"),
            Err(BencodeError::InvalidInteger(_))
        ));
        assert!(matches!(
            decode(b"i-0e"),
            Err(BencodeError::InvalidInteger(_))
        ));
        assert!(matches!(decode(b"ie"), Err(BencodeError::InvalidInteger(_))));
        assert!(matches!(decode(b"i42"), Err(BencodeError::UnexpectedEof)));
    }

    #[test]
    fn decode_rejects_trailing_data() {
        assert!(matches!(
            decode(b"i42eextra"),
            Err(BencodeError::TrailingData)
        ));
    }

    #[test]
    fn decode_rejects_truncated_string() {
        assert!(matches!(
            decode(b"10:short"),
            Err(BencodeError::UnexpectedEof)
        ));
    }

    #[test]
    fn decode_nested() {
        let value = decode(b"d4:listli1ei2ee4:name5:Alicee").unwrap();
        assert_eq!(value.get(b"name").and_then(Value::as_str), Some("Alice"));
        assert_eq!(
            value.get(b"list").and_then(Value::as_list).map(<[Value]>::len),
            Some(2)
        );
    }

    #[test]
    fn decode_rejects_deep_nesting() {
        let mut data = vec![b'l'; MAX_DEPTH + 2];
        data.extend(std::iter::repeat(b'e').take(MAX_DEPTH + 2));
        assert!(matches!(decode(&data), Err(BencodeError::NestingTooDeep)));
    }

    #[test]
    fn encode_sorts_dict_keys() {
        let mut dict = BTreeMap::new();
        dict.insert(Bytes::from_static(b"zz"), Value::Integer(1));
        dict.insert(Bytes::from_static(b"aa"), Value::Integer(2));
        assert_eq!(encode(&Value::Dict(dict)), b"d2:aai2e2:zzi1ee");
    }

    #[test]
    fn roundtrip() {
        let original = b"d1:ad2:id20:abcdefghij0123456789e1:q4:ping1:t2:aa1:y1:qe";
        let value = decode(original).unwrap();
        assert_eq!(encode(&value), original);
    }
}
