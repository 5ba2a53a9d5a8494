use super::BencodeError;
use super::BencodeResult;
use super::BencodeValue;

use std::collections::HashMap;
use tracing::instrument;

/// Cursor-based decoder over a byte slice.
///
/// The decoder consumes bytes from the front of `input` and tracks its
/// position explicitly. Callers that need the raw source bytes of a
/// sub-value (the `info` dictionary, for the infohash) read [`position`]
/// around a decode call; the slice between the two positions is exactly
/// the wire form of that value.
///
/// [`position`]: Decoder::position
pub struct Decoder<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(input: &'a [u8]) -> Self {
        Decoder { input, pos: 0 }
    }

    /// Current cursor position, in bytes from the start of the input.
    pub fn position(&self) -> usize {
        self.pos
    }

    fn peek(&self) -> BencodeResult<u8> {
        self.input
            .get(self.pos)
            .copied()
            .ok_or(BencodeError::UnexpectedEof)
    }

    fn advance(&mut self) -> BencodeResult<u8> {
        let byte = self.peek()?;
        self.pos += 1;
        Ok(byte)
    }

    fn take(&mut self, count: usize) -> BencodeResult<&'a [u8]> {
        if self.input.len() - self.pos < count {
            return Err(BencodeError::UnexpectedEof);
        }
        let slice = &self.input[self.pos..self.pos + count];
        self.pos += count;
        Ok(slice)
    }

    /// Consumes bytes up to (and including) `delimiter`, returning the
    /// bytes before it. Used for the decimal runs in string lengths and
    /// integers.
    fn read_until(&mut self, delimiter: u8) -> BencodeResult<&'a [u8]> {
        let start = self.pos;
        loop {
            let byte = self.advance()?;
            if byte == delimiter {
                return Ok(&self.input[start..self.pos - 1]);
            }
        }
    }

    /// Decodes a byte string in the form `<length>:<data>`.
    ///
    /// Fails with `InvalidStringLength` when the length prefix is not a
    /// decimal number and with `UnexpectedEof` when the data is truncated.
    pub fn decode_string(&mut self) -> BencodeResult<Vec<u8>> {
        let length_bytes = self.read_until(b':')?;
        let length_str =
            std::str::from_utf8(length_bytes).map_err(|_| BencodeError::InvalidStringLength)?;
        let length = length_str
            .parse::<usize>()
            .map_err(|_| BencodeError::InvalidStringLength)?;
        Ok(self.take(length)?.to_vec())
    }

    /// Decodes an integer in the form `i<decimal>e`.
    ///
    /// Leading zeros, `-0`, and empty digit runs are rejected, as is
    /// anything that does not fit a signed 64-bit integer.
    pub fn decode_integer(&mut self) -> BencodeResult<i64> {
        if self.advance()? != b'i' {
            return Err(BencodeError::InvalidFormat(
                "integer must start with 'i'".to_string(),
            ));
        }
        let digits = self.read_until(b'e')?;
        let num_str = std::str::from_utf8(digits).map_err(|_| BencodeError::InvalidInteger)?;
        if num_str.is_empty() || num_str == "-0" {
            return Err(BencodeError::InvalidInteger);
        }
        if num_str.len() > 1 && (num_str.starts_with('0') || num_str.starts_with("-0")) {
            return Err(BencodeError::InvalidInteger);
        }
        num_str
            .parse::<i64>()
            .map_err(|_| BencodeError::InvalidInteger)
    }

    fn decode_list(&mut self) -> BencodeResult<Vec<BencodeValue>> {
        if self.advance()? != b'l' {
            return Err(BencodeError::InvalidFormat(
                "list must start with 'l'".to_string(),
            ));
        }
        let mut list = Vec::new();
        loop {
            if self.peek()? == b'e' {
                self.advance()?;
                return Ok(list);
            }
            list.push(self.decode_value()?);
        }
    }

    /// Decodes a dictionary in the form `d<key><value>...e`.
    ///
    /// Keys must be byte strings in strictly increasing raw-byte order;
    /// out-of-order or duplicate keys fail with `UnsortedDictKeys`. The
    /// ordering check is what lets the sorted-key encoder reproduce the
    /// original bytes.
    fn decode_dict(&mut self) -> BencodeResult<HashMap<Vec<u8>, BencodeValue>> {
        if self.advance()? != b'd' {
            return Err(BencodeError::InvalidFormat(
                "dictionary must start with 'd'".to_string(),
            ));
        }
        let mut dict = HashMap::new();
        let mut last_key: Option<Vec<u8>> = None;
        loop {
            if self.peek()? == b'e' {
                self.advance()?;
                return Ok(dict);
            }
            let key = self.decode_string()?;
            if let Some(previous) = &last_key {
                if key <= *previous {
                    return Err(BencodeError::UnsortedDictKeys);
                }
            }
            let value = self.decode_value()?;
            last_key = Some(key.clone());
            dict.insert(key, value);
        }
    }

    /// Decodes the next value of any kind, dispatching on the tag byte.
    pub fn decode_value(&mut self) -> BencodeResult<BencodeValue> {
        match self.peek()? {
            b'0'..=b'9' => self.decode_string().map(BencodeValue::String),
            b'i' => self.decode_integer().map(BencodeValue::Integer),
            b'l' => self.decode_list().map(BencodeValue::List),
            b'd' => self.decode_dict().map(BencodeValue::Dict),
            other => Err(BencodeError::InvalidFormat(format!(
                "unexpected tag byte: 0x{:02x}",
                other
            ))),
        }
    }
}

/// Decodes a complete value, rejecting trailing bytes.
#[instrument(skip(bytes), level = "trace")]
pub fn decode(bytes: &[u8]) -> BencodeResult<BencodeValue> {
    let mut decoder = Decoder::new(bytes);
    let value = decoder.decode_value()?;
    if decoder.position() != bytes.len() {
        return Err(BencodeError::TrailingData);
    }
    Ok(value)
}

/// Walks a top-level dictionary and returns the raw source bytes of the
/// value stored under `key`, or `None` when the key is absent.
///
/// The returned slice is byte-identical to what the encoder that produced
/// `bytes` emitted for that value, which is what infohash computation
/// requires: hashing this slice is independent of any re-encoding.
#[instrument(skip(bytes), level = "trace")]
pub fn raw_slice_for_key<'a>(bytes: &'a [u8], key: &[u8]) -> BencodeResult<Option<&'a [u8]>> {
    let mut decoder = Decoder::new(bytes);
    if decoder.advance()? != b'd' {
        return Err(BencodeError::InvalidFormat(
            "top-level value is not a dictionary".to_string(),
        ));
    }
    loop {
        if decoder.peek()? == b'e' {
            decoder.advance()?;
            return Ok(None);
        }
        let entry_key = decoder.decode_string()?;
        let value_start = decoder.position();
        decoder.decode_value()?;
        if entry_key == key {
            return Ok(Some(&bytes[value_start..decoder.position()]));
        }
    }
}
