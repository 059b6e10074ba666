//! Consensus wire codec.
//!
//! Every object that ends up inside a block id, a merkle leaf or the
//! block log serializes through this module. Lengths and counts use
//! unsigned LEB128, integers are little-endian fixed width. The byte
//! layout is consensus-critical, which is why this is hand-rolled
//! instead of delegated to a serde backend.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum WireError {
  #[error("unexpected end of input")]
  UnexpectedEnd,

  #[error("malformed varint: {0}")]
  Varint(#[from] unsigned_varint::decode::Error),

  #[error("invalid discriminant {value} for {what}")]
  InvalidDiscriminant { what: &'static str, value: u8 },

  #[error("declared length {0} exceeds remaining input")]
  LengthOutOfBounds(u64),

  #[error("{0} bytes of trailing garbage after decoded value")]
  TrailingBytes(usize),

  #[error("invalid {0} encoding")]
  InvalidValue(&'static str),
}

type Result<T> = std::result::Result<T, WireError>;

pub trait WireEncode {
  fn encode(&self, out: &mut Vec<u8>);

  fn to_wire_bytes(&self) -> Vec<u8> {
    let mut out = Vec::new();
    self.encode(&mut out);
    out
  }
}

pub trait WireDecode: Sized {
  fn decode(input: &mut &[u8]) -> Result<Self>;

  /// Decodes a value that must consume the entire input.
  fn from_wire_bytes(bytes: &[u8]) -> Result<Self> {
    let mut input = bytes;
    let value = Self::decode(&mut input)?;
    if !input.is_empty() {
      return Err(WireError::TrailingBytes(input.len()));
    }
    Ok(value)
  }
}

pub fn put_varuint(out: &mut Vec<u8>, value: u64) {
  let mut buf = unsigned_varint::encode::u64_buffer();
  out.extend_from_slice(unsigned_varint::encode::u64(value, &mut buf));
}

pub fn get_varuint(input: &mut &[u8]) -> Result<u64> {
  let (value, rest) = unsigned_varint::decode::u64(input)?;
  *input = rest;
  Ok(value)
}

pub fn put_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
  put_varuint(out, bytes.len() as u64);
  out.extend_from_slice(bytes);
}

pub fn get_bytes(input: &mut &[u8]) -> Result<Vec<u8>> {
  let len = get_varuint(input)?;
  if len > input.len() as u64 {
    return Err(WireError::LengthOutOfBounds(len));
  }
  let (head, rest) = input.split_at(len as usize);
  *input = rest;
  Ok(head.to_vec())
}

fn take<'a>(input: &mut &'a [u8], n: usize) -> Result<&'a [u8]> {
  if input.len() < n {
    return Err(WireError::UnexpectedEnd);
  }
  let (head, rest) = input.split_at(n);
  *input = rest;
  Ok(head)
}

macro_rules! impl_wire_int {
  ($($t:ty),*) => {
    $(
      impl WireEncode for $t {
        fn encode(&self, out: &mut Vec<u8>) {
          out.extend_from_slice(&self.to_le_bytes());
        }
      }

      impl WireDecode for $t {
        fn decode(input: &mut &[u8]) -> Result<Self> {
          let bytes = take(input, std::mem::size_of::<$t>())?;
          Ok(<$t>::from_le_bytes(bytes.try_into().unwrap()))
        }
      }
    )*
  };
}

impl_wire_int!(u8, u16, u32, u64, i64);

impl WireEncode for bool {
  fn encode(&self, out: &mut Vec<u8>) {
    out.push(*self as u8);
  }
}

impl WireDecode for bool {
  fn decode(input: &mut &[u8]) -> Result<Self> {
    match u8::decode(input)? {
      0 => Ok(false),
      1 => Ok(true),
      value => Err(WireError::InvalidDiscriminant { what: "bool", value }),
    }
  }
}

impl<const N: usize> WireEncode for [u8; N] {
  fn encode(&self, out: &mut Vec<u8>) {
    out.extend_from_slice(self);
  }
}

impl<const N: usize> WireDecode for [u8; N] {
  fn decode(input: &mut &[u8]) -> Result<Self> {
    Ok(take(input, N)?.try_into().unwrap())
  }
}

impl WireEncode for Vec<u8> {
  fn encode(&self, out: &mut Vec<u8>) {
    put_bytes(out, self);
  }
}

impl WireDecode for Vec<u8> {
  fn decode(input: &mut &[u8]) -> Result<Self> {
    get_bytes(input)
  }
}

impl WireEncode for String {
  fn encode(&self, out: &mut Vec<u8>) {
    put_bytes(out, self.as_bytes());
  }
}

impl WireDecode for String {
  fn decode(input: &mut &[u8]) -> Result<Self> {
    String::from_utf8(get_bytes(input)?)
      .map_err(|_| WireError::InvalidValue("utf-8 string"))
  }
}

impl<T: WireEncode> WireEncode for Option<T> {
  fn encode(&self, out: &mut Vec<u8>) {
    match self {
      None => out.push(0),
      Some(value) => {
        out.push(1);
        value.encode(out);
      }
    }
  }
}

impl<T: WireDecode> WireDecode for Option<T> {
  fn decode(input: &mut &[u8]) -> Result<Self> {
    match u8::decode(input)? {
      0 => Ok(None),
      1 => Ok(Some(T::decode(input)?)),
      value => Err(WireError::InvalidDiscriminant { what: "option", value }),
    }
  }
}

// sequences of structs go through encode_list/decode_list; a blanket
// Vec<T> impl would overlap the Vec<u8> byte-string impl above
pub fn encode_list<T: WireEncode>(out: &mut Vec<u8>, items: &[T]) {
  put_varuint(out, items.len() as u64);
  for item in items {
    item.encode(out);
  }
}

pub fn decode_list<T: WireDecode>(input: &mut &[u8]) -> Result<Vec<T>> {
  let len = get_varuint(input)?;
  // each element takes at least one byte, so this bounds allocation
  if len > input.len() as u64 {
    return Err(WireError::LengthOutOfBounds(len));
  }
  let mut items = Vec::with_capacity(len as usize);
  for _ in 0..len {
    items.push(T::decode(input)?);
  }
  Ok(items)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn ints_roundtrip() {
    let mut out = Vec::new();
    42u8.encode(&mut out);
    7u16.encode(&mut out);
    1_000_000u32.encode(&mut out);
    u64::MAX.encode(&mut out);
    (-5i64).encode(&mut out);
    true.encode(&mut out);

    let mut input = out.as_slice();
    assert_eq!(u8::decode(&mut input).unwrap(), 42);
    assert_eq!(u16::decode(&mut input).unwrap(), 7);
    assert_eq!(u32::decode(&mut input).unwrap(), 1_000_000);
    assert_eq!(u64::decode(&mut input).unwrap(), u64::MAX);
    assert_eq!(i64::decode(&mut input).unwrap(), -5);
    assert!(bool::decode(&mut input).unwrap());
    assert!(input.is_empty());
  }

  #[test]
  fn varuint_is_leb128() {
    let mut out = Vec::new();
    put_varuint(&mut out, 624485);
    assert_eq!(out, vec![0xe5, 0x8e, 0x26]);

    let mut input = out.as_slice();
    assert_eq!(get_varuint(&mut input).unwrap(), 624485);
  }

  #[test]
  fn bytes_and_strings() {
    let mut out = Vec::new();
    put_bytes(&mut out, b"hello");
    "world".to_string().encode(&mut out);

    let mut input = out.as_slice();
    assert_eq!(get_bytes(&mut input).unwrap(), b"hello");
    assert_eq!(String::decode(&mut input).unwrap(), "world");
  }

  #[test]
  fn truncated_input_is_rejected() {
    let mut out = Vec::new();
    put_bytes(&mut out, &[1u8; 100]);
    out.truncate(10);

    let mut input = out.as_slice();
    assert!(matches!(
      get_bytes(&mut input),
      Err(WireError::LengthOutOfBounds(100))
    ));
  }

  #[test]
  fn trailing_bytes_are_rejected() {
    assert!(matches!(
      u8::from_wire_bytes(&[1, 2]),
      Err(WireError::TrailingBytes(1))
    ));
  }
}
