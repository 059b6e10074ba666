/// Lowercase hex rendering for digests, ids and raw key material.
///
/// Consensus objects are displayed as hex rather than base58 because
/// block ids carry their block number in the leading bytes and hex
/// keeps that prefix readable in logs.
pub trait ToHexString {
  fn to_hex(&self) -> String;
}

impl<T: AsRef<[u8]>> ToHexString for T {
  fn to_hex(&self) -> String {
    let bytes = self.as_ref();
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
      out.push(char::from_digit((b >> 4) as u32, 16).unwrap());
      out.push(char::from_digit((b & 0x0f) as u32, 16).unwrap());
    }
    out
  }
}

/// Parses a hex string into a fixed-size byte array.
pub(crate) fn from_hex<const N: usize>(s: &str) -> Option<[u8; N]> {
  if s.len() != N * 2 {
    return None;
  }
  let mut out = [0u8; N];
  for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
    let hi = (chunk[0] as char).to_digit(16)?;
    let lo = (chunk[1] as char).to_digit(16)?;
    out[i] = ((hi << 4) | lo) as u8;
  }
  Some(out)
}

#[cfg(test)]
mod tests {
  use super::{from_hex, ToHexString};

  #[test]
  fn roundtrip() {
    let bytes = [0xde, 0xad, 0xbe, 0xef];
    assert_eq!(bytes.to_hex(), "deadbeef");
    assert_eq!(from_hex::<4>("deadbeef"), Some(bytes));
    assert_eq!(from_hex::<4>("deadbee"), None);
    assert_eq!(from_hex::<4>("deadbeze"), None);
  }
}
