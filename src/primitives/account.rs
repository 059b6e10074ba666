use {
  super::wire::{WireDecode, WireEncode, WireError},
  serde::{Deserialize, Serialize},
  std::{
    fmt::{Debug, Display, Formatter},
    str::FromStr,
  },
  thiserror::Error,
};

#[derive(Debug, Error)]
#[error("invalid account name `{0}`")]
pub struct InvalidAccountName(String);

/// The on-chain name of an account.
///
/// Names are short lowercase identifiers, at most 13 characters from
/// `a-z`, `1-5` and `.`, and participate in consensus byte-for-byte,
/// so their validity is checked at every decode boundary.
#[derive(
  Clone,
  PartialEq,
  Eq,
  Hash,
  PartialOrd,
  Ord,
  Default,
  Serialize,
  Deserialize,
)]
pub struct AccountName(String);

impl AccountName {
  pub fn new(name: &str) -> Result<Self, InvalidAccountName> {
    let valid = !name.is_empty()
      && name.len() <= 13
      && name
        .bytes()
        .all(|b| b.is_ascii_lowercase() || (b'1'..=b'5').contains(&b) || b == b'.');
    if !valid {
      return Err(InvalidAccountName(name.to_string()));
    }
    Ok(AccountName(name.to_string()))
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl Display for AccountName {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

impl Debug for AccountName {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    write!(f, "AccountName({})", self.0)
  }
}

impl FromStr for AccountName {
  type Err = InvalidAccountName;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    AccountName::new(s)
  }
}

impl AsRef<[u8]> for AccountName {
  fn as_ref(&self) -> &[u8] {
    self.0.as_bytes()
  }
}

impl WireEncode for AccountName {
  fn encode(&self, out: &mut Vec<u8>) {
    self.0.encode(out);
  }
}

impl WireDecode for AccountName {
  fn decode(input: &mut &[u8]) -> Result<Self, WireError> {
    let raw = String::decode(input)?;
    AccountName::new(&raw).map_err(|_| WireError::InvalidValue("account name"))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn accepts_valid_names() {
    for name in ["alice", "prod.a", "voter12345", "a.b.c"] {
      assert!(AccountName::new(name).is_ok(), "{name}");
    }
  }

  #[test]
  fn rejects_invalid_names() {
    for name in ["", "Alice", "way.too.long.name", "has space", "six6"] {
      assert!(AccountName::new(name).is_err(), "{name}");
    }
  }
}
