use {
  super::hex::{from_hex, ToHexString},
  ed25519_dalek::{PublicKey, SecretKey, Signature, Signer, Verifier},
  serde::{de, Deserialize, Deserializer, Serialize, Serializer},
  std::{
    fmt::{Debug, Display, Formatter},
    str::FromStr,
  },
  thiserror::Error,
};

#[derive(Debug, Error)]
pub enum KeyError {
  #[error("invalid ed25519 public key")]
  InvalidPubkey,

  #[error("signature verification failed")]
  BadSignature,

  #[error("invalid BLS key material")]
  InvalidBlsKey,

  #[error("invalid BLS signature")]
  InvalidBlsSignature,

  #[error("cannot aggregate an empty signature set")]
  EmptyAggregate,
}

/// Domain separation tag for finalizer signatures, fixed for the
/// lifetime of the chain.
const BLS_DST: &[u8] = b"BLS_SIG_BLS12381G2_XMD:SHA-256_SSWU_RO_POP_";

/// An ed25519 public key identifying a block producer or a
/// transaction signer.
#[derive(
  Clone,
  Copy,
  PartialEq,
  Eq,
  Hash,
  PartialOrd,
  Ord,
  Serialize,
  Deserialize,
)]
pub struct Pubkey(pub [u8; 32]);

impl Pubkey {
  pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
    match PublicKey::from_bytes(&self.0) {
      Ok(key) => key.verify(message, signature).is_ok(),
      Err(_) => false,
    }
  }
}

impl AsRef<[u8]> for Pubkey {
  fn as_ref(&self) -> &[u8] {
    &self.0
  }
}

impl Display for Pubkey {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0.to_hex())
  }
}

impl Debug for Pubkey {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    write!(f, "Pubkey({})", self.0.to_hex())
  }
}

impl FromStr for Pubkey {
  type Err = KeyError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    from_hex::<32>(s).map(Pubkey).ok_or(KeyError::InvalidPubkey)
  }
}

/// Signing keypair of a block producer.
pub struct Keypair(ed25519_dalek::Keypair);

impl Keypair {
  /// Generates a fresh random keypair.
  pub fn unique() -> Self {
    let seed: [u8; 32] = rand::random();
    Self::from_seed(seed)
  }

  /// Derives a keypair from a fixed seed. Deterministic, used by
  /// tests and by tooling that provisions well-known accounts.
  pub fn from_seed(seed: [u8; 32]) -> Self {
    let secret =
      SecretKey::from_bytes(&seed).expect("32 bytes is a valid secret key");
    let public: PublicKey = (&secret).into();
    Keypair(ed25519_dalek::Keypair { secret, public })
  }

  pub fn public(&self) -> Pubkey {
    Pubkey(self.0.public.to_bytes())
  }

  pub fn sign(&self, message: &[u8]) -> Signature {
    self.0.sign(message)
  }
}

impl Clone for Keypair {
  fn clone(&self) -> Self {
    Self::from_seed(self.0.secret.to_bytes())
  }
}

impl Debug for Keypair {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    write!(f, "Keypair({})", self.public())
  }
}

/// A BLS12-381 public key of a finalizer, stored in its 48-byte
/// compressed form and parsed lazily on verification.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlsPublicKey(pub [u8; 48]);

impl BlsPublicKey {
  fn parse(&self) -> Result<blst::min_pk::PublicKey, KeyError> {
    blst::min_pk::PublicKey::from_bytes(&self.0)
      .map_err(|_| KeyError::InvalidBlsKey)
  }
}

impl Display for BlsPublicKey {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0.to_hex())
  }
}

impl Debug for BlsPublicKey {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    write!(f, "BlsPublicKey({})", self.0.to_hex())
  }
}

impl FromStr for BlsPublicKey {
  type Err = KeyError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    from_hex::<48>(s)
      .map(BlsPublicKey)
      .ok_or(KeyError::InvalidBlsKey)
  }
}

impl Serialize for BlsPublicKey {
  fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&self.0.to_hex())
  }
}

impl<'de> Deserialize<'de> for BlsPublicKey {
  fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
    let text = String::deserialize(d)?;
    text.parse().map_err(de::Error::custom)
  }
}

/// A BLS signature (or aggregate of signatures) in its 96-byte
/// compressed form.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct BlsSignature(pub [u8; 96]);

impl BlsSignature {
  fn parse(&self) -> Result<blst::min_pk::Signature, KeyError> {
    blst::min_pk::Signature::from_bytes(&self.0)
      .map_err(|_| KeyError::InvalidBlsSignature)
  }

  /// Verifies this signature against a single finalizer key.
  pub fn verify(&self, key: &BlsPublicKey, message: &[u8]) -> bool {
    let (Ok(sig), Ok(pk)) = (self.parse(), key.parse()) else {
      return false;
    };
    sig.verify(true, message, BLS_DST, &[], &pk, true)
      == blst::BLST_ERROR::BLST_SUCCESS
  }
}

impl Display for BlsSignature {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0.to_hex())
  }
}

impl Debug for BlsSignature {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    write!(f, "BlsSignature({})", self.0.to_hex())
  }
}

impl FromStr for BlsSignature {
  type Err = KeyError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    from_hex::<96>(s)
      .map(BlsSignature)
      .ok_or(KeyError::InvalidBlsSignature)
  }
}

impl Serialize for BlsSignature {
  fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&self.0.to_hex())
  }
}

impl<'de> Deserialize<'de> for BlsSignature {
  fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
    let text = String::deserialize(d)?;
    text.parse().map_err(de::Error::custom)
  }
}

/// Signing keypair of a finalizer.
pub struct BlsKeypair {
  secret: blst::min_pk::SecretKey,
}

impl BlsKeypair {
  /// Derives a keypair from 32 bytes of seed material.
  pub fn from_seed(seed: [u8; 32]) -> Self {
    let secret = blst::min_pk::SecretKey::key_gen(&seed, &[])
      .expect("32 bytes of ikm is sufficient for key_gen");
    BlsKeypair { secret }
  }

  pub fn unique() -> Self {
    Self::from_seed(rand::random())
  }

  pub fn public(&self) -> BlsPublicKey {
    BlsPublicKey(self.secret.sk_to_pk().to_bytes())
  }

  pub fn sign(&self, message: &[u8]) -> BlsSignature {
    BlsSignature(self.secret.sign(message, BLS_DST, &[]).to_bytes())
  }
}

impl Debug for BlsKeypair {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    write!(f, "BlsKeypair({})", self.public())
  }
}

/// Aggregates finalizer signatures over the same message into one.
pub fn aggregate_signatures(
  signatures: &[BlsSignature],
) -> Result<BlsSignature, KeyError> {
  let parsed = signatures
    .iter()
    .map(|s| s.parse())
    .collect::<Result<Vec<_>, _>>()?;
  let refs: Vec<_> = parsed.iter().collect();
  if refs.is_empty() {
    return Err(KeyError::EmptyAggregate);
  }
  let aggregate = blst::min_pk::AggregateSignature::aggregate(&refs, true)
    .map_err(|_| KeyError::InvalidBlsSignature)?;
  Ok(BlsSignature(aggregate.to_signature().to_bytes()))
}

/// Verifies an aggregate signature where signers may have signed
/// different messages (e.g. the strong and weak variants of a vote
/// digest). Pairs are (key, message) in aggregation order.
pub fn aggregate_verify_multi(
  pairs: &[(BlsPublicKey, Vec<u8>)],
  signature: &BlsSignature,
) -> bool {
  let Ok(sig) = signature.parse() else {
    return false;
  };
  let parsed = match pairs
    .iter()
    .map(|(k, _)| k.parse())
    .collect::<Result<Vec<_>, _>>()
  {
    Ok(keys) if !keys.is_empty() => keys,
    _ => return false,
  };
  let key_refs: Vec<_> = parsed.iter().collect();
  let messages: Vec<&[u8]> = pairs.iter().map(|(_, m)| m.as_slice()).collect();
  sig.aggregate_verify(true, &messages, BLS_DST, &key_refs, true)
    == blst::BLST_ERROR::BLST_SUCCESS
}

/// Verifies an aggregate signature where every signer signed the
/// same message.
pub fn aggregate_verify(
  keys: &[BlsPublicKey],
  message: &[u8],
  signature: &BlsSignature,
) -> bool {
  let Ok(sig) = signature.parse() else {
    return false;
  };
  let parsed = match keys.iter().map(|k| k.parse()).collect::<Result<Vec<_>, _>>()
  {
    Ok(keys) if !keys.is_empty() => keys,
    _ => return false,
  };
  let refs: Vec<_> = parsed.iter().collect();
  sig.fast_aggregate_verify(true, message, BLS_DST, &refs)
    == blst::BLST_ERROR::BLST_SUCCESS
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn ed25519_sign_verify() {
    let pair = Keypair::from_seed([7u8; 32]);
    let sig = pair.sign(b"block header digest");
    assert!(pair.public().verify(b"block header digest", &sig));
    assert!(!pair.public().verify(b"\xD0\xB4\xD1\x80\xD1\x83\xD0\xB3\xD0\xBE\xD0\xB9\x20digest", &sig));
    assert!(!Keypair::from_seed([8u8; 32])
      .public()
      .verify(b"block header digest", &sig));
  }

  #[test]
  fn keypair_clone_preserves_identity() {
    let pair = Keypair::unique();
    assert_eq!(pair.public(), pair.clone().public());
  }

  #[test]
  fn bls_sign_verify() {
    let pair = BlsKeypair::from_seed([3u8; 32]);
    let sig = pair.sign(b"finalizer digest");
    assert!(sig.verify(&pair.public(), b"finalizer digest"));
    assert!(!sig.verify(&pair.public(), b"something else"));
  }

  #[test]
  fn bls_aggregation() {
    let pairs: Vec<_> = (0u8..4).map(|i| BlsKeypair::from_seed([i; 32])).collect();
    let message = b"quorum digest";

    let sigs: Vec<_> = pairs.iter().map(|p| p.sign(message)).collect();
    let keys: Vec<_> = pairs.iter().map(|p| p.public()).collect();

    let aggregate = aggregate_signatures(&sigs).unwrap();
    assert!(aggregate_verify(&keys, message, &aggregate));

    // dropping one signer must break verification
    assert!(!aggregate_verify(&keys[1..], message, &aggregate));
    assert!(aggregate_signatures(&[]).is_err());
  }

  #[test]
  fn bls_key_hex_roundtrip() {
    let key = BlsKeypair::from_seed([9u8; 32]).public();
    let parsed: BlsPublicKey = key.to_string().parse().unwrap();
    assert_eq!(parsed, key);
  }
}
