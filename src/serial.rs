//! Deterministic, bit-exact wire codec.
//!
//! Every object that crosses the network or the disk boundary has
//! exactly one canonical encoding: multi-byte integers are written
//! big-endian, lists carry a `u64` count prefix, and optional values
//! a one-byte tag. Hashes and signatures are computed over these
//! same bytes, so encoders must never be "close enough": a single
//! differing byte changes a block's identity.

use {
  crate::crypto::{
    BlsSignature,
    HashValue,
    Pubkey,
    Signature,
    VrfProof,
    BLS_SIGNATURE_LENGTH,
    HASH_LENGTH,
    PUBKEY_LENGTH,
    SIGNATURE_LENGTH,
    VRF_PROOF_LENGTH,
  },
  byteorder::{BigEndian, ReadBytesExt, WriteBytesExt},
  std::io::{self, Cursor, Read, Write},
  thiserror::Error,
};

/// Caps the element count a decoder will allocate for. Anything
/// larger is an attack or a corrupted stream, not a real message.
pub const MAX_LIST_LENGTH: u64 = 1 << 20;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
  #[error("unexpected end of input")]
  UnexpectedEnd,

  #[error("trailing bytes after a complete value")]
  TrailingBytes,

  #[error("malformed {0}")]
  Malformed(&'static str),

  #[error("list of length {0} exceeds the allocation cap")]
  OversizedList(u64),
}

impl From<io::Error> for WireError {
  fn from(_: io::Error) -> Self {
    WireError::UnexpectedEnd
  }
}

pub trait WireSerialize {
  fn serial<W: Write>(&self, target: &mut W) -> io::Result<()>;

  fn to_bytes(&self) -> Vec<u8> {
    let mut out = Vec::new();
    self
      .serial(&mut out)
      .expect("writing to a vec cannot fail");
    out
  }
}

pub trait WireDeserialize: Sized {
  fn deserial<R: Read>(source: &mut R) -> Result<Self, WireError>;

  /// Decodes a complete value and rejects trailing garbage, so a
  /// successful decode of network bytes is always re-encodable to
  /// the identical byte string.
  fn from_bytes(bytes: &[u8]) -> Result<Self, WireError> {
    let mut cursor = Cursor::new(bytes);
    let value = Self::deserial(&mut cursor)?;
    if cursor.position() != bytes.len() as u64 {
      return Err(WireError::TrailingBytes);
    }
    Ok(value)
  }
}

pub fn read_fixed<const N: usize, R: Read>(
  source: &mut R,
) -> Result<[u8; N], WireError> {
  let mut bytes = [0u8; N];
  source.read_exact(&mut bytes)?;
  Ok(bytes)
}

pub fn read_u64<R: Read>(source: &mut R) -> Result<u64, WireError> {
  Ok(source.read_u64::<BigEndian>()?)
}

pub fn read_u32<R: Read>(source: &mut R) -> Result<u32, WireError> {
  Ok(source.read_u32::<BigEndian>()?)
}

pub fn read_u8<R: Read>(source: &mut R) -> Result<u8, WireError> {
  Ok(ReadBytesExt::read_u8(source)?)
}

pub fn write_u64<W: Write>(target: &mut W, value: u64) -> io::Result<()> {
  target.write_u64::<BigEndian>(value)
}

pub fn write_u32<W: Write>(target: &mut W, value: u32) -> io::Result<()> {
  target.write_u32::<BigEndian>(value)
}

pub fn write_u8<W: Write>(target: &mut W, value: u8) -> io::Result<()> {
  WriteBytesExt::write_u8(target, value)
}

pub fn read_bool<R: Read>(source: &mut R) -> Result<bool, WireError> {
  match read_u8(source)? {
    0 => Ok(false),
    1 => Ok(true),
    _ => Err(WireError::Malformed("boolean tag")),
  }
}

pub fn write_bool<W: Write>(target: &mut W, value: bool) -> io::Result<()> {
  write_u8(target, u8::from(value))
}

pub fn write_list<T: WireSerialize, W: Write>(
  target: &mut W,
  items: &[T],
) -> io::Result<()> {
  write_u64(target, items.len() as u64)?;
  for item in items {
    item.serial(target)?;
  }
  Ok(())
}

pub fn read_list<T: WireDeserialize, R: Read>(
  source: &mut R,
) -> Result<Vec<T>, WireError> {
  let count = read_u64(source)?;
  if count > MAX_LIST_LENGTH {
    return Err(WireError::OversizedList(count));
  }
  // cap the pre-allocation; the reads below still bound the total
  let mut items = Vec::with_capacity(count.min(1024) as usize);
  for _ in 0..count {
    items.push(T::deserial(source)?);
  }
  Ok(items)
}

impl WireSerialize for HashValue {
  fn serial<W: Write>(&self, target: &mut W) -> io::Result<()> {
    target.write_all(self)
  }
}

impl WireDeserialize for HashValue {
  fn deserial<R: Read>(source: &mut R) -> Result<Self, WireError> {
    Ok(HashValue::from(read_fixed::<HASH_LENGTH, _>(source)?))
  }
}

impl WireSerialize for Pubkey {
  fn serial<W: Write>(&self, target: &mut W) -> io::Result<()> {
    target.write_all(self)
  }
}

impl WireDeserialize for Pubkey {
  fn deserial<R: Read>(source: &mut R) -> Result<Self, WireError> {
    Ok(Pubkey::from(read_fixed::<PUBKEY_LENGTH, _>(source)?))
  }
}

impl WireSerialize for Signature {
  fn serial<W: Write>(&self, target: &mut W) -> io::Result<()> {
    target.write_all(&self.to_bytes())
  }
}

impl WireDeserialize for Signature {
  fn deserial<R: Read>(source: &mut R) -> Result<Self, WireError> {
    let bytes = read_fixed::<SIGNATURE_LENGTH, _>(source)?;
    Signature::from_bytes(&bytes)
      .map_err(|_| WireError::Malformed("ed25519 signature"))
  }
}

impl WireSerialize for VrfProof {
  fn serial<W: Write>(&self, target: &mut W) -> io::Result<()> {
    target.write_all(&self.to_bytes())
  }
}

impl WireDeserialize for VrfProof {
  fn deserial<R: Read>(source: &mut R) -> Result<Self, WireError> {
    let bytes = read_fixed::<VRF_PROOF_LENGTH, _>(source)?;
    VrfProof::from_bytes(&bytes).map_err(|_| WireError::Malformed("VRF proof"))
  }
}

impl WireSerialize for BlsSignature {
  fn serial<W: Write>(&self, target: &mut W) -> io::Result<()> {
    target.write_all(&self.to_bytes())
  }
}

impl WireDeserialize for BlsSignature {
  fn deserial<R: Read>(source: &mut R) -> Result<Self, WireError> {
    let bytes = read_fixed::<BLS_SIGNATURE_LENGTH, _>(source)?;
    BlsSignature::from_bytes(&bytes)
      .map_err(|_| WireError::Malformed("BLS signature"))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn from_bytes_rejects_trailing_garbage() {
    let hash = HashValue::digest(b"x");
    let mut bytes = hash.to_bytes().to_vec();
    bytes.push(0);
    assert_eq!(
      HashValue::from_bytes(&bytes),
      Err(WireError::TrailingBytes)
    );
  }

  #[test]
  fn truncated_input_is_unexpected_end() {
    let bytes = [0u8; 16];
    assert_eq!(
      HashValue::from_bytes(&bytes),
      Err(WireError::UnexpectedEnd)
    );
  }

  #[test]
  fn list_roundtrip() {
    let hashes: Vec<HashValue> =
      (0u8..5).map(|i| HashValue::digest(&[i])).collect();
    let mut bytes = Vec::new();
    write_list(&mut bytes, &hashes).unwrap();

    let mut cursor = std::io::Cursor::new(bytes.as_slice());
    let restored: Vec<HashValue> = read_list(&mut cursor).unwrap();
    assert_eq!(restored, hashes);
  }

  #[test]
  fn oversized_list_is_rejected() {
    let mut bytes = Vec::new();
    write_u64(&mut bytes, MAX_LIST_LENGTH + 1).unwrap();
    let mut cursor = std::io::Cursor::new(bytes.as_slice());
    assert!(matches!(
      read_list::<HashValue, _>(&mut cursor),
      Err(WireError::OversizedList(_))
    ));
  }

  #[test]
  fn bool_tag_is_strict() {
    let mut cursor = std::io::Cursor::new([2u8].as_slice());
    assert!(matches!(
      read_bool(&mut cursor),
      Err(WireError::Malformed(_))
    ));
  }
}
