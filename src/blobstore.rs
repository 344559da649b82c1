//! Append-only content store backing the tree state.
//!
//! The on-disk layout is a flat stream of `size:u64_be ‖ payload`
//! records; a record is addressed by the byte offset of its size
//! prefix. Offsets are embedded in in-memory structures through
//! [`BufferedRef`], which delays the write until the value is first
//! flushed and afterwards serves reads from either side.

use {
  crate::serial::{WireDeserialize, WireError, WireSerialize},
  byteorder::{BigEndian, ReadBytesExt, WriteBytesExt},
  parking_lot::Mutex,
  std::{
    fs::{File, OpenOptions},
    io::{Seek, SeekFrom, Write},
    path::Path,
  },
  thiserror::Error,
};

/// Sentinel offset denoting a null reference.
pub const NULL_OFFSET: u64 = u64::MAX;

/// Upper bound on a single stored record; reads refusing anything
/// larger protect against a corrupted size prefix.
const MAX_RECORD_SIZE: u64 = 1 << 30;

#[derive(Debug, Error)]
pub enum BlobStoreError {
  #[error("i/o failure on the blob file: {0}")]
  Io(#[from] std::io::Error),

  #[error("stored record of {0} bytes exceeds the record cap")]
  OversizedRecord(u64),

  #[error("decoding a stored value failed: {0}")]
  Wire(#[from] WireError),
}

/// The append-only blob file. A single mutex serializes all file
/// access; writes always land at the end, reads seek freely.
pub struct BlobStore {
  file: Mutex<File>,
}

impl BlobStore {
  pub fn open(path: &Path) -> Result<Self, BlobStoreError> {
    let file = OpenOptions::new()
      .read(true)
      .write(true)
      .create(true)
      .open(path)?;
    Ok(Self {
      file: Mutex::new(file),
    })
  }

  /// Appends one record and returns the offset it can be read back
  /// from.
  pub fn append(&self, payload: &[u8]) -> Result<u64, BlobStoreError> {
    let mut file = self.file.lock();
    let offset = file.seek(SeekFrom::End(0))?;
    file.write_u64::<BigEndian>(payload.len() as u64)?;
    file.write_all(payload)?;
    file.flush()?;
    Ok(offset)
  }

  pub fn read_at(&self, offset: u64) -> Result<Vec<u8>, BlobStoreError> {
    let mut file = self.file.lock();
    file.seek(SeekFrom::Start(offset))?;
    let size = file.read_u64::<BigEndian>()?;
    if size > MAX_RECORD_SIZE {
      return Err(BlobStoreError::OversizedRecord(size));
    }
    let mut payload = vec![0u8; size as usize];
    std::io::Read::read_exact(&mut *file, &mut payload)?;
    Ok(payload)
  }

  pub fn store<T: WireSerialize>(
    &self,
    value: &T,
  ) -> Result<u64, BlobStoreError> {
    self.append(&value.to_bytes())
  }

  pub fn fetch<T: WireDeserialize>(
    &self,
    offset: u64,
  ) -> Result<T, BlobStoreError> {
    let payload = self.read_at(offset)?;
    Ok(T::from_bytes(&payload)?)
  }
}

/// A reference to a value that lives in memory, on disk, or both.
///
/// Fresh values start in memory with no offset. The first flush
/// writes them through and records the offset; from then on the
/// in-memory value and the disk record coexist and are both
/// read-only. A reference loaded from a persisted structure starts
/// as `OnDisk` and is materialized on demand.
pub enum BufferedRef<T> {
  OnDisk(u64),
  InMemory {
    value: T,
    cached_offset: Option<u64>,
  },
}

impl<T> BufferedRef<T> {
  pub fn in_memory(value: T) -> Self {
    Self::InMemory {
      value,
      cached_offset: None,
    }
  }

  pub fn on_disk(offset: u64) -> Self {
    Self::OnDisk(offset)
  }

  /// The disk offset, if the value has ever been flushed.
  pub fn offset(&self) -> Option<u64> {
    match self {
      Self::OnDisk(offset) => Some(*offset),
      Self::InMemory { cached_offset, .. } => *cached_offset,
    }
  }

  /// Offset as persisted inside other records; the null sentinel
  /// stands in for never-flushed values.
  pub fn stored_offset(&self) -> u64 {
    self.offset().unwrap_or(NULL_OFFSET)
  }

  pub fn value(&self) -> Option<&T> {
    match self {
      Self::OnDisk(_) => None,
      Self::InMemory { value, .. } => Some(value),
    }
  }
}

impl<T: WireSerialize> BufferedRef<T> {
  /// Writes the value through on first call; later calls are
  /// no-ops returning the cached offset.
  pub fn flush(&mut self, store: &BlobStore) -> Result<u64, BlobStoreError> {
    match self {
      Self::OnDisk(offset) => Ok(*offset),
      Self::InMemory {
        value,
        cached_offset,
      } => match cached_offset {
        Some(offset) => Ok(*offset),
        None => {
          let offset = store.store(value)?;
          *cached_offset = Some(offset);
          Ok(offset)
        }
      },
    }
  }
}

impl<T: WireDeserialize + Clone> BufferedRef<T> {
  /// Resolves the referenced value, reading from disk only when it
  /// is not buffered in memory.
  pub fn load(&self, store: &BlobStore) -> Result<T, BlobStoreError> {
    match self {
      Self::OnDisk(offset) => store.fetch(*offset),
      Self::InMemory { value, .. } => Ok(value.clone()),
    }
  }
}

impl<T: std::fmt::Debug> std::fmt::Debug for BufferedRef<T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Self::OnDisk(offset) => write!(f, "BufferedRef(disk @ {offset})"),
      Self::InMemory { cached_offset, .. } => {
        write!(f, "BufferedRef(memory, cached @ {cached_offset:?})")
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use {
    super::{BlobStore, BufferedRef, NULL_OFFSET},
    crate::crypto::HashValue,
  };

  fn store() -> (tempfile::TempDir, BlobStore) {
    let dir = tempfile::tempdir().unwrap();
    let store = BlobStore::open(&dir.path().join("blocks.dat")).unwrap();
    (dir, store)
  }

  #[test]
  fn append_then_read_back() {
    let (_dir, store) = store();
    let a = store.append(b"first").unwrap();
    let b = store.append(b"second record").unwrap();
    assert_eq!(store.read_at(a).unwrap(), b"first");
    assert_eq!(store.read_at(b).unwrap(), b"second record");
    assert!(b > a);
  }

  #[test]
  fn typed_store_fetch_roundtrip() {
    let (_dir, store) = store();
    let hash = HashValue::digest(b"value");
    let offset = store.store(&hash).unwrap();
    let restored: HashValue = store.fetch(offset).unwrap();
    assert_eq!(restored, hash);
  }

  #[test]
  fn buffered_ref_flushes_once() {
    let (_dir, store) = store();
    let mut buffered = BufferedRef::in_memory(HashValue::digest(b"x"));
    assert_eq!(buffered.stored_offset(), NULL_OFFSET);

    let first = buffered.flush(&store).unwrap();
    let second = buffered.flush(&store).unwrap();
    assert_eq!(first, second);
    assert_eq!(buffered.offset(), Some(first));

    // memory side still serves reads after the flush
    assert_eq!(buffered.value(), Some(&HashValue::digest(b"x")));
    assert_eq!(
      buffered.load(&store).unwrap(),
      HashValue::digest(b"x")
    );
  }

  #[test]
  fn on_disk_ref_reads_through() {
    let (_dir, store) = store();
    let offset = store.store(&HashValue::digest(b"y")).unwrap();
    let buffered: BufferedRef<HashValue> = BufferedRef::on_disk(offset);
    assert!(buffered.value().is_none());
    assert_eq!(buffered.load(&store).unwrap(), HashValue::digest(b"y"));
  }
}
