//! Block-import files.
//!
//! An import file is a flat sequence of `version:varint ‖
//! size:u64_be ‖ block` records. Replaying one feeds every block
//! through the normal receive path, so an imported chain is
//! validated exactly like a live one.

use {
  crate::skov::{SkovState, Tick, UpdateResult},
  byteorder::{BigEndian, ReadBytesExt, WriteBytesExt},
  std::{
    fs::File,
    io::{self, ErrorKind, Read, Write},
    path::Path,
  },
  thiserror::Error,
  tracing::{info, warn},
};

pub const IMPORT_FORMAT_VERSION: u64 = 1;

/// Records larger than this are a corrupted file, not a block.
const MAX_IMPORT_BLOCK_SIZE: u64 = 1 << 30;

#[derive(Debug, Error)]
pub enum ImportError {
  #[error("i/o failure reading the import file: {0}")]
  Io(#[from] io::Error),

  #[error("unsupported import format version {0}")]
  UnsupportedVersion(u64),

  #[error("import record of {0} bytes exceeds the record cap")]
  OversizedRecord(u64),

  #[error("imported block was rejected: {0:?}")]
  Rejected(UpdateResult),
}

/// Writes one block record.
pub fn write_import_record<W: Write>(
  target: &mut W,
  block_bytes: &[u8],
) -> io::Result<()> {
  let mut varint = unsigned_varint::encode::u64_buffer();
  target
    .write_all(unsigned_varint::encode::u64(IMPORT_FORMAT_VERSION, &mut varint))?;
  target.write_u64::<BigEndian>(block_bytes.len() as u64)?;
  target.write_all(block_bytes)
}

/// Reads a varint byte-by-byte; `Ok(None)` is a clean EOF before
/// the first byte.
fn read_varint<R: Read>(source: &mut R) -> Result<Option<u64>, ImportError> {
  let mut buffer = [0u8; 10];
  for i in 0..buffer.len() {
    let mut byte = [0u8; 1];
    match source.read_exact(&mut byte) {
      Ok(()) => buffer[i] = byte[0],
      Err(e) if e.kind() == ErrorKind::UnexpectedEof && i == 0 => {
        return Ok(None);
      }
      Err(e) => return Err(e.into()),
    }
    if byte[0] & 0x80 == 0 {
      let (value, _) = unsigned_varint::decode::u64(&buffer[..=i])
        .map_err(|_| {
          ImportError::Io(io::Error::new(
            ErrorKind::InvalidData,
            "malformed varint",
          ))
        })?;
      return Ok(Some(value));
    }
  }
  Err(ImportError::Io(io::Error::new(
    ErrorKind::InvalidData,
    "varint too long",
  )))
}

/// Reads the next serialized block, or None at EOF.
pub fn read_import_record<R: Read>(
  source: &mut R,
) -> Result<Option<Vec<u8>>, ImportError> {
  let Some(version) = read_varint(source)? else {
    return Ok(None);
  };
  if version != IMPORT_FORMAT_VERSION {
    return Err(ImportError::UnsupportedVersion(version));
  }
  let size = source.read_u64::<BigEndian>()?;
  if size > MAX_IMPORT_BLOCK_SIZE {
    return Err(ImportError::OversizedRecord(size));
  }
  let mut bytes = vec![0u8; size as usize];
  source.read_exact(&mut bytes)?;
  Ok(Some(bytes))
}

/// Replays every block in `source` through the receive path,
/// stopping at the first fatal rejection.
pub fn import_blocks<R: Read>(
  state: &mut SkovState,
  source: &mut R,
) -> Result<usize, ImportError> {
  let mut imported = 0usize;
  while let Some(bytes) = read_import_record(source)? {
    match state.receive_block(&bytes, Tick::now()) {
      UpdateResult::Success
      | UpdateResult::Duplicate
      | UpdateResult::Stale
      | UpdateResult::PendingBlock => {
        imported += 1;
      }
      fatal => {
        warn!("aborting import on a block rejected with {fatal:?}");
        return Err(ImportError::Rejected(fatal));
      }
    }
  }
  info!("imported {imported} blocks");
  Ok(imported)
}

/// Replays a block-import file; a missing or unreadable file maps
/// to `MissingImportFile`.
pub fn import_block_file(state: &mut SkovState, path: &Path) -> UpdateResult {
  let mut file = match File::open(path) {
    Ok(file) => file,
    Err(e) => {
      warn!("cannot open import file {}: {e}", path.display());
      return UpdateResult::MissingImportFile;
    }
  };
  match import_blocks(state, &mut file) {
    Ok(_) => UpdateResult::Success,
    Err(ImportError::Rejected(result)) => result,
    Err(e) => {
      warn!("import failed: {e}");
      UpdateResult::MissingImportFile
    }
  }
}

#[cfg(test)]
mod tests {
  use {
    super::{read_import_record, write_import_record},
    std::io::Cursor,
  };

  #[test]
  fn records_roundtrip_until_eof() {
    let mut file = Vec::new();
    write_import_record(&mut file, b"first block").unwrap();
    write_import_record(&mut file, b"second block").unwrap();

    let mut cursor = Cursor::new(file.as_slice());
    assert_eq!(
      read_import_record(&mut cursor).unwrap().unwrap(),
      b"first block"
    );
    assert_eq!(
      read_import_record(&mut cursor).unwrap().unwrap(),
      b"second block"
    );
    assert!(read_import_record(&mut cursor).unwrap().is_none());
  }

  #[test]
  fn truncated_record_is_an_error() {
    let mut file = Vec::new();
    write_import_record(&mut file, b"block").unwrap();
    file.truncate(file.len() - 2);

    let mut cursor = Cursor::new(file.as_slice());
    assert!(read_import_record(&mut cursor).is_err());
  }

  #[test]
  fn unknown_version_is_rejected() {
    let mut file = Vec::new();
    // version 9 does not exist
    file.push(9);
    file.extend_from_slice(&5u64.to_be_bytes());
    file.extend_from_slice(b"block");

    let mut cursor = Cursor::new(file.as_slice());
    assert!(matches!(
      read_import_record(&mut cursor),
      Err(super::ImportError::UnsupportedVersion(9))
    ));
  }
}
