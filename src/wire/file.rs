//! Binary file backend for keys and ciphertext batches
//!
//! All integers are little-endian.
//!
//! Ciphertext batch (`enc_test_data/<chunk>.enc`):
//! - magic `FHEB`, format version u16
//! - circuit version u32, key id u64, count u32
//! - `count` times: length u32, bytes
//!
//! Key record (`keys/*.ekl`, `keys/*.fhk`):
//! - magic `FHEK` (evaluation) or `FHES` (private), format version u16
//! - circuit version u32, key id u64, length u32, bytes

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Cursor, Read, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use memmap2::Mmap;

use crate::error::{Error, Result};
use crate::keys::KeyId;

use super::Ciphertext;

const BATCH_MAGIC: &[u8; 4] = b"FHEB";
const FORMAT_VERSION: u16 = 1;

/// Kind of key stored in a key record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    Evaluation,
    Private,
}

impl KeyKind {
    fn magic(self) -> &'static [u8; 4] {
        match self {
            KeyKind::Evaluation => b"FHEK",
            KeyKind::Private => b"FHES",
        }
    }
}

/// Key material read back from disk
pub struct KeyRecord {
    pub circuit_version: u32,
    pub key_id: KeyId,
    pub bytes: Vec<u8>,
}

fn check_header(cursor: &mut Cursor<&[u8]>, magic: &[u8; 4], what: &str) -> Result<()> {
    let mut found = [0u8; 4];
    cursor.read_exact(&mut found)?;
    if &found != magic {
        return Err(Error::Serialization(format!("not a {} file (bad magic)", what)));
    }
    let format = cursor.read_u16::<LittleEndian>()?;
    if format != FORMAT_VERSION {
        return Err(Error::Serialization(format!(
            "unsupported {} format version {}",
            what, format
        )));
    }
    Ok(())
}

/// Length prefix of a blob or batch; the format stores it as u32
fn length_prefix(len: usize, what: &str) -> Result<u32> {
    u32::try_from(len).map_err(|_| {
        Error::Serialization(format!("{} of {} entries exceeds the u32 length prefix", what, len))
    })
}

fn read_blob(cursor: &mut Cursor<&[u8]>) -> Result<Vec<u8>> {
    let len = cursor.read_u32::<LittleEndian>()? as usize;
    let remaining = cursor.get_ref().len() - cursor.position() as usize;
    if len > remaining {
        return Err(Error::Serialization(format!(
            "truncated blob: {} bytes announced, {} available",
            len, remaining
        )));
    }
    let mut blob = vec![0u8; len];
    cursor.read_exact(&mut blob)?;
    Ok(blob)
}

/// Serialize a batch of ciphertexts sharing one key pair and circuit version
pub fn encode_batch(ciphertexts: &[Ciphertext]) -> Result<Vec<u8>> {
    let (circuit_version, key_id) = match ciphertexts.first() {
        Some(first) => (first.circuit_version, first.key_id),
        None => (0, KeyId(0)),
    };

    let mut out = Vec::new();
    out.write_all(BATCH_MAGIC)?;
    out.write_u16::<LittleEndian>(FORMAT_VERSION)?;
    out.write_u32::<LittleEndian>(circuit_version)?;
    out.write_u64::<LittleEndian>(key_id.0)?;
    out.write_u32::<LittleEndian>(length_prefix(ciphertexts.len(), "batch")?)?;

    for ct in ciphertexts {
        if ct.circuit_version != circuit_version {
            return Err(Error::VersionMismatch {
                expected: circuit_version,
                actual: ct.circuit_version,
            });
        }
        if ct.key_id != key_id {
            return Err(Error::KeyMismatch {
                expected: key_id,
                actual: ct.key_id,
            });
        }
        out.write_u32::<LittleEndian>(length_prefix(ct.bytes.len(), "ciphertext")?)?;
        out.write_all(&ct.bytes)?;
    }

    Ok(out)
}

/// Parse a batch produced by [`encode_batch`]
pub fn decode_batch(data: &[u8]) -> Result<Vec<Ciphertext>> {
    let mut cursor = Cursor::new(data);
    check_header(&mut cursor, BATCH_MAGIC, "ciphertext batch")?;

    let circuit_version = cursor.read_u32::<LittleEndian>()?;
    let key_id = KeyId(cursor.read_u64::<LittleEndian>()?);
    let count = cursor.read_u32::<LittleEndian>()? as usize;

    let mut ciphertexts = Vec::with_capacity(count.min(4096));
    for _ in 0..count {
        ciphertexts.push(Ciphertext {
            circuit_version,
            key_id,
            bytes: read_blob(&mut cursor)?,
        });
    }
    Ok(ciphertexts)
}

/// Write a ciphertext batch file, creating parent directories
pub fn save_batch(path: &Path, ciphertexts: &[Ciphertext]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let encoded = encode_batch(ciphertexts)?;
    let mut writer = BufWriter::new(File::create(path)?);
    writer.write_all(&encoded)?;
    writer.flush()?;
    Ok(())
}

/// Read a ciphertext batch file
pub fn load_batch(path: &Path) -> Result<Vec<Ciphertext>> {
    let file = File::open(path)?;
    // SAFETY: File is opened read-only and not modified while mapped.
    // The mapping does not outlive this function.
    let mmap = unsafe { Mmap::map(&file)? };
    decode_batch(&mmap[..])
}

#[cfg(unix)]
fn restrict_permissions(options: &mut OpenOptions, file: Option<&File>, kind: KeyKind) -> Result<()> {
    use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
    if kind != KeyKind::Private {
        return Ok(());
    }
    match file {
        // Mode only applies on creation; an existing file keeps its own.
        Some(file) => file.set_permissions(fs::Permissions::from_mode(0o600))?,
        None => {
            options.mode(0o600);
        }
    }
    Ok(())
}

#[cfg(not(unix))]
fn restrict_permissions(_options: &mut OpenOptions, _file: Option<&File>, _kind: KeyKind) -> Result<()> {
    Ok(())
}

/// Path a key record is staged at before it replaces `path`
pub fn staging_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Write a key record to its staging path and return that path.
/// The record only becomes visible once the caller renames it over `path`.
pub fn stage_key_record(
    path: &Path,
    kind: KeyKind,
    circuit_version: u32,
    key_id: KeyId,
    bytes: &[u8],
) -> Result<PathBuf> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let staged = staging_path(path);
    let len = length_prefix(bytes.len(), "key record")?;

    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    restrict_permissions(&mut options, None, kind)?;
    let file = options.open(&staged)?;
    restrict_permissions(&mut options, Some(&file), kind)?;

    let mut writer = BufWriter::new(file);
    writer.write_all(kind.magic())?;
    writer.write_u16::<LittleEndian>(FORMAT_VERSION)?;
    writer.write_u32::<LittleEndian>(circuit_version)?;
    writer.write_u64::<LittleEndian>(key_id.0)?;
    writer.write_u32::<LittleEndian>(len)?;
    writer.write_all(bytes)?;
    writer.flush()?;
    writer.get_ref().sync_all()?;
    Ok(staged)
}

/// Write a key record, replacing any previous one in a single rename.
/// Private records are owner-only.
pub fn save_key_record(
    path: &Path,
    kind: KeyKind,
    circuit_version: u32,
    key_id: KeyId,
    bytes: &[u8],
) -> Result<()> {
    let staged = stage_key_record(path, kind, circuit_version, key_id, bytes)?;
    fs::rename(&staged, path)?;
    Ok(())
}

/// Read a key record of the given kind
pub fn load_key_record(path: &Path, kind: KeyKind) -> Result<KeyRecord> {
    let data = fs::read(path)?;
    let mut cursor = Cursor::new(&data[..]);
    let what = match kind {
        KeyKind::Evaluation => "evaluation key",
        KeyKind::Private => "private key",
    };
    check_header(&mut cursor, kind.magic(), what)?;

    let circuit_version = cursor.read_u32::<LittleEndian>()?;
    let key_id = KeyId(cursor.read_u64::<LittleEndian>()?);
    let bytes = read_blob(&mut cursor)?;

    Ok(KeyRecord {
        circuit_version,
        key_id,
        bytes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn ct(bytes: &[u8]) -> Ciphertext {
        Ciphertext {
            circuit_version: 2,
            key_id: KeyId(0xabc),
            bytes: bytes.to_vec(),
        }
    }

    #[test]
    fn test_batch_file_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("enc_test_data").join("0-10.enc");
        let batch = vec![ct(b"first"), ct(b""), ct(&[7u8; 300])];

        save_batch(&path, &batch).unwrap();
        let loaded = load_batch(&path).unwrap();

        assert_eq!(loaded, batch);
    }

    #[test]
    fn test_batch_rejects_mixed_keys() {
        let mut other = ct(b"x");
        other.key_id = KeyId(1);
        assert!(matches!(
            encode_batch(&[ct(b"a"), other]),
            Err(Error::KeyMismatch { .. })
        ));
    }

    #[test]
    fn test_truncated_batch_is_error() {
        let mut encoded = encode_batch(&[ct(b"payload")]).unwrap();
        encoded.truncate(encoded.len() - 3);
        assert!(decode_batch(&encoded).is_err());
    }

    #[test]
    fn test_key_record_kind_checked() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("keys").join("serialized_evaluation_keys.ekl");
        save_key_record(&path, KeyKind::Evaluation, 4, KeyId(5), b"ek").unwrap();

        let record = load_key_record(&path, KeyKind::Evaluation).unwrap();
        assert_eq!(record.circuit_version, 4);
        assert_eq!(record.key_id, KeyId(5));
        assert_eq!(record.bytes, b"ek");

        assert!(load_key_record(&path, KeyKind::Private).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_private_record_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let path = dir.path().join("private_key.fhk");
        save_key_record(&path, KeyKind::Private, 1, KeyId(1), b"secret").unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[cfg(unix)]
    #[test]
    fn test_private_record_tightens_existing_file() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let path = dir.path().join("private_key.fhk");
        // Leftovers from an earlier run, both world-readable
        for stale in [path.clone(), staging_path(&path)] {
            fs::write(&stale, b"old").unwrap();
            fs::set_permissions(&stale, fs::Permissions::from_mode(0o644)).unwrap();
        }

        save_key_record(&path, KeyKind::Private, 1, KeyId(2), b"rotated").unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert!(!staging_path(&path).exists());
        assert_eq!(load_key_record(&path, KeyKind::Private).unwrap().key_id, KeyId(2));
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn test_length_prefix_rejects_oversized() {
        assert_eq!(length_prefix(7, "batch").unwrap(), 7);
        assert_eq!(length_prefix(u32::MAX as usize, "batch").unwrap(), u32::MAX);
        assert!(matches!(
            length_prefix(u32::MAX as usize + 1, "ciphertext"),
            Err(Error::Serialization(_))
        ));
    }
}
