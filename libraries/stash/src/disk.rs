//! A [`KeyValueStore`] that keeps one file per key inside a directory.
//!
//! Every file starts with a small header (magic bytes + format version) so that stray or
//! half-written files are recognised instead of being handed to the JSON decoder.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::{KeyValueStore, StashError};

pub const STASH_MAGIC: &[u8] = b"STASHKV1";
pub const STASH_FORMAT_VERSION: u32 = 1;
pub const STASH_HEADER_LEN: usize = STASH_MAGIC.len() + 4;
const FILE_EXTENSION: &str = "stash";

#[derive(Debug, Clone)]
pub struct DirectoryStore {
    root: PathBuf,
}

impl DirectoryStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StashError> {
        let root = root.into();
        fs::create_dir_all(&root)
            .inspect_err(|e| log::error!("Failed to create stash directory {root:?}: {e:?}"))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, key: &str) -> PathBuf {
        self.root
            .join(format!("{}.{FILE_EXTENSION}", encode_key(key)))
    }
}

impl KeyValueStore for DirectoryStore {
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>, StashError> {
        let bytes = match fs::read(self.path_for(key)) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let payload = decode_file(&bytes).map_err(|reason| StashError::Corrupt {
            key: key.to_string(),
            reason,
        })?;
        Ok(Some(payload.to_vec()))
    }

    fn write(&self, key: &str, value: &[u8]) -> Result<(), StashError> {
        if key.is_empty() {
            return Err(StashError::InvalidKey(key.to_string()));
        }

        let path = self.path_for(key);
        let temp_path = path.with_extension(format!("{FILE_EXTENSION}.tmp"));

        // write-then-rename so a crash mid-write never leaves a truncated entry behind
        fs::write(&temp_path, encode_file(value))?;
        fs::rename(&temp_path, &path)?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StashError> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn keys(&self) -> Result<Vec<String>, StashError> {
        let mut keys = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                log::warn!("Skipping non UTF-8 file name in stash directory: {file_name:?}");
                continue;
            };
            let Some(encoded) = file_name.strip_suffix(&format!(".{FILE_EXTENSION}")) else {
                continue;
            };
            match decode_key(encoded) {
                Some(key) => keys.push(key),
                None => log::warn!("Skipping undecodable stash file name `{file_name}`"),
            }
        }
        keys.sort();
        Ok(keys)
    }
}

pub fn encode_file(payload: &[u8]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(STASH_HEADER_LEN + payload.len());
    bytes.extend_from_slice(STASH_MAGIC);
    bytes.extend_from_slice(&STASH_FORMAT_VERSION.to_le_bytes());
    bytes.extend_from_slice(payload);
    bytes
}

/// Strip and validate the header, returning the payload.
pub fn decode_file(bytes: &[u8]) -> Result<&[u8], String> {
    if bytes.len() < STASH_HEADER_LEN {
        return Err(format!("header too small ({} bytes)", bytes.len()));
    }

    if !bytes.starts_with(STASH_MAGIC) {
        return Err("magic bytes did not match".to_string());
    }

    let version_offset = STASH_MAGIC.len();
    let mut version = [0u8; 4];
    version.copy_from_slice(&bytes[version_offset..version_offset + 4]);
    let version = u32::from_le_bytes(version);
    if version != STASH_FORMAT_VERSION {
        return Err(format!("unsupported format version {version}"));
    }

    Ok(&bytes[STASH_HEADER_LEN..])
}

/// Keys may contain characters that are not valid in file names (owner ids, `:` separators),
/// so everything outside `[A-Za-z0-9_-]` is percent-encoded.
fn encode_key(key: &str) -> String {
    let mut encoded = String::with_capacity(key.len());
    for byte in key.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            encoded.push(byte as char);
        } else {
            encoded.push_str(&format!("%{byte:02X}"));
        }
    }
    encoded
}

fn decode_key(encoded: &str) -> Option<String> {
    let bytes = encoded.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = encoded.get(i + 1..i + 3)?;
            decoded.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            decoded.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(decoded).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_encoding_round_trip() {
        for key in ["stash:roster:abc-123", "plain", "ünïcode/owner id"] {
            let encoded = encode_key(key);
            assert!(
                encoded
                    .bytes()
                    .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_' || b == b'%')
            );
            assert_eq!(decode_key(&encoded).as_deref(), Some(key));
        }
    }

    #[test]
    fn test_directory_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirectoryStore::open(dir.path().join("cache")).unwrap();

        store.write("stash:roster:owner-1", b"{\"a\":1}").unwrap();
        assert_eq!(
            store.read("stash:roster:owner-1").unwrap(),
            Some(b"{\"a\":1}".to_vec())
        );
        assert_eq!(store.keys().unwrap(), vec!["stash:roster:owner-1".to_string()]);

        store.delete("stash:roster:owner-1").unwrap();
        store.delete("stash:roster:owner-1").unwrap();
        assert_eq!(store.read("stash:roster:owner-1").unwrap(), None);
        assert!(store.keys().unwrap().is_empty());
    }

    #[test]
    fn test_foreign_file_is_reported_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirectoryStore::open(dir.path()).unwrap();

        fs::write(store.path_for("stash:roster:x"), b"not a stash file").unwrap();
        assert!(matches!(
            store.read("stash:roster:x"),
            Err(StashError::Corrupt { .. })
        ));
    }

    #[test]
    fn test_unknown_format_version_is_rejected() {
        let mut bytes = encode_file(b"[]");
        bytes[STASH_MAGIC.len()] = 9;
        assert!(decode_file(&bytes).unwrap_err().contains("format version"));
        assert_eq!(decode_file(&encode_file(b"[]")).unwrap(), b"[]");
    }
}
