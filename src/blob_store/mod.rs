// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Content-addressable attachment storage.
//!
//! Each blob is one file named `<hex sha1>.blob`, where the SHA-1 is taken
//! over the plaintext. Identical content is stored once. New blobs are
//! written to `tmp/` and renamed into place by [`BlobWriter::install`], so a
//! reader never sees a partial file.
//!
//! # Encryption
//!
//! A store opened with a key encrypts every blob on write and decrypts on
//! read. An encrypted key-check token in `encryption.check` rejects a wrong
//! key at open time. [`BlobStore::rekey`] rewrites every blob into a staging
//! directory and swaps directories, so a failure leaves the store untouched.
//!
//! ```text
//! <path>/
//! ├── 3f78...e1.blob
//! ├── 9a0c...44.blob
//! ├── encryption.check      (encrypted stores only)
//! └── tmp/                  (writers in progress)
//! ```

mod encryption;
mod writer;

pub use encryption::BlobCipher;
pub use writer::BlobWriter;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use parking_lot::RwLock;
use sha1::{Digest, Sha1};
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::io::{self, BufReader, Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

const BLOB_EXTENSION: &str = "blob";
const TEMP_DIR: &str = "tmp";
const KEY_CHECK_FILE: &str = "encryption.check";

/// Errors from the blob store.
#[derive(Error, Debug)]
pub enum BlobStoreError {
    #[error("I/O error ({context}): {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("Blob not found: {0}")]
    NotFound(BlobKey),

    #[error("Invalid blob digest: {0:?}")]
    InvalidDigest(String),

    #[error("Digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Encryption key does not match this blob store")]
    KeyMismatch,

    #[error("Blob writer misuse: {0}")]
    WriterState(&'static str),
}

impl BlobStoreError {
    /// Whether the error is about the content of one attachment rather than
    /// the store as a whole.
    pub fn is_content_error(&self) -> bool {
        matches!(
            self,
            Self::NotFound(_) | Self::InvalidDigest(_) | Self::DigestMismatch { .. }
        )
    }
}

pub(crate) fn io_err(context: impl Into<String>) -> impl FnOnce(io::Error) -> BlobStoreError {
    let context = context.into();
    move |source| BlobStoreError::Io { context, source }
}

/// SHA-1 of a blob's plaintext.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlobKey([u8; 20]);

impl BlobKey {
    pub fn from_bytes(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    pub fn for_data(data: &[u8]) -> Self {
        Self(Sha1::digest(data).into())
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(text: &str) -> Result<Self, BlobStoreError> {
        let bytes = hex::decode(text).map_err(|_| BlobStoreError::InvalidDigest(text.to_string()))?;
        let bytes: [u8; 20] = bytes
            .try_into()
            .map_err(|_| BlobStoreError::InvalidDigest(text.to_string()))?;
        Ok(Self(bytes))
    }

    /// `"sha1-<base64>"`, the form carried in attachment metadata.
    pub fn digest_string(&self) -> String {
        format!("sha1-{}", BASE64.encode(self.0))
    }

    pub fn from_digest_string(text: &str) -> Result<Self, BlobStoreError> {
        let invalid = || BlobStoreError::InvalidDigest(text.to_string());
        let encoded = text.strip_prefix("sha1-").ok_or_else(invalid)?;
        let bytes = BASE64.decode(encoded).map_err(|_| invalid())?;
        let bytes: [u8; 20] = bytes.try_into().map_err(|_| invalid())?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for BlobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for BlobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlobKey({})", self.to_hex())
    }
}

struct Inner {
    path: PathBuf,
    cipher: RwLock<Option<BlobCipher>>,
}

/// Shared handle to a directory of blobs. Cheap to clone.
#[derive(Clone)]
pub struct BlobStore {
    inner: Arc<Inner>,
}

impl fmt::Debug for BlobStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlobStore")
            .field("path", &self.inner.path)
            .field("encrypted", &self.is_encrypted())
            .finish()
    }
}

impl BlobStore {
    /// Open (or create) an unencrypted store.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, BlobStoreError> {
        Self::open_with_key(path, None)
    }

    /// Open (or create) a store, encrypted when `key` is given.
    ///
    /// Fails with [`BlobStoreError::KeyMismatch`] if the key does not match
    /// the one the store was created with, or if a key is given for an
    /// existing unencrypted store (or omitted for an encrypted one).
    pub fn open_with_key(
        path: impl AsRef<Path>,
        key: Option<[u8; 32]>,
    ) -> Result<Self, BlobStoreError> {
        let path = path.as_ref().to_path_buf();
        recover_interrupted_rekey(&path)?;

        fs::create_dir_all(path.join(TEMP_DIR)).map_err(io_err("create blob directory"))?;
        clear_dir(&path.join(TEMP_DIR))?;

        let cipher = key.map(|k| BlobCipher::new(&k));
        let check_path = path.join(KEY_CHECK_FILE);
        match (&cipher, check_path.exists()) {
            (Some(cipher), true) => {
                let token = fs::read(&check_path).map_err(io_err("read key check"))?;
                if !cipher.verify_key_check(&token) {
                    return Err(BlobStoreError::KeyMismatch);
                }
            }
            (None, true) => return Err(BlobStoreError::KeyMismatch),
            (Some(cipher), false) => {
                if !list_keys(&path)?.is_empty() {
                    return Err(BlobStoreError::KeyMismatch);
                }
                fs::write(&check_path, cipher.key_check()?).map_err(io_err("write key check"))?;
            }
            (None, false) => {}
        }

        debug!(path = %path.display(), encrypted = cipher.is_some(), "Opened blob store");
        Ok(Self {
            inner: Arc::new(Inner {
                path,
                cipher: RwLock::new(cipher),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn is_encrypted(&self) -> bool {
        self.inner.cipher.read().is_some()
    }

    pub(crate) fn cipher(&self) -> Option<BlobCipher> {
        self.inner.cipher.read().clone()
    }

    pub(crate) fn temp_dir(&self) -> PathBuf {
        self.inner.path.join(TEMP_DIR)
    }

    /// File that holds (or would hold) `key`.
    pub fn path_for(&self, key: &BlobKey) -> PathBuf {
        blob_path(&self.inner.path, key)
    }

    /// Store `data`; a no-op returning the existing key if already present.
    pub fn store(&self, data: &[u8]) -> Result<BlobKey, BlobStoreError> {
        let key = BlobKey::for_data(data);
        if self.has(&key) {
            return Ok(key);
        }
        let mut writer = self.writer()?;
        writer.append(data)?;
        writer.install()
    }

    pub fn has(&self, key: &BlobKey) -> bool {
        self.path_for(key).is_file()
    }

    /// Start streaming a new blob.
    pub fn writer(&self) -> Result<BlobWriter, BlobStoreError> {
        BlobWriter::new(self.clone())
    }

    /// Reader over the plaintext of `key`.
    pub fn open_blob(&self, key: &BlobKey) -> Result<Box<dyn Read + Send>, BlobStoreError> {
        let path = self.path_for(key);
        let file = match fs::File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(BlobStoreError::NotFound(*key))
            }
            Err(e) => return Err(io_err("open blob")(e)),
        };
        match self.cipher() {
            None => Ok(Box::new(BufReader::new(file))),
            Some(cipher) => {
                let mut sealed = Vec::new();
                BufReader::new(file)
                    .read_to_end(&mut sealed)
                    .map_err(io_err("read blob"))?;
                Ok(Box::new(Cursor::new(cipher.decrypt(&sealed)?)))
            }
        }
    }

    /// Whole plaintext of `key`.
    pub fn read(&self, key: &BlobKey) -> Result<Vec<u8>, BlobStoreError> {
        let mut data = Vec::new();
        self.open_blob(key)?
            .read_to_end(&mut data)
            .map_err(io_err("read blob"))?;
        Ok(data)
    }

    pub fn count(&self) -> Result<usize, BlobStoreError> {
        Ok(list_keys(&self.inner.path)?.len())
    }

    pub fn all_keys(&self) -> Result<Vec<BlobKey>, BlobStoreError> {
        let mut keys = list_keys(&self.inner.path)?;
        keys.sort();
        Ok(keys)
    }

    /// Total plaintext bytes stored.
    pub fn total_data_size(&self) -> Result<u64, BlobStoreError> {
        let overhead = if self.is_encrypted() {
            encryption::OVERHEAD as u64
        } else {
            0
        };
        list_keys(&self.inner.path)?
            .iter()
            .map(|key| {
                fs::metadata(self.path_for(key))
                    .map(|m| m.len().saturating_sub(overhead))
                    .map_err(io_err("stat blob"))
            })
            .sum()
    }

    /// Delete every blob not in `keep`. Returns how many were deleted.
    pub fn delete_blobs_except(&self, keep: &HashSet<BlobKey>) -> Result<usize, BlobStoreError> {
        let mut deleted = 0;
        for key in list_keys(&self.inner.path)? {
            if keep.contains(&key) {
                continue;
            }
            match fs::remove_file(self.path_for(&key)) {
                Ok(()) => deleted += 1,
                Err(e) => warn!(key = %key, error = %e, "Failed to delete unreferenced blob"),
            }
        }
        info!(deleted, kept = keep.len(), "Blob garbage collection complete");
        Ok(deleted)
    }

    /// Re-encrypt every blob under `new_key` (`None` decrypts the store).
    ///
    /// Writers must not be active. On failure nothing changes.
    pub fn rekey(&self, new_key: Option<[u8; 32]>) -> Result<(), BlobStoreError> {
        let mut cipher_slot = self.inner.cipher.write();
        let old_cipher = cipher_slot.clone();
        let new_cipher = new_key.map(|k| BlobCipher::new(&k));

        let root = &self.inner.path;
        let staging = sibling(root, "rekey");
        let retired = sibling(root, "old");

        let staged = stage_rekey(root, &staging, old_cipher.as_ref(), new_cipher.as_ref());
        if let Err(e) = staged {
            let _ = fs::remove_dir_all(&staging);
            warn!(error = %e, "Blob store rekey failed; store unchanged");
            return Err(e);
        }

        fs::rename(root, &retired).map_err(io_err("retire old blob directory"))?;
        if let Err(e) = fs::rename(&staging, root) {
            let _ = fs::rename(&retired, root);
            return Err(io_err("install rekeyed blob directory")(e));
        }
        if let Err(e) = fs::remove_dir_all(&retired) {
            warn!(error = %e, "Failed to remove retired blob directory");
        }

        *cipher_slot = new_cipher;
        info!(encrypted = cipher_slot.is_some(), "Blob store rekeyed");
        Ok(())
    }
}

fn blob_path(root: &Path, key: &BlobKey) -> PathBuf {
    root.join(format!("{}.{}", key.to_hex(), BLOB_EXTENSION))
}

/// `<dir>.<suffix>` next to `root`.
fn sibling(root: &Path, suffix: &str) -> PathBuf {
    let mut name = root.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".");
    name.push(suffix);
    root.with_file_name(name)
}

fn list_keys(root: &Path) -> Result<Vec<BlobKey>, BlobStoreError> {
    let mut keys = Vec::new();
    for entry in fs::read_dir(root).map_err(io_err("list blobs"))? {
        let entry = entry.map_err(io_err("list blobs"))?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(stem) = name.strip_suffix(".blob") else { continue };
        if let Ok(key) = BlobKey::from_hex(stem) {
            keys.push(key);
        }
    }
    Ok(keys)
}

fn clear_dir(dir: &Path) -> Result<(), BlobStoreError> {
    for entry in fs::read_dir(dir).map_err(io_err("clear temp directory"))? {
        let entry = entry.map_err(io_err("clear temp directory"))?;
        let _ = fs::remove_file(entry.path());
    }
    Ok(())
}

fn stage_rekey(
    root: &Path,
    staging: &Path,
    old: Option<&BlobCipher>,
    new: Option<&BlobCipher>,
) -> Result<(), BlobStoreError> {
    if staging.exists() {
        fs::remove_dir_all(staging).map_err(io_err("remove stale staging"))?;
    }
    fs::create_dir_all(staging.join(TEMP_DIR)).map_err(io_err("create staging"))?;

    for key in list_keys(root)? {
        let stored = fs::read(blob_path(root, &key)).map_err(io_err("read blob"))?;
        let plain = match old {
            Some(cipher) => cipher.decrypt(&stored)?,
            None => stored,
        };
        let restored = match new {
            Some(cipher) => cipher.encrypt(&plain)?,
            None => plain,
        };
        fs::write(blob_path(staging, &key), restored).map_err(io_err("write staged blob"))?;
    }

    if let Some(cipher) = new {
        fs::write(staging.join(KEY_CHECK_FILE), cipher.key_check()?)
            .map_err(io_err("write key check"))?;
    }
    Ok(())
}

/// Finish or roll back a rekey that was interrupted by a crash.
fn recover_interrupted_rekey(root: &Path) -> Result<(), BlobStoreError> {
    let staging = sibling(root, "rekey");
    let retired = sibling(root, "old");

    if !root.exists() && retired.exists() {
        if staging.exists() {
            fs::rename(&staging, root).map_err(io_err("complete interrupted rekey"))?;
        } else {
            fs::rename(&retired, root).map_err(io_err("roll back interrupted rekey"))?;
        }
    }
    if staging.exists() {
        fs::remove_dir_all(&staging).map_err(io_err("remove stale staging"))?;
    }
    if retired.exists() && root.exists() {
        fs::remove_dir_all(&retired).map_err(io_err("remove retired blobs"))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn temp_store() -> (TempDir, BlobStore) {
        let dir = TempDir::new().unwrap();
        let store = BlobStore::open(dir.path().join("blobs")).unwrap();
        (dir, store)
    }

    #[test]
    fn test_store_and_read_back() {
        let (_dir, store) = temp_store();
        let key = store.store(b"hello attachment").unwrap();
        assert_eq!(key, BlobKey::for_data(b"hello attachment"));
        assert!(store.has(&key));
        assert_eq!(store.read(&key).unwrap(), b"hello attachment");
    }

    #[test]
    fn test_dedup() {
        let (_dir, store) = temp_store();
        let a = store.store(b"same").unwrap();
        let b = store.store(b"same").unwrap();
        assert_eq!(a, b);
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn test_missing_blob() {
        let (_dir, store) = temp_store();
        let key = BlobKey::for_data(b"never stored");
        assert!(!store.has(&key));
        assert!(matches!(store.read(&key), Err(BlobStoreError::NotFound(k)) if k == key));
    }

    #[test]
    fn test_digest_string_round_trip() {
        let key = BlobKey::for_data(b"abc");
        let digest = key.digest_string();
        assert_eq!(digest, "sha1-qZk+NkcGgWq6PiVxeFDCbJzQ2J0=");
        assert_eq!(BlobKey::from_digest_string(&digest).unwrap(), key);
        assert_eq!(key.to_hex(), "a9993e364706816aba3e25717850c26c9cd0d89d");
        assert!(BlobKey::from_digest_string("md5-xxxx").is_err());
        assert!(BlobKey::from_digest_string("sha1-AAAA").is_err());
    }

    #[test]
    fn test_inventory() {
        let (_dir, store) = temp_store();
        let a = store.store(b"12345").unwrap();
        let b = store.store(b"123").unwrap();
        assert_eq!(store.count().unwrap(), 2);
        assert_eq!(store.total_data_size().unwrap(), 8);
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(store.all_keys().unwrap(), expected);
    }

    #[test]
    fn test_delete_blobs_except() {
        let (_dir, store) = temp_store();
        let keep = store.store(b"keep").unwrap();
        let drop = store.store(b"drop").unwrap();
        let deleted = store
            .delete_blobs_except(&HashSet::from([keep]))
            .unwrap();
        assert_eq!(deleted, 1);
        assert!(store.has(&keep));
        assert!(!store.has(&drop));
    }

    #[test]
    fn test_encrypted_store() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("blobs");
        let key = [9u8; 32];
        let store = BlobStore::open_with_key(&path, Some(key)).unwrap();
        let blob = store.store(b"secret data").unwrap();

        let raw = fs::read(store.path_for(&blob)).unwrap();
        assert_ne!(raw, b"secret data");
        assert_eq!(store.read(&blob).unwrap(), b"secret data");
        assert_eq!(store.total_data_size().unwrap(), 11);
        assert_eq!(blob, BlobKey::for_data(b"secret data"));

        drop(store);
        assert!(matches!(
            BlobStore::open_with_key(&path, Some([8u8; 32])),
            Err(BlobStoreError::KeyMismatch)
        ));
        assert!(matches!(BlobStore::open(&path), Err(BlobStoreError::KeyMismatch)));
        let reopened = BlobStore::open_with_key(&path, Some(key)).unwrap();
        assert_eq!(reopened.read(&blob).unwrap(), b"secret data");
    }

    #[test]
    fn test_key_for_existing_plain_store_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("blobs");
        BlobStore::open(&path).unwrap().store(b"plain").unwrap();
        assert!(matches!(
            BlobStore::open_with_key(&path, Some([1u8; 32])),
            Err(BlobStoreError::KeyMismatch)
        ));
    }

    #[test]
    fn test_rekey_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("blobs");
        let store = BlobStore::open(&path).unwrap();
        let a = store.store(b"first").unwrap();
        let b = store.store(b"second").unwrap();

        store.rekey(Some([5u8; 32])).unwrap();
        assert!(store.is_encrypted());
        assert_eq!(store.read(&a).unwrap(), b"first");
        assert_ne!(fs::read(store.path_for(&b)).unwrap(), b"second");

        store.rekey(None).unwrap();
        assert!(!store.is_encrypted());
        assert_eq!(fs::read(store.path_for(&b)).unwrap(), b"second");
        assert!(!sibling(&path, "old").exists());
        assert!(!sibling(&path, "rekey").exists());
    }

    #[test]
    fn test_rekey_failure_leaves_store_untouched() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("blobs");
        let store = BlobStore::open_with_key(&path, Some([5u8; 32])).unwrap();
        let good = store.store(b"good").unwrap();
        // Corrupt one blob so it cannot be decrypted.
        let bad = BlobKey::for_data(b"bad");
        fs::write(store.path_for(&bad), b"not a valid ciphertext at all....").unwrap();

        assert!(store.rekey(Some([6u8; 32])).is_err());
        assert!(store.is_encrypted());
        assert_eq!(store.read(&good).unwrap(), b"good");
        assert!(!sibling(&path, "rekey").exists());
    }

    #[test]
    fn test_recovers_interrupted_rekey() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("blobs");
        let key = {
            let store = BlobStore::open(&path).unwrap();
            store.store(b"survivor").unwrap()
        };
        // Crash after retiring the old directory but before installing staging.
        fs::rename(&path, sibling(&path, "old")).unwrap();

        let store = BlobStore::open(&path).unwrap();
        assert_eq!(store.read(&key).unwrap(), b"survivor");
    }
}
