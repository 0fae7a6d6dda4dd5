// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Streaming blob writer.

use super::{io_err, BlobKey, BlobStore, BlobStoreError};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use sha1::{Digest, Sha1};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use tracing::debug;

enum Sink {
    /// Plaintext streamed straight to the temp file.
    File(BufWriter<File>),
    /// Buffered until `finish`, then sealed in one piece.
    Sealed(Vec<u8>),
    Closed,
}

/// Writes one blob incrementally, then publishes it under its key.
///
/// `append` any number of times, `finish` to compute the key, then
/// `install` to make it visible. Dropping an uninstalled writer deletes its
/// temp file.
pub struct BlobWriter {
    store: BlobStore,
    hasher: Sha1,
    length: u64,
    temp_path: PathBuf,
    sink: Sink,
    key: Option<BlobKey>,
    done: bool,
}

impl BlobWriter {
    pub(super) fn new(store: BlobStore) -> Result<Self, BlobStoreError> {
        let temp_path = store
            .temp_dir()
            .join(format!("{}.blobtmp", uuid::Uuid::new_v4().simple()));
        let sink = if store.is_encrypted() {
            Sink::Sealed(Vec::new())
        } else {
            let file = File::create(&temp_path).map_err(io_err("create temp blob"))?;
            Sink::File(BufWriter::new(file))
        };
        Ok(Self {
            store,
            hasher: Sha1::new(),
            length: 0,
            temp_path,
            sink,
            key: None,
            done: false,
        })
    }

    pub fn append(&mut self, data: &[u8]) -> Result<(), BlobStoreError> {
        if self.key.is_some() {
            return Err(BlobStoreError::WriterState("append after finish"));
        }
        self.hasher.update(data);
        self.length += data.len() as u64;
        match &mut self.sink {
            Sink::File(file) => file.write_all(data).map_err(io_err("write temp blob")),
            Sink::Sealed(buffer) => {
                buffer.extend_from_slice(data);
                Ok(())
            }
            Sink::Closed => Err(BlobStoreError::WriterState("writer closed")),
        }
    }

    /// Close the temp file and compute the key. Idempotent.
    pub fn finish(&mut self) -> Result<BlobKey, BlobStoreError> {
        if let Some(key) = self.key {
            return Ok(key);
        }
        match std::mem::replace(&mut self.sink, Sink::Closed) {
            Sink::File(mut file) => {
                file.flush().map_err(io_err("flush temp blob"))?;
                file.get_ref().sync_all().map_err(io_err("sync temp blob"))?;
            }
            Sink::Sealed(buffer) => {
                let cipher = self
                    .store
                    .cipher()
                    .ok_or(BlobStoreError::WriterState("store encryption changed"))?;
                fs::write(&self.temp_path, cipher.encrypt(&buffer)?)
                    .map_err(io_err("write temp blob"))?;
            }
            Sink::Closed => return Err(BlobStoreError::WriterState("writer closed")),
        }
        let key = BlobKey::from_bytes(self.hasher.clone().finalize().into());
        self.key = Some(key);
        Ok(key)
    }

    /// Plaintext bytes appended so far.
    pub fn length(&self) -> u64 {
        self.length
    }

    /// Key, once finished.
    pub fn key(&self) -> Option<BlobKey> {
        self.key
    }

    /// `"sha1-<base64>"` of the content, once finished.
    pub fn sha1_digest_string(&self) -> Option<String> {
        self.key.map(|k| k.digest_string())
    }

    /// Whether the finished content matches `expected`.
    ///
    /// Accepts `"sha1-<base64>"` or bare hex. Other algorithms cannot be
    /// checked and are rejected, as is an unfinished writer.
    pub fn verify_digest(&self, expected: &str) -> bool {
        let Some(key) = self.key else {
            return false;
        };
        let parsed = BlobKey::from_digest_string(expected).or_else(|_| BlobKey::from_hex(expected));
        match parsed {
            Ok(expected) => expected == key,
            Err(_) => {
                debug!(expected, actual = %BASE64.encode(key.as_bytes()), "Unverifiable digest");
                false
            }
        }
    }

    /// Publish the blob under its key. A no-op if the key already exists.
    pub fn install(mut self) -> Result<BlobKey, BlobStoreError> {
        let key = self.finish()?;
        let dest = self.store.path_for(&key);
        if dest.exists() {
            let _ = fs::remove_file(&self.temp_path);
        } else {
            fs::rename(&self.temp_path, &dest).map_err(io_err("install blob"))?;
        }
        self.done = true;
        Ok(key)
    }

    /// Discard everything written.
    pub fn cancel(mut self) {
        self.sink = Sink::Closed;
        let _ = fs::remove_file(&self.temp_path);
        self.done = true;
    }
}

impl Drop for BlobWriter {
    fn drop(&mut self) {
        if !self.done {
            self.sink = Sink::Closed;
            let _ = fs::remove_file(&self.temp_path);
        }
    }
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

    fn temp_files(store: &BlobStore) -> usize {
        fs::read_dir(store.temp_dir()).unwrap().count()
    }

    #[test]
    fn test_streamed_write() {
        let (_dir, store) = temp_store();
        let mut writer = store.writer().unwrap();
        writer.append(b"hello ").unwrap();
        writer.append(b"world").unwrap();
        assert_eq!(writer.length(), 11);
        assert!(writer.key().is_none());

        let key = writer.finish().unwrap();
        assert_eq!(writer.finish().unwrap(), key);
        assert_eq!(key, BlobKey::for_data(b"hello world"));
        assert!(!store.has(&key));

        assert_eq!(writer.install().unwrap(), key);
        assert_eq!(store.read(&key).unwrap(), b"hello world");
        assert_eq!(temp_files(&store), 0);
    }

    #[test]
    fn test_append_after_finish_rejected() {
        let (_dir, store) = temp_store();
        let mut writer = store.writer().unwrap();
        writer.finish().unwrap();
        assert!(matches!(writer.append(b"late"), Err(BlobStoreError::WriterState(_))));
    }

    #[test]
    fn test_verify_digest() {
        let (_dir, store) = temp_store();
        let mut writer = store.writer().unwrap();
        writer.append(b"abc").unwrap();
        assert!(!writer.verify_digest("sha1-qZk+NkcGgWq6PiVxeFDCbJzQ2J0="));
        writer.finish().unwrap();

        assert!(writer.verify_digest("sha1-qZk+NkcGgWq6PiVxeFDCbJzQ2J0="));
        assert!(writer.verify_digest("a9993e364706816aba3e25717850c26c9cd0d89d"));
        assert!(!writer.verify_digest(&BlobKey::for_data(b"abd").digest_string()));
        assert!(!writer.verify_digest("md5-kAFQmDzST7DWlj99KOF/cg=="));
        assert_eq!(
            writer.sha1_digest_string().as_deref(),
            Some("sha1-qZk+NkcGgWq6PiVxeFDCbJzQ2J0=")
        );
    }

    #[test]
    fn test_install_existing_is_noop() {
        let (_dir, store) = temp_store();
        let key = store.store(b"dup").unwrap();
        let mut writer = store.writer().unwrap();
        writer.append(b"dup").unwrap();
        assert_eq!(writer.install().unwrap(), key);
        assert_eq!(store.count().unwrap(), 1);
        assert_eq!(temp_files(&store), 0);
    }

    #[test]
    fn test_cancel_and_drop_clean_up() {
        let (_dir, store) = temp_store();
        let mut writer = store.writer().unwrap();
        writer.append(b"discard me").unwrap();
        assert_eq!(temp_files(&store), 1);
        writer.cancel();
        assert_eq!(temp_files(&store), 0);

        let mut writer = store.writer().unwrap();
        writer.append(b"abandoned").unwrap();
        drop(writer);
        assert_eq!(temp_files(&store), 0);
        assert_eq!(store.count().unwrap(), 0);
    }

    #[test]
    fn test_encrypted_writer() {
        let dir = TempDir::new().unwrap();
        let store = BlobStore::open_with_key(dir.path().join("blobs"), Some([2u8; 32])).unwrap();
        let mut writer = store.writer().unwrap();
        writer.append(b"sealed ").unwrap();
        writer.append(b"content").unwrap();
        let key = writer.install().unwrap();
        assert_eq!(key, BlobKey::for_data(b"sealed content"));
        assert_eq!(store.read(&key).unwrap(), b"sealed content");
    }
}
