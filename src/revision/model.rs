// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Revisions and attachment metadata.

use super::{RevisionError, RevisionId};
use crate::blob_store::{BlobKey, BlobStoreError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Attachment metadata carried by a revision.
///
/// The bytes live in the [`BlobStore`](crate::blob_store::BlobStore) under the
/// key named by `digest`. `data` is only populated while a revision is in
/// transit with its attachment inline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentMeta {
    pub name: String,
    /// `"sha1-<base64>"` of the plaintext.
    pub digest: String,
    pub length: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    /// Generation of the revision that last changed this attachment.
    #[serde(default)]
    pub revpos: u32,
    /// Bytes are not included; look them up by digest.
    #[serde(default)]
    pub stub: bool,
    #[serde(skip)]
    pub data: Option<Vec<u8>>,
}

impl AttachmentMeta {
    /// Metadata for bytes already stored under `key`.
    pub fn for_blob(
        name: impl Into<String>,
        key: &BlobKey,
        length: u64,
        content_type: Option<String>,
        revpos: u32,
    ) -> Self {
        Self {
            name: name.into(),
            digest: key.digest_string(),
            length,
            content_type,
            revpos,
            stub: true,
            data: None,
        }
    }

    /// Metadata carrying its bytes inline.
    pub fn inline(
        name: impl Into<String>,
        data: Vec<u8>,
        content_type: Option<String>,
        revpos: u32,
    ) -> Self {
        let key = BlobKey::for_data(&data);
        Self {
            name: name.into(),
            digest: key.digest_string(),
            length: data.len() as u64,
            content_type,
            revpos,
            stub: false,
            data: Some(data),
        }
    }

    /// Blob key named by the digest.
    pub fn blob_key(&self) -> Result<BlobKey, BlobStoreError> {
        BlobKey::from_digest_string(&self.digest)
    }

    /// Drop inline bytes and mark as a stub.
    pub fn into_stub(mut self) -> Self {
        self.data = None;
        self.stub = true;
        self
    }
}

/// One revision of a document.
///
/// Immutable once created, apart from the sequence which the local store
/// assigns exactly once on insertion. A sequence of `0` means unassigned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Revision {
    pub doc_id: String,
    pub rev_id: RevisionId,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<AttachmentMeta>,
    #[serde(default)]
    sequence: i64,
}

impl Revision {
    pub fn new(
        doc_id: impl Into<String>,
        rev_id: RevisionId,
        body: Map<String, Value>,
    ) -> Self {
        Self {
            doc_id: doc_id.into(),
            rev_id,
            deleted: false,
            body: Some(body),
            attachments: Vec::new(),
            sequence: 0,
        }
    }

    /// Deletion marker.
    pub fn tombstone(doc_id: impl Into<String>, rev_id: RevisionId) -> Self {
        Self {
            doc_id: doc_id.into(),
            rev_id,
            deleted: true,
            body: None,
            attachments: Vec::new(),
            sequence: 0,
        }
    }

    /// Rebuild a revision held in storage, with the sequence it was given
    /// when it was inserted.
    pub(crate) fn stored(
        doc_id: impl Into<String>,
        rev_id: RevisionId,
        deleted: bool,
        body: Option<Map<String, Value>>,
        attachments: Vec<AttachmentMeta>,
        sequence: i64,
    ) -> Self {
        Self {
            doc_id: doc_id.into(),
            rev_id,
            deleted,
            body,
            attachments,
            sequence,
        }
    }

    pub fn with_attachments(mut self, attachments: Vec<AttachmentMeta>) -> Self {
        self.attachments = attachments;
        self
    }

    pub fn generation(&self) -> u32 {
        self.rev_id.generation()
    }

    pub fn sequence(&self) -> i64 {
        self.sequence
    }

    /// Assign the local sequence. Re-assigning the same value is a no-op.
    pub fn assign_sequence(&mut self, sequence: i64) -> Result<(), RevisionError> {
        if self.sequence != 0 && self.sequence != sequence {
            return Err(RevisionError::SequenceAlreadyAssigned {
                rev_id: self.rev_id.to_string(),
                existing: self.sequence,
            });
        }
        self.sequence = sequence;
        Ok(())
    }

    /// Copy for another database, which assigns its own sequence.
    pub fn without_sequence(mut self) -> Self {
        self.sequence = 0;
        self
    }

    /// Top-level body property.
    pub fn property(&self, key: &str) -> Option<&Value> {
        self.body.as_ref().and_then(|b| b.get(key))
    }
}
