// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Revision identifiers.
//!
//! A revision ID is a generation number plus a digest. Two textual forms
//! are accepted:
//!
//! | Form | Text | Produced by |
//! |------|------|-------------|
//! | Tree | `"3-a1b2c3"` | local writes and tree-style peers |
//! | Version | `"3@peer-7"` | version-vector style peers (digest is the source ID) |
//!
//! Both forms share one total order: generation first, then the digest
//! compared byte-wise. Equal generation and digest across forms is broken by
//! form (tree sorts first) so the order stays consistent with `Eq`.

use super::RevisionError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha1::{Digest, Sha1};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Textual form of a [`RevisionId`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RevIdForm {
    /// `"<generation>-<digest>"`
    Tree,
    /// `"<generation>@<source>"`
    Version,
}

impl RevIdForm {
    fn separator(self) -> char {
        match self {
            Self::Tree => '-',
            Self::Version => '@',
        }
    }
}

/// Immutable revision identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RevisionId {
    generation: u32,
    digest: String,
    form: RevIdForm,
}

impl RevisionId {
    /// Build a tree-form ID.
    pub fn new(generation: u32, digest: impl Into<String>) -> Result<Self, RevisionError> {
        Self::with_form(generation, digest.into(), RevIdForm::Tree)
    }

    /// Build a version-form ID.
    pub fn version(generation: u32, source: impl Into<String>) -> Result<Self, RevisionError> {
        Self::with_form(generation, source.into(), RevIdForm::Version)
    }

    fn with_form(generation: u32, digest: String, form: RevIdForm) -> Result<Self, RevisionError> {
        if generation == 0 || !valid_digest(&digest) {
            return Err(RevisionError::MalformedRevId(format!(
                "{}{}{}",
                generation,
                form.separator(),
                digest
            )));
        }
        Ok(Self {
            generation,
            digest,
            form,
        })
    }

    /// Parse either textual form.
    pub fn parse(text: &str) -> Result<Self, RevisionError> {
        let malformed = || RevisionError::MalformedRevId(text.to_string());

        let split = text.find(['-', '@']).ok_or_else(malformed)?;
        let (gen_text, rest) = text.split_at(split);
        let form = if rest.starts_with('-') {
            RevIdForm::Tree
        } else {
            RevIdForm::Version
        };

        if gen_text.is_empty()
            || !gen_text.bytes().all(|b| b.is_ascii_digit())
            || (gen_text.len() > 1 && gen_text.starts_with('0'))
        {
            return Err(malformed());
        }
        let generation: u32 = gen_text.parse().map_err(|_| malformed())?;

        Self::with_form(generation, rest[1..].to_string(), form).map_err(|_| malformed())
    }

    /// Generate the tree-form ID of a new local revision.
    ///
    /// Deterministic: the same parent, deletion flag and body always give the
    /// same ID, so two replicas making the same edit agree on it.
    pub fn for_content(
        body: Option<&Map<String, Value>>,
        deleted: bool,
        parent: Option<&RevisionId>,
    ) -> Self {
        let mut hasher = Sha1::new();
        match parent {
            Some(parent) => {
                let text = parent.to_string();
                hasher.update([text.len().min(u8::MAX as usize) as u8]);
                hasher.update(text.as_bytes());
            }
            None => hasher.update([0u8]),
        }
        hasher.update([u8::from(deleted)]);
        if let Some(body) = body {
            hasher.update(serde_json::to_vec(body).unwrap_or_default());
        }

        Self {
            generation: parent.map_or(1, |p| p.generation.saturating_add(1)),
            digest: hex::encode(hasher.finalize()),
            form: RevIdForm::Tree,
        }
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn form(&self) -> RevIdForm {
        self.form
    }
}

/// Digests are non-empty and free of whitespace and control characters.
fn valid_digest(digest: &str) -> bool {
    !digest.is_empty() && digest.chars().all(|c| !c.is_whitespace() && !c.is_control())
}

impl Ord for RevisionId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.generation
            .cmp(&other.generation)
            .then_with(|| self.digest.as_bytes().cmp(other.digest.as_bytes()))
            .then_with(|| self.form.cmp(&other.form))
    }
}

impl PartialOrd for RevisionId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for RevisionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.generation, self.form.separator(), self.digest)
    }
}

impl FromStr for RevisionId {
    type Err = RevisionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for RevisionId {
    type Error = RevisionError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<RevisionId> for String {
    fn from(rev: RevisionId) -> Self {
        rev.to_string()
    }
}

/// Check that a newest-first ancestor list descends one generation at a time.
///
/// `start` is the generation of the revision the list belongs to; the first
/// entry must be `start - 1`.
pub fn validate_ancestry(start: u32, ancestors: &[RevisionId]) -> Result<(), RevisionError> {
    let mut expected = start;
    for ancestor in ancestors {
        if ancestor.generation.checked_add(1) != Some(expected) {
            return Err(RevisionError::InvalidHistory {
                rev_id: ancestor.to_string(),
                reason: format!("expected generation {}", expected.saturating_sub(1)),
            });
        }
        expected = ancestor.generation;
    }
    Ok(())
}

/// Compact `_revisions` encoding of a contiguous tree-form history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionHistory {
    /// Generation of the newest entry.
    pub start: u32,
    /// Digests, newest first.
    pub ids: Vec<String>,
}

impl RevisionHistory {
    /// Encode a newest-first list of tree-form IDs.
    pub fn from_rev_ids(revs: &[RevisionId]) -> Result<Self, RevisionError> {
        let Some(first) = revs.first() else {
            return Err(RevisionError::InvalidHistory {
                rev_id: String::new(),
                reason: "empty history".to_string(),
            });
        };
        validate_ancestry(first.generation, &revs[1..])?;
        if let Some(rev) = revs.iter().find(|r| r.form != RevIdForm::Tree) {
            return Err(RevisionError::InvalidHistory {
                rev_id: rev.to_string(),
                reason: "only tree-form IDs can be encoded".to_string(),
            });
        }
        Ok(Self {
            start: first.generation,
            ids: revs.iter().map(|r| r.digest.clone()).collect(),
        })
    }

    /// Decode back into newest-first IDs.
    pub fn to_rev_ids(&self) -> Result<Vec<RevisionId>, RevisionError> {
        if self.ids.len() as u64 > u64::from(self.start) {
            return Err(RevisionError::InvalidHistory {
                rev_id: format!("{}-{}", self.start, self.ids.first().map_or("", |s| s)),
                reason: format!("{} ids but start is {}", self.ids.len(), self.start),
            });
        }
        self.ids
            .iter()
            .enumerate()
            .map(|(i, digest)| RevisionId::new(self.start - i as u32, digest.clone()))
            .collect()
    }
}
