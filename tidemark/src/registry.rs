//! Source registry.
//!
//! The registry maps each source identifier to the [`ScalarKind`] it was
//! declared with. A source's kind never changes once declared: redeclaring
//! with the same kind is a no-op and redeclaring with another kind fails with
//! [`SourceError::TypeConflict`].
//!
//! The registry does not lock anything itself. The database keeps it behind
//! the same lock as the typed stores so a declaration and the opening of its
//! map happen as one step.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SourceError, StorageError};
use crate::kind::ScalarKind;

/// Metadata key under which the registry is persisted.
pub(crate) const CATALOG_KEY: &str = "tidemark.sources";

/// A declared source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceDescriptor {
    /// Unique, non-empty identifier.
    pub id: String,
    /// Declared value kind.
    pub kind: ScalarKind,
    /// Optional free-form description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl SourceDescriptor {
    /// Creates a descriptor without a description.
    pub fn new(id: impl Into<String>, kind: ScalarKind) -> Self {
        Self {
            id: id.into(),
            kind,
            description: None,
        }
    }

    /// Attaches a description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// The set of declared sources.
#[derive(Debug, Clone, Default)]
pub struct SourceRegistry {
    sources: BTreeMap<String, SourceDescriptor>,
}

impl SourceRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a source.
    ///
    /// For a new source, `open` runs before the source is recorded; if it
    /// fails the registry is left unchanged. Returns `true` if the source was
    /// new and `false` if it was already declared with the same kind.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::EmptyId`] for a blank id,
    /// [`SourceError::TypeConflict`] if the id exists with another kind, and
    /// any error returned by `open`.
    pub fn declare<F>(&mut self, descriptor: SourceDescriptor, open: F) -> Result<bool>
    where
        F: FnOnce(&SourceDescriptor) -> Result<()>,
    {
        if descriptor.id.trim().is_empty() {
            return Err(SourceError::EmptyId.into());
        }

        if let Some(existing) = self.sources.get(&descriptor.id) {
            if existing.kind != descriptor.kind {
                return Err(SourceError::TypeConflict {
                    id: descriptor.id,
                    existing: existing.kind,
                    requested: descriptor.kind,
                }
                .into());
            }
            return Ok(false);
        }

        open(&descriptor)?;
        self.sources.insert(descriptor.id.clone(), descriptor);
        Ok(true)
    }

    /// Returns the declared kind of `id`.
    pub fn resolve(&self, id: &str) -> Option<ScalarKind> {
        self.sources.get(id).map(|d| d.kind)
    }

    /// Returns the full descriptor of `id`.
    pub fn describe(&self, id: &str) -> Option<&SourceDescriptor> {
        self.sources.get(id)
    }

    /// Returns every declared source, ordered by id.
    pub fn list(&self) -> impl Iterator<Item = &SourceDescriptor> {
        self.sources.values()
    }

    /// Returns the number of declared sources.
    pub fn len(&self) -> usize {
        self.sources.len()
    }

    /// Returns `true` if no source has been declared.
    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    pub(crate) fn to_bytes(&self) -> Result<Vec<u8>> {
        let descriptors: Vec<&SourceDescriptor> = self.sources.values().collect();
        serde_json::to_vec(&descriptors).map_err(|e| {
            StorageError::Corrupted {
                path: CATALOG_KEY.to_string(),
                reason: e.to_string(),
            }
            .into()
        })
    }

    pub(crate) fn descriptors_from_bytes(bytes: &[u8]) -> Result<Vec<SourceDescriptor>> {
        serde_json::from_slice(bytes).map_err(|e| {
            StorageError::Corrupted {
                path: CATALOG_KEY.to_string(),
                reason: e.to_string(),
            }
            .into()
        })
    }
}
