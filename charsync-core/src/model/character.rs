//! Mutable character description filled by the local collaborator
//!
//! [`CharacterData`] collects file replacements as the host reports them.
//! Once every content replacement carries a hash it can be frozen into a
//! [`CharacterSnapshot`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use super::snapshot::{AssetDescriptor, CharacterSnapshot, ObjectKind};
use crate::errors::{SyncError, SyncResult};
use crate::store::{ContentHasher, ContentStore};

/// One or more game paths served from a single local file, or redirected
/// to another game path when `is_swap` is set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileReplacement {
    pub game_paths: Vec<String>,
    pub resolved_path: String,
    #[serde(default)]
    pub hash: Option<String>,
    #[serde(default)]
    pub is_swap: bool,
}

impl FileReplacement {
    pub fn new(game_paths: Vec<String>, resolved_path: impl Into<String>) -> Self {
        Self {
            game_paths,
            resolved_path: resolved_path.into(),
            hash: None,
            is_swap: false,
        }
    }

    pub fn swap(game_paths: Vec<String>, target: impl Into<String>) -> Self {
        Self {
            is_swap: true,
            ..Self::new(game_paths, target)
        }
    }

    pub fn with_hash(mut self, hash: impl Into<String>) -> Self {
        self.hash = Some(hash.into());
        self
    }

    /// False when every game path resolves to itself
    pub fn has_replacement(&self) -> bool {
        self.game_paths
            .iter()
            .any(|path| !path.eq_ignore_ascii_case(&self.resolved_path))
    }

    fn is_same_source(&self, other: &FileReplacement) -> bool {
        self.is_swap == other.is_swap && self.resolved_path.eq_ignore_ascii_case(&other.resolved_path)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CharacterData {
    pub replacements: BTreeMap<ObjectKind, Vec<FileReplacement>>,
    pub appearance: BTreeMap<ObjectKind, String>,
    pub manipulation: String,
    pub heels_offset: f32,
    pub scaling: String,
}

impl CharacterData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a replacement for `kind`. Entries that replace nothing are
    /// dropped; entries with an already known resolved path extend that
    /// entry's game paths. Returns whether anything was kept.
    pub fn add_replacement(&mut self, kind: ObjectKind, replacement: FileReplacement) -> bool {
        if !replacement.has_replacement() {
            return false;
        }

        let list = self.replacements.entry(kind).or_default();
        match list.iter_mut().find(|r| r.is_same_source(&replacement)) {
            Some(existing) => {
                for path in replacement.game_paths {
                    if !existing.game_paths.iter().any(|p| p.eq_ignore_ascii_case(&path)) {
                        existing.game_paths.push(path);
                    }
                }
                if existing.hash.is_none() {
                    existing.hash = replacement.hash;
                }
            }
            None => list.push(replacement),
        }
        true
    }

    pub fn set_appearance(&mut self, kind: ObjectKind, data: impl Into<String>) {
        self.appearance.insert(kind, data.into());
    }

    pub fn set_manipulation(&mut self, data: impl Into<String>) {
        self.manipulation = data.into();
    }

    pub fn set_heels_offset(&mut self, offset: f32) {
        self.heels_offset = offset;
    }

    pub fn set_scaling(&mut self, data: impl Into<String>) {
        self.scaling = data.into();
    }

    /// Every content replacement has a hash
    pub fn is_ready(&self) -> bool {
        self.content_replacements().all(|r| r.hash.is_some())
    }

    fn content_replacements(&self) -> impl Iterator<Item = &FileReplacement> {
        self.replacements.values().flatten().filter(|r| !r.is_swap)
    }

    /// Hash content replacements that lack one and record each local file
    /// in `store` so uploads can find the bytes. Blocking.
    pub fn compute_hashes(
        &mut self,
        hasher: &dyn ContentHasher,
        store: &ContentStore,
    ) -> SyncResult<()> {
        for replacement in self
            .replacements
            .values_mut()
            .flatten()
            .filter(|r| !r.is_swap)
        {
            let path = Path::new(&replacement.resolved_path);
            let hash = match &replacement.hash {
                Some(hash) => hash.clone(),
                None => {
                    let hash = hasher.hash_of(path)?;
                    replacement.hash = Some(hash.clone());
                    hash
                }
            };
            if path.is_file() {
                store.register(&hash, path)?;
            }
        }
        Ok(())
    }

    pub fn to_snapshot(&self) -> SyncResult<CharacterSnapshot> {
        let mut assets = BTreeMap::new();

        for (kind, replacements) in &self.replacements {
            let mut descriptors = Vec::with_capacity(replacements.len());
            for replacement in replacements {
                let descriptor = if replacement.is_swap {
                    AssetDescriptor::swap(
                        replacement.game_paths.clone(),
                        replacement.resolved_path.clone(),
                    )
                } else {
                    let hash = replacement.hash.as_ref().ok_or_else(|| {
                        SyncError::ContentMissing(format!(
                            "no hash computed for {}",
                            replacement.resolved_path
                        ))
                    })?;
                    AssetDescriptor::content(replacement.game_paths.clone(), hash.clone())
                };
                descriptors.push(descriptor);
            }
            assets.insert(*kind, descriptors);
        }

        CharacterSnapshot::new(
            assets,
            self.appearance.clone(),
            self.manipulation.clone(),
            self.heels_offset,
            self.scaling.clone(),
        )
    }
}
