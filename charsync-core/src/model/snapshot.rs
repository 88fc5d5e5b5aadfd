//! Character snapshots and the asset descriptors they reference

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::errors::SyncResult;

/// Which drawable a set of assets belongs to
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum ObjectKind {
    Player,
    MinionOrMount,
    Pet,
    Companion,
}

/// One replaced asset: either uploadable content addressed by hash, or a
/// swap that redirects the game paths to another in-game path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetDescriptor {
    /// In-world paths served by this asset, unique ignoring case
    pub game_paths: Vec<String>,
    /// Empty for swaps
    pub content_hash: String,
    pub swap_target: Option<String>,
}

impl AssetDescriptor {
    pub fn content(game_paths: Vec<String>, content_hash: impl Into<String>) -> Self {
        let mut descriptor = Self {
            game_paths: Vec::with_capacity(game_paths.len()),
            content_hash: content_hash.into(),
            swap_target: None,
        };
        descriptor.add_game_paths(game_paths);
        descriptor
    }

    pub fn swap(game_paths: Vec<String>, target: impl Into<String>) -> Self {
        let mut descriptor = Self {
            game_paths: Vec::with_capacity(game_paths.len()),
            content_hash: String::new(),
            swap_target: Some(target.into()),
        };
        descriptor.add_game_paths(game_paths);
        descriptor
    }

    pub fn is_swap(&self) -> bool {
        self.swap_target.is_some()
    }

    pub fn has_game_path(&self, path: &str) -> bool {
        self.game_paths.iter().any(|p| p.eq_ignore_ascii_case(path))
    }

    /// Append paths not already present, ignoring case, keeping first-seen order
    pub fn add_game_paths(&mut self, paths: impl IntoIterator<Item = String>) {
        for path in paths {
            if !self.has_game_path(&path) {
                self.game_paths.push(path);
            }
        }
    }

    /// File extension of the first game path, used to name downloaded content
    pub fn extension(&self) -> Option<&str> {
        let first = self.game_paths.first()?;
        let file_name = first.rsplit('/').next().unwrap_or(first);
        file_name.rsplit_once('.').map(|(_, ext)| ext).filter(|ext| !ext.is_empty())
    }
}

/// Collapse content descriptors sharing a hash (compared ignoring case) into
/// one entry with the union of their game paths. Swaps are kept as given,
/// after all content entries.
pub fn merge_assets(assets: impl IntoIterator<Item = AssetDescriptor>) -> Vec<AssetDescriptor> {
    let mut merged: Vec<AssetDescriptor> = Vec::new();
    let mut by_hash: HashMap<String, usize> = HashMap::new();
    let mut swaps = Vec::new();

    for asset in assets {
        if asset.is_swap() {
            swaps.push(asset);
            continue;
        }

        let key = asset.content_hash.to_ascii_lowercase();
        match by_hash.get(&key) {
            Some(&index) => merged[index].add_game_paths(asset.game_paths),
            None => {
                by_hash.insert(key, merged.len());
                merged.push(AssetDescriptor::content(asset.game_paths, asset.content_hash));
            }
        }
    }

    merged.extend(swaps);
    merged
}

/// Immutable description of a character's visual state at one point in time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CharacterSnapshot {
    assets: BTreeMap<ObjectKind, Vec<AssetDescriptor>>,
    appearance: BTreeMap<ObjectKind, String>,
    manipulation: String,
    heels_offset: f32,
    scaling: String,
    fingerprint: String,
}

/// Everything that goes into the fingerprint, in a stable order
#[derive(Serialize)]
struct FingerprintBody<'a> {
    assets: &'a BTreeMap<ObjectKind, Vec<AssetDescriptor>>,
    appearance: &'a BTreeMap<ObjectKind, String>,
    manipulation: &'a str,
    heels_offset: f32,
    scaling: &'a str,
}

impl CharacterSnapshot {
    pub fn new(
        assets: BTreeMap<ObjectKind, Vec<AssetDescriptor>>,
        appearance: BTreeMap<ObjectKind, String>,
        manipulation: impl Into<String>,
        heels_offset: f32,
        scaling: impl Into<String>,
    ) -> SyncResult<Self> {
        let assets = assets
            .into_iter()
            .map(|(kind, list)| (kind, merge_assets(list)))
            .filter(|(_, list)| !list.is_empty())
            .collect();

        let mut snapshot = Self {
            assets,
            appearance,
            manipulation: manipulation.into(),
            heels_offset,
            scaling: scaling.into(),
            fingerprint: String::new(),
        };
        snapshot.fingerprint = snapshot.compute_fingerprint()?;
        Ok(snapshot)
    }

    fn compute_fingerprint(&self) -> SyncResult<String> {
        let body = FingerprintBody {
            assets: &self.assets,
            appearance: &self.appearance,
            manipulation: &self.manipulation,
            heels_offset: self.heels_offset,
            scaling: &self.scaling,
        };
        let bytes = serde_json::to_vec(&body)?;
        Ok(blake3::hash(&bytes).to_hex().to_string())
    }

    /// True when the carried fingerprint matches the content, e.g. for
    /// snapshots received from peers
    pub fn is_consistent(&self) -> bool {
        self.compute_fingerprint()
            .map(|fp| fp == self.fingerprint)
            .unwrap_or(false)
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn assets(&self) -> &BTreeMap<ObjectKind, Vec<AssetDescriptor>> {
        &self.assets
    }

    pub fn appearance(&self) -> &BTreeMap<ObjectKind, String> {
        &self.appearance
    }

    pub fn manipulation(&self) -> &str {
        &self.manipulation
    }

    pub fn heels_offset(&self) -> f32 {
        self.heels_offset
    }

    pub fn scaling(&self) -> &str {
        &self.scaling
    }

    /// Uploadable content referenced by this snapshot
    pub fn content_hashes(&self) -> BTreeSet<String> {
        self.assets
            .values()
            .flatten()
            .filter(|asset| !asset.is_swap())
            .map(|asset| asset.content_hash.clone())
            .collect()
    }

    /// Content descriptors across all categories, one per hash
    pub fn content_assets(&self) -> Vec<AssetDescriptor> {
        merge_assets(
            self.assets
                .values()
                .flatten()
                .filter(|asset| !asset.is_swap())
                .cloned(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn paths(list: &[&str]) -> Vec<String> {
        list.iter().map(|p| p.to_string()).collect()
    }

    #[test]
    fn test_merge_unions_paths_ignoring_case() {
        let merged = merge_assets(vec![
            AssetDescriptor::content(paths(&["chara/a.tex", "chara/b.tex"]), "HASH1"),
            AssetDescriptor::content(paths(&["CHARA/B.TEX", "chara/c.tex"]), "hash1"),
            AssetDescriptor::content(paths(&["chara/d.mdl"]), "hash2"),
        ]);

        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].content_hash, "HASH1");
        assert_eq!(
            merged[0].game_paths,
            paths(&["chara/a.tex", "chara/b.tex", "chara/c.tex"])
        );
        assert_eq!(merged[1].game_paths, paths(&["chara/d.mdl"]));
    }

    #[test]
    fn test_swaps_are_never_merged() {
        let merged = merge_assets(vec![
            AssetDescriptor::swap(paths(&["chara/x.tex"]), "chara/y.tex"),
            AssetDescriptor::content(paths(&["chara/a.tex"]), "h"),
            AssetDescriptor::swap(paths(&["chara/x.tex"]), "chara/y.tex"),
        ]);

        assert_eq!(merged.len(), 3);
        assert!(!merged[0].is_swap());
        assert!(merged[1].is_swap() && merged[2].is_swap());
    }

    #[test]
    fn test_extension_from_first_game_path() {
        let asset = AssetDescriptor::content(paths(&["chara/equipment/e0001.mtrl"]), "h");
        assert_eq!(asset.extension(), Some("mtrl"));

        let asset = AssetDescriptor::content(paths(&["chara/dir.v2/noext"]), "h");
        assert_eq!(asset.extension(), None);
    }

    #[test]
    fn test_fingerprint_is_stable_and_content_sensitive() {
        let build = |heels: f32| {
            let mut assets = BTreeMap::new();
            assets.insert(
                ObjectKind::Player,
                vec![AssetDescriptor::content(paths(&["chara/a.tex"]), "h1")],
            );
            CharacterSnapshot::new(assets, BTreeMap::new(), "manip", heels, "").unwrap()
        };

        let a = build(0.0);
        let b = build(0.0);
        let c = build(0.25);

        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());
        assert!(a.is_consistent());
        assert_eq!(a.content_hashes().into_iter().collect::<Vec<_>>(), vec!["h1"]);
    }

    #[test]
    fn test_tampered_snapshot_is_inconsistent() {
        let snapshot =
            CharacterSnapshot::new(BTreeMap::new(), BTreeMap::new(), "m", 0.0, "s").unwrap();
        let mut value = serde_json::to_value(&snapshot).unwrap();
        value["manipulation"] = serde_json::json!("other");
        let tampered: CharacterSnapshot = serde_json::from_value(value).unwrap();
        assert!(!tampered.is_consistent());
    }

    proptest! {
        #[test]
        fn prop_merge_leaves_one_entry_per_hash(
            entries in proptest::collection::vec(
                (0u8..4, proptest::collection::vec("[a-cA-C]{1,2}", 1..4)),
                0..20,
            )
        ) {
            let input: Vec<AssetDescriptor> = entries
                .iter()
                .map(|(h, p)| AssetDescriptor::content(p.clone(), format!("hash{}", h)))
                .collect();
            let merged = merge_assets(input.clone());

            let distinct: BTreeSet<_> = input.iter().map(|a| a.content_hash.clone()).collect();
            prop_assert_eq!(merged.len(), distinct.len());

            for asset in &merged {
                for (i, a) in asset.game_paths.iter().enumerate() {
                    for b in &asset.game_paths[i + 1..] {
                        prop_assert!(!a.eq_ignore_ascii_case(b));
                    }
                }
                for source in input.iter().filter(|a| a.content_hash == asset.content_hash) {
                    for path in &source.game_paths {
                        prop_assert!(asset.has_game_path(path));
                    }
                }
            }
        }
    }
}
