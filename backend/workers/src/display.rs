//! Session display index: section → equation → latest result, kept as a YAML
//! side file. Always rewritten whole; never patched in place.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use equaforge_core::{PackedId, RecordId};

use crate::fsutil::atomic_write;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayEntry {
    pub author: String,
    pub predicted_text: String,
    /// Result record this entry was built from.
    pub store_id: PackedId,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DisplayIndex {
    sections: BTreeMap<String, BTreeMap<String, DisplayEntry>>,
}

impl DisplayIndex {
    /// Read the index; a missing or empty file is an empty index.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(e).with_context(|| format!("Failed to read {path:?}")),
        };
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(&raw).with_context(|| format!("Failed to parse display index {path:?}"))
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let yaml = serde_yaml::to_string(self).context("Failed to serialize display index")?;
        atomic_write(path, yaml.as_bytes())
    }

    pub fn upsert(&mut self, section: &str, equation: &str, entry: DisplayEntry) {
        self.sections
            .entry(section.to_string())
            .or_default()
            .insert(equation.to_string(), entry);
    }

    pub fn get(&self, section: &str, equation: &str) -> Option<&DisplayEntry> {
        self.sections.get(section)?.get(equation)
    }

    /// Drop every leaf built from `result_id`, and any section left empty.
    /// Returns the removed (section, equation) keys.
    pub fn remove_result(&mut self, result_id: RecordId) -> Vec<(String, String)> {
        let packed = result_id.split();
        let mut removed = Vec::new();
        for (section, equations) in self.sections.iter_mut() {
            equations.retain(|equation, entry| {
                let keep = entry.store_id != packed;
                if !keep {
                    removed.push((section.clone(), equation.clone()));
                }
                keep
            });
        }
        self.sections.retain(|_, equations| !equations.is_empty());
        removed
    }

    pub fn sections(&self) -> impl Iterator<Item = (&str, &BTreeMap<String, DisplayEntry>)> {
        self.sections.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.sections.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: RecordId, text: &str) -> DisplayEntry {
        DisplayEntry {
            author: "gauss".into(),
            predicted_text: text.into(),
            store_id: id.split(),
        }
    }

    #[test]
    fn upsert_replaces_leaf() {
        let mut index = DisplayIndex::default();
        let a = RecordId::generate();
        let b = RecordId::generate();
        index.upsert("calculus", "ftc", entry(a, "old"));
        index.upsert("calculus", "ftc", entry(b, "new"));
        assert_eq!(index.len(), 1);
        assert_eq!(index.get("calculus", "ftc").unwrap().predicted_text, "new");
    }

    #[test]
    fn removing_last_equation_drops_section() {
        let mut index = DisplayIndex::default();
        let a = RecordId::generate();
        let b = RecordId::generate();
        index.upsert("calculus", "ftc", entry(a, "x"));
        index.upsert("algebra", "quadratic", entry(b, "y"));

        let removed = index.remove_result(a);
        assert_eq!(removed, vec![("calculus".to_string(), "ftc".to_string())]);
        assert!(index.get("calculus", "ftc").is_none());
        assert_eq!(index.sections().count(), 1);
        assert!(index.remove_result(a).is_empty());
    }

    #[test]
    fn saves_and_loads_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("display_index.yaml");
        assert!(DisplayIndex::load(&path).unwrap().is_empty());

        let mut index = DisplayIndex::default();
        index.upsert("mechanics", "newton2", entry(RecordId::generate(), "F=ma"));
        index.save(&path).unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("mechanics:"));
        assert!(raw.contains("newton2:"));
        assert_eq!(DisplayIndex::load(&path).unwrap(), index);
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("display_index.yaml");
        std::fs::write(&path, "mechanics: [unclosed").unwrap();
        assert!(DisplayIndex::load(&path).is_err());
    }
}
