//! Artifact sections, versions and the version store.

use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::path::Path;
use std::str::FromStr;

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Workflow step that owns an artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArtifactSection {
    Research,
    Requirements,
    TechnicalDesign,
    BuildPlan,
}

impl ArtifactSection {
    pub const ALL: [ArtifactSection; 4] = [
        Self::Research,
        Self::Requirements,
        Self::TechnicalDesign,
        Self::BuildPlan,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Research => "research",
            Self::Requirements => "requirements",
            Self::TechnicalDesign => "technical-design",
            Self::BuildPlan => "build-plan",
        }
    }
}

impl fmt::Display for ArtifactSection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ArtifactSection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|section| section.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown section '{s}'"))
    }
}

/// One immutable snapshot of an artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactVersion {
    pub content: String,
    /// Creation time, milliseconds since the Unix epoch.
    pub timestamp: i64,
}

impl ArtifactVersion {
    fn now(content: String) -> Self {
        Self {
            content,
            timestamp: Utc::now().timestamp_millis(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectionHistory {
    versions: Vec<ArtifactVersion>,
    #[serde(default)]
    current_index: usize,
}

impl SectionHistory {
    fn clamp_cursor(&mut self) {
        self.current_index = self.current_index.min(self.versions.len().saturating_sub(1));
    }
}

/// Append-only per-section history with a read cursor.
///
/// Invariant: for a non-empty section `current_index < len`; for an empty
/// section it is `0`. Deserialization re-establishes it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "BTreeMap<ArtifactSection, SectionHistory>")]
#[serde(into = "BTreeMap<ArtifactSection, SectionHistory>")]
pub struct ArtifactVersionStore {
    sections: BTreeMap<ArtifactSection, SectionHistory>,
}

impl From<BTreeMap<ArtifactSection, SectionHistory>> for ArtifactVersionStore {
    fn from(mut sections: BTreeMap<ArtifactSection, SectionHistory>) -> Self {
        for history in sections.values_mut() {
            history.clamp_cursor();
        }
        Self { sections }
    }
}

impl From<ArtifactVersionStore> for BTreeMap<ArtifactSection, SectionHistory> {
    fn from(store: ArtifactVersionStore) -> Self {
        store.sections
    }
}

impl ArtifactVersionStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a new version and point the cursor at it. Returns its index.
    ///
    /// This is the only way content enters the store.
    pub fn append(&mut self, section: ArtifactSection, content: impl Into<String>) -> usize {
        let history = self.sections.entry(section).or_default();
        history.versions.push(ArtifactVersion::now(content.into()));
        history.current_index = history.versions.len() - 1;
        history.current_index
    }

    /// Move the cursor by `delta`, clamped to the history. Returns the new index.
    pub fn cycle(&mut self, section: ArtifactSection, delta: isize) -> usize {
        let Some(history) = self.sections.get_mut(&section) else {
            return 0;
        };
        let last = history.versions.len().saturating_sub(1);
        history.current_index = history.current_index.saturating_add_signed(delta).min(last);
        history.current_index
    }

    /// The version under the cursor.
    #[must_use]
    pub fn current(&self, section: ArtifactSection) -> Option<&ArtifactVersion> {
        self.sections
            .get(&section)
            .and_then(|h| h.versions.get(h.current_index))
    }

    #[must_use]
    pub fn versions(&self, section: ArtifactSection) -> &[ArtifactVersion] {
        self.sections.get(&section).map_or(&[], |h| h.versions.as_slice())
    }

    #[must_use]
    pub fn current_index(&self, section: ArtifactSection) -> usize {
        self.sections.get(&section).map_or(0, |h| h.current_index)
    }

    #[must_use]
    pub fn len(&self, section: ArtifactSection) -> usize {
        self.versions(section).len()
    }

    /// True when no section has any version.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sections.values().all(|h| h.versions.is_empty())
    }

    /// Drop all history, for project deletion.
    pub fn clear(&mut self) {
        self.sections.clear();
    }

    /// One-based position indicator, e.g. `"2/3"`. `"0/0"` when empty.
    #[must_use]
    pub fn version_label(&self, section: ArtifactSection) -> String {
        let len = self.len(section);
        if len == 0 {
            return "0/0".to_string();
        }
        format!("{}/{len}", self.current_index(section) + 1)
    }

    /// Read a store written by [`save`](Self::save). A missing file is an empty store.
    pub async fn load(path: &Path) -> io::Result<Self> {
        match tokio::fs::read_to_string(path).await {
            Ok(raw) => serde_json::from_str(&raw).map_err(io::Error::from),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Self::new()),
            Err(e) => Err(e),
        }
    }

    /// Write the store as pretty JSON, replacing `path` only once fully written.
    pub async fn save(&self, path: &Path) -> io::Result<()> {
        let json = serde_json::to_string_pretty(self).map_err(io::Error::from)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const S: ArtifactSection = ArtifactSection::Requirements;

    fn store_with(contents: &[&str]) -> ArtifactVersionStore {
        let mut store = ArtifactVersionStore::new();
        for c in contents {
            store.append(S, *c);
        }
        store
    }

    #[test]
    fn test_append_moves_cursor_to_newest() {
        let mut store = ArtifactVersionStore::new();
        assert_eq!(store.append(S, "a"), 0);
        assert_eq!(store.append(S, "b"), 1);
        assert_eq!(store.current(S).unwrap().content, "b");
        assert_eq!(store.version_label(S), "2/2");
    }

    #[test]
    fn test_cycle_clamps_at_both_ends() {
        let mut store = store_with(&["a", "b", "c"]);

        assert_eq!(store.cycle(S, 1), 2);
        assert_eq!(store.current(S).unwrap().content, "c");

        store.cycle(S, -1);
        store.cycle(S, -1);
        assert_eq!(store.cycle(S, -1), 0);
        assert_eq!(store.current(S).unwrap().content, "a");

        assert_eq!(store.cycle(S, -5), 0);
        assert_eq!(store.cycle(S, 10), 2);
        assert_eq!(store.len(S), 3);
    }

    #[test]
    fn test_cycle_on_empty_section() {
        let mut store = ArtifactVersionStore::new();
        assert_eq!(store.cycle(S, 1), 0);
        assert_eq!(store.cycle(S, -1), 0);
        assert!(store.current(S).is_none());
        assert_eq!(store.version_label(S), "0/0");
    }

    #[test]
    fn test_manual_edit_keeps_history() {
        let mut store = store_with(&["generated"]);
        store.cycle(S, -1);
        store.append(S, "edited by hand");

        let contents: Vec<&str> = store.versions(S).iter().map(|v| v.content.as_str()).collect();
        assert_eq!(contents, ["generated", "edited by hand"]);
        assert_eq!(store.current_index(S), 1);
    }

    #[test]
    fn test_sections_are_independent() {
        let mut store = store_with(&["req"]);
        store.append(ArtifactSection::Research, "res");
        store.cycle(ArtifactSection::Research, -1);
        assert_eq!(store.current(S).unwrap().content, "req");
        assert_eq!(store.len(ArtifactSection::BuildPlan), 0);
    }

    #[test]
    fn test_deserialize_reclamps_cursor() {
        let json = serde_json::json!({
            "technical-design": {
                "versions": [{ "content": "only", "timestamp": 1 }],
                "current_index": 7
            },
            "build-plan": { "versions": [], "current_index": 3 }
        });
        let store: ArtifactVersionStore = serde_json::from_value(json).unwrap();
        assert_eq!(store.current_index(ArtifactSection::TechnicalDesign), 0);
        assert_eq!(store.current_index(ArtifactSection::BuildPlan), 0);
        assert_eq!(store.current(ArtifactSection::TechnicalDesign).unwrap().content, "only");
    }

    #[tokio::test]
    async fn test_save_and_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("artifacts.json");

        assert!(ArtifactVersionStore::load(&path).await.unwrap().is_empty());

        let mut store = store_with(&["one", "two"]);
        store.cycle(S, -1);
        store.save(&path).await.unwrap();

        let loaded = ArtifactVersionStore::load(&path).await.unwrap();
        assert_eq!(loaded, store);
        assert_eq!(loaded.version_label(S), "1/2");
    }

    #[tokio::test]
    async fn test_load_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("artifacts.json");
        tokio::fs::write(&path, "not json").await.unwrap();

        let err = ArtifactVersionStore::load(&path).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_section_names() {
        assert_eq!("technical-design".parse::<ArtifactSection>(), Ok(ArtifactSection::TechnicalDesign));
        assert_eq!(
            serde_json::to_value(ArtifactSection::BuildPlan).unwrap(),
            serde_json::json!("build-plan")
        );
        assert!("design".parse::<ArtifactSection>().is_err());
    }
}
