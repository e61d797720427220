// SPDX-License-Identifier: MIT OR Apache-2.0

//! Relations and their samples.
//!
//! A [`Relation`] is a named set of `(subject, object)` [`Sample`]s plus
//! one or more prompt templates. A [`RelationDataset`] is a read-only
//! collection of relations, typically loaded from a directory of relation
//! JSON files:
//!
//! ```json
//! {
//!   "name": "country capital city",
//!   "prompt_templates": ["The capital of {} is"],
//!   "properties": { "relation_type": "factual", "domain_name": "country",
//!                   "range_name": "city", "symmetric": false },
//!   "samples": [{ "subject": "France", "object": "Paris" }]
//! }
//! ```
//!
//! Splitting, filtering and sample replacement all return new values.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use rand::Rng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::error::{LreError, Result};

// ---------------------------------------------------------------------------
// Sample
// ---------------------------------------------------------------------------

/// One `(subject, object)` pair of a relation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Sample {
    /// Subject string, substituted into the template's `{}`.
    pub subject: String,
    /// Object string the model should produce.
    pub object: String,
}

impl Sample {
    /// Create a sample.
    #[must_use]
    pub fn new(subject: impl Into<String>, object: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            object: object.into(),
        }
    }
}

impl std::fmt::Display for Sample {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} -> {}", self.subject, self.object)
    }
}

// ---------------------------------------------------------------------------
// Relation
// ---------------------------------------------------------------------------

/// Descriptive metadata carried by relation files.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationProperties {
    /// Broad category, e.g. `"factual"`, `"commonsense"`.
    #[serde(default)]
    pub relation_type: Option<String>,
    /// Name of the subject domain.
    #[serde(default)]
    pub domain_name: Option<String>,
    /// Name of the object range.
    #[serde(default)]
    pub range_name: Option<String>,
    /// Whether swapping subject and object yields the same relation.
    #[serde(default)]
    pub symmetric: bool,
}

/// How [`Relation::split`] chooses the training samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SplitPolicy {
    /// The first `n` samples in stored order.
    First,
    /// `n` samples drawn uniformly by the caller's RNG.
    Shuffled,
}

/// A named relation with prompt templates and samples.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relation {
    /// Relation name, unique within a dataset.
    pub name: String,
    /// Prompt templates with a `{}` subject slot; the first is active.
    pub prompt_templates: Vec<String>,
    /// Samples in stored order.
    pub samples: Vec<Sample>,
    /// Descriptive metadata.
    #[serde(default)]
    pub properties: RelationProperties,
}

impl Relation {
    /// Create a relation with default properties.
    ///
    /// # Errors
    ///
    /// Returns [`LreError::Dataset`] if no template is given or a template
    /// lacks the `{}` slot.
    pub fn new(
        name: impl Into<String>,
        prompt_templates: Vec<String>,
        samples: Vec<Sample>,
    ) -> Result<Self> {
        let relation = Self {
            name: name.into(),
            prompt_templates,
            samples,
            properties: RelationProperties::default(),
        };
        relation.validate()?;
        Ok(relation)
    }

    /// Replace the properties.
    #[must_use]
    pub fn with_properties(mut self, properties: RelationProperties) -> Self {
        self.properties = properties;
        self
    }

    /// Check the template invariants.
    ///
    /// # Errors
    ///
    /// Returns [`LreError::Dataset`] on violation.
    pub fn validate(&self) -> Result<()> {
        if self.prompt_templates.is_empty() {
            return Err(LreError::Dataset(format!(
                "relation {:?} has no prompt templates",
                self.name
            )));
        }
        if let Some(bad) = self.prompt_templates.iter().find(|t| !t.contains("{}")) {
            return Err(LreError::Dataset(format!(
                "template {bad:?} of relation {:?} has no {{}} slot",
                self.name
            )));
        }
        Ok(())
    }

    /// The active prompt template.
    #[must_use]
    pub fn template(&self) -> &str {
        self.prompt_templates.first().map_or("{}", String::as_str)
    }

    /// Number of samples.
    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether the relation has no samples.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Distinct subjects, sorted.
    #[must_use]
    pub fn domain(&self) -> BTreeSet<&str> {
        self.samples.iter().map(|s| s.subject.as_str()).collect()
    }

    /// Distinct objects, sorted.
    #[must_use]
    pub fn range(&self) -> BTreeSet<&str> {
        self.samples.iter().map(|s| s.object.as_str()).collect()
    }

    /// Same relation with a different sample set.
    #[must_use]
    pub fn with_samples(&self, samples: Vec<Sample>) -> Self {
        Self {
            name: self.name.clone(),
            prompt_templates: self.prompt_templates.clone(),
            samples,
            properties: self.properties.clone(),
        }
    }

    /// Split into `(train, test)` with `n` training samples.
    ///
    /// The two halves are disjoint and together hold every sample. With
    /// [`SplitPolicy::Shuffled`] the choice depends only on `rng`'s state;
    /// with [`SplitPolicy::First`] the RNG is not consumed. Each half
    /// keeps stored order.
    ///
    /// # Errors
    ///
    /// Returns [`LreError::InsufficientData`] if `n` exceeds the sample
    /// count.
    pub fn split<R: Rng + ?Sized>(
        &self,
        n: usize,
        policy: SplitPolicy,
        rng: &mut R,
    ) -> Result<(Self, Self)> {
        if n > self.samples.len() {
            return Err(LreError::InsufficientData {
                relation: self.name.clone(),
                needed: n,
                available: self.samples.len(),
            });
        }

        let train_indices: BTreeSet<usize> = match policy {
            SplitPolicy::First => (0..n).collect(),
            SplitPolicy::Shuffled => {
                let mut indices: Vec<usize> = (0..self.samples.len()).collect();
                indices.shuffle(rng);
                indices.into_iter().take(n).collect()
            }
        };

        let mut train = Vec::with_capacity(n);
        let mut test = Vec::with_capacity(self.samples.len() - n);
        for (i, sample) in self.samples.iter().enumerate() {
            if train_indices.contains(&i) {
                train.push(sample.clone());
            } else {
                test.push(sample.clone());
            }
        }

        Ok((self.with_samples(train), self.with_samples(test)))
    }
}

// ---------------------------------------------------------------------------
// RelationDataset
// ---------------------------------------------------------------------------

/// Read-only collection of relations.
#[derive(Debug, Clone, Default)]
pub struct RelationDataset {
    relations: Vec<Relation>,
}

impl RelationDataset {
    /// Build a dataset from in-memory relations.
    ///
    /// # Errors
    ///
    /// Returns [`LreError::Dataset`] on duplicate names or invalid
    /// templates.
    pub fn from_relations(relations: Vec<Relation>) -> Result<Self> {
        let mut names = BTreeSet::new();
        for relation in &relations {
            relation.validate()?;
            if !names.insert(relation.name.as_str()) {
                return Err(LreError::Dataset(format!(
                    "duplicate relation name {:?}",
                    relation.name
                )));
            }
        }
        Ok(Self { relations })
    }

    /// Load every `*.json` relation file under `dir`, recursively.
    ///
    /// Each directory is visited in file-name order so the relation order
    /// is stable across platforms. Symlinks are not followed.
    ///
    /// # Errors
    ///
    /// Returns [`LreError::Io`] on read failures, [`LreError::Json`] on
    /// malformed files and [`LreError::Dataset`] on invalid relations.
    pub fn load_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let paths = json_files(dir.as_ref())?;

        let mut relations = Vec::with_capacity(paths.len());
        for path in &paths {
            let text = std::fs::read_to_string(path)?;
            let relation: Relation = serde_json::from_str(&text)?;
            tracing::debug!(path = %path.display(), relation = %relation.name, "loaded relation");
            relations.push(relation);
        }
        tracing::info!(count = relations.len(), dir = %dir.as_ref().display(), "loaded relations");
        Self::from_relations(relations)
    }

    /// Keep only the named relations, in dataset order.
    ///
    /// An empty `names` slice keeps everything.
    #[must_use]
    pub fn filter<S: AsRef<str>>(&self, names: &[S]) -> Self {
        if names.is_empty() {
            return self.clone();
        }
        let relations = self
            .relations
            .iter()
            .filter(|r| names.iter().any(|n| n.as_ref() == r.name))
            .cloned()
            .collect();
        Self { relations }
    }

    /// Look up a relation by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Relation> {
        self.relations.iter().find(|r| r.name == name)
    }

    /// All relations in order.
    #[must_use]
    pub fn relations(&self) -> &[Relation] {
        &self.relations
    }

    /// Relation names in order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.relations.iter().map(|r| r.name.as_str())
    }

    /// Number of relations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.relations.len()
    }

    /// Whether the dataset is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.relations.is_empty()
    }
}

/// Every `*.json` file under `dir` in file-name order. Symlinks are not
/// followed.
fn json_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for entry in WalkDir::new(dir).follow_links(false).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            LreError::Dataset(format!("cannot read relation directory {}: {e}", dir.display()))
        })?;
        if entry.file_type().is_file()
            && entry.path().extension().is_some_and(|ext| ext == "json")
        {
            paths.push(entry.into_path());
        }
    }
    Ok(paths)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    use super::*;

    fn relation(n: usize) -> Relation {
        let samples = (0..n)
            .map(|i| Sample::new(format!("s{i}"), format!("o{}", i % 3)))
            .collect();
        Relation::new("toy", vec!["{} maps to".to_string()], samples).unwrap()
    }

    #[test]
    fn split_is_disjoint_and_complete() {
        let rel = relation(10);
        let mut rng = StdRng::seed_from_u64(7);
        let (train, test) = rel.split(4, SplitPolicy::Shuffled, &mut rng).unwrap();
        assert_eq!(train.len(), 4);
        assert_eq!(test.len(), 6);

        let train_set: BTreeSet<_> = train.samples.iter().collect();
        assert!(test.samples.iter().all(|s| !train_set.contains(s)));

        let mut union: Vec<_> = train.samples.iter().chain(&test.samples).cloned().collect();
        union.sort();
        let mut all = rel.samples.clone();
        all.sort();
        assert_eq!(union, all);
    }

    #[test]
    fn shuffled_split_is_deterministic_per_seed() {
        let rel = relation(12);
        let a = rel
            .split(5, SplitPolicy::Shuffled, &mut StdRng::seed_from_u64(1))
            .unwrap();
        let b = rel
            .split(5, SplitPolicy::Shuffled, &mut StdRng::seed_from_u64(1))
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn first_split_takes_prefix() {
        let rel = relation(5);
        let (train, test) = rel
            .split(2, SplitPolicy::First, &mut StdRng::seed_from_u64(0))
            .unwrap();
        assert_eq!(train.samples, rel.samples[..2]);
        assert_eq!(test.samples, rel.samples[2..]);
    }

    #[test]
    fn split_larger_than_relation_fails() {
        let rel = relation(3);
        let err = rel
            .split(4, SplitPolicy::First, &mut StdRng::seed_from_u64(0))
            .unwrap_err();
        assert!(matches!(
            err,
            LreError::InsufficientData { needed: 4, available: 3, .. }
        ));
    }

    #[test]
    fn domain_and_range_are_distinct() {
        let rel = relation(6);
        assert_eq!(rel.domain().len(), 6);
        assert_eq!(rel.range().into_iter().collect::<Vec<_>>(), vec!["o0", "o1", "o2"]);
    }

    #[test]
    fn template_without_slot_is_rejected() {
        let err = Relation::new("bad", vec!["no slot".into()], Vec::new()).unwrap_err();
        assert!(matches!(err, LreError::Dataset(_)));
    }

    #[test]
    fn relation_json_with_properties() {
        let json = r#"{
            "name": "country capital city",
            "prompt_templates": ["The capital of {} is"],
            "properties": {"relation_type": "factual", "domain_name": "country",
                           "range_name": "city", "symmetric": false},
            "samples": [{"subject": "France", "object": "Paris"}]
        }"#;
        let rel: Relation = serde_json::from_str(json).unwrap();
        assert_eq!(rel.template(), "The capital of {} is");
        assert_eq!(rel.properties.range_name.as_deref(), Some("city"));
        assert_eq!(rel.samples[0], Sample::new("France", "Paris"));

        let minimal = r#"{"name": "x", "prompt_templates": ["{} is"], "samples": []}"#;
        let rel: Relation = serde_json::from_str(minimal).unwrap();
        assert_eq!(rel.properties, RelationProperties::default());
    }

    #[test]
    fn dataset_rejects_duplicates_and_filters() {
        let a = relation(2);
        let mut b = relation(2);
        b.name = "other".into();
        assert!(RelationDataset::from_relations(vec![a.clone(), a.clone()]).is_err());

        let ds = RelationDataset::from_relations(vec![a, b]).unwrap();
        assert_eq!(ds.filter(&["other"]).names().collect::<Vec<_>>(), vec!["other"]);
        assert_eq!(ds.filter::<&str>(&[]).len(), 2);
        assert!(ds.get("toy").is_some());
        assert!(ds.get("missing").is_none());
    }

    #[test]
    fn load_dir_reads_nested_files_in_order() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        let nested = root.join("factual");
        std::fs::create_dir_all(&nested).unwrap();

        let mut second = relation(3);
        second.name = "b relation".into();
        let mut first = relation(3);
        first.name = "a relation".into();
        std::fs::write(nested.join("b.json"), serde_json::to_string(&second).unwrap()).unwrap();
        std::fs::write(root.join("a.json"), serde_json::to_string(&first).unwrap()).unwrap();
        std::fs::write(root.join("notes.txt"), "ignored").unwrap();

        let ds = RelationDataset::load_dir(root).unwrap();

        assert_eq!(ds.names().collect::<Vec<_>>(), vec!["a relation", "b relation"]);
        assert_eq!(ds.get("b relation").unwrap().samples, second.samples);
    }

    #[cfg(unix)]
    #[test]
    fn load_dir_does_not_follow_symlink_loops() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        let nested = root.join("nested");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(nested.join("r.json"), serde_json::to_string(&relation(3)).unwrap())
            .unwrap();
        std::os::unix::fs::symlink(root, nested.join("loop")).unwrap();

        let ds = RelationDataset::load_dir(root).unwrap();
        assert_eq!(ds.len(), 1);
    }

    #[test]
    fn load_dir_of_missing_directory_is_a_dataset_error() {
        let tmp = tempfile::tempdir().unwrap();
        let missing = tmp.path().join("absent");
        assert!(matches!(
            RelationDataset::load_dir(&missing),
            Err(LreError::Dataset(_))
        ));
    }
}
