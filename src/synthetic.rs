// SPDX-License-Identifier: MIT OR Apache-2.0

//! Hand-wired relational worlds on the token-shift backend.
//!
//! A [`SyntheticWorld`] is a tiny [`TokenShiftLm`] whose weights encode a
//! set of relations exactly, so the whole estimation and editing pipeline
//! can run against a model with known ground truth:
//!
//! - the vocabulary is word-level and embeddings are one-hot (`d` equals
//!   the vocabulary size, the unembedding is tied);
//! - every block's token mix reads only the previous position;
//! - every block projection is zero except the *relation block*
//!   (`source_layer + 1`), whose projection is
//!   `M = Σ σ_s · e_object(s) · e_sᵀ`.
//!
//! A prompt ending in `... {subject} is` therefore has final
//! representation `z = e_is + σ_s · e_object`, the model's top prediction
//! is the object, and `∂z/∂h` at the subject is exactly `M`. Strengths
//! `σ_s` are distinct and above 1, increasing in wiring order.
//!
//! Templates must end with a word after the `{}` slot so the subject is
//! the token right before the prediction position.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;

use crate::backend::LreModel;
use crate::data::{Relation, RelationDataset, Sample};
use crate::error::{LreError, Result};
use crate::token_shift::{TokenShiftConfig, TokenShiftLm};
use crate::tokenizer::LreTokenizer;

/// Out-of-vocabulary token, always ID 0.
pub const UNK_TOKEN: &str = "[UNK]";

/// Identifier given to synthetic models.
pub const SYNTHETIC_MODEL_ID: &str = "synthetic-token-shift";

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for [`SyntheticWorld`].
#[derive(Debug, Clone)]
pub struct SyntheticWorldBuilder {
    relations: Vec<Relation>,
    unwired: BTreeSet<String>,
    num_layers: usize,
    source_layer: usize,
    base_strength: f32,
    strength_step: f32,
}

impl Default for SyntheticWorldBuilder {
    fn default() -> Self {
        Self {
            relations: Vec::new(),
            unwired: BTreeSet::new(),
            num_layers: 4,
            source_layer: 1,
            base_strength: 4.0,
            strength_step: 0.5,
        }
    }
}

impl SyntheticWorldBuilder {
    /// Add a relation; all its subjects are wired unless marked unwired.
    #[must_use]
    pub fn relation(mut self, relation: Relation) -> Self {
        self.relations.push(relation);
        self
    }

    /// Keep `subject` in the vocabulary but give it no relation mapping,
    /// so the model does not know its object.
    #[must_use]
    pub fn unwired_subject(mut self, subject: impl Into<String>) -> Self {
        self.unwired.insert(subject.into());
        self
    }

    /// Block count and the layer subject states are read from. The relation
    /// block is `source_layer + 1`.
    #[must_use]
    pub const fn layers(mut self, num_layers: usize, source_layer: usize) -> Self {
        self.num_layers = num_layers;
        self.source_layer = source_layer;
        self
    }

    /// Strength of the first wired subject and the increment per subject.
    #[must_use]
    pub const fn strengths(mut self, base: f32, step: f32) -> Self {
        self.base_strength = base;
        self.strength_step = step;
        self
    }

    /// Build the world on `device`.
    ///
    /// # Errors
    ///
    /// Returns [`LreError::Config`] if the layer layout is impossible or a
    /// strength is not above 1, [`LreError::Dataset`] if a subject is not a
    /// single word, collides with another vocabulary word, or maps to two
    /// different objects, and propagates model construction errors.
    pub fn build(self, device: &Device) -> Result<SyntheticWorld> {
        if self.source_layer + 1 >= self.num_layers {
            return Err(LreError::Config(format!(
                "source layer {} leaves no relation block in a {}-layer model",
                self.source_layer, self.num_layers
            )));
        }
        if self.base_strength <= 1.0 || self.strength_step < 0.0 {
            return Err(LreError::Config(
                "relation strengths must exceed 1 and be non-decreasing".into(),
            ));
        }

        let dataset = RelationDataset::from_relations(self.relations)?;
        let (vocab, wiring) = plan_vocabulary(&dataset, &self.unwired)?;

        let mut strengths = BTreeMap::new();
        let mut next = self.base_strength;
        for (subject, _) in &wiring {
            strengths.insert(subject.clone(), next);
            next += self.strength_step;
        }

        let d = vocab.len();
        let config = TokenShiftConfig {
            hidden_size: d,
            num_layers: self.num_layers,
            vocab_size: d,
            intermediate_size: d,
            use_mlp: false,
            block_norms: false,
            final_norm: false,
            norm_eps: 1e-5,
            tie_word_embeddings: true,
        };

        let index: HashMap<&str, usize> = vocab
            .iter()
            .enumerate()
            .map(|(i, w)| (w.as_str(), i))
            .collect();
        let mut relation_map = vec![0.0_f32; d * d];
        for (subject, object) in &wiring {
            if let (Some(&s), Some(&o), Some(&sigma)) = (
                index.get(subject.as_str()),
                index.get(object.as_str()),
                strengths.get(subject),
            ) {
                if let Some(cell) = relation_map.get_mut(o * d + s) {
                    *cell = sigma;
                }
            }
        }

        let mut tensors = HashMap::new();
        tensors.insert("emb.weight".to_string(), Tensor::eye(d, DType::F32, device)?);
        let relation_block = self.source_layer + 1;
        for i in 0..self.num_layers {
            tensors.insert(
                format!("blocks.{i}.mix.time_mix"),
                Tensor::ones(d, DType::F32, device)?,
            );
            let proj = if i == relation_block {
                Tensor::from_vec(relation_map.clone(), (d, d), device)?
            } else {
                Tensor::zeros((d, d), DType::F32, device)?
            };
            tensors.insert(format!("blocks.{i}.mix.proj.weight"), proj);
        }

        let tokenizer = LreTokenizer::word_level(&vocab, UNK_TOKEN)?;
        let vb = VarBuilder::from_tensors(tensors.clone(), DType::F32, device);
        let backend = TokenShiftLm::load(config.clone(), vb)?;
        let model = LreModel::new(Box::new(backend), tokenizer, device.clone())
            .with_model_id(SYNTHETIC_MODEL_ID);

        tracing::debug!(
            vocab = d,
            relations = dataset.len(),
            wired = wiring.len(),
            "built synthetic world"
        );

        Ok(SyntheticWorld {
            dataset,
            vocab,
            strengths,
            config,
            tensors,
            source_layer: self.source_layer,
            model,
        })
    }
}

/// Vocabulary in first-seen order (`[UNK]` first) and the
/// `(subject, object first word)` wiring in relation order.
fn plan_vocabulary(
    dataset: &RelationDataset,
    unwired: &BTreeSet<String>,
) -> Result<(Vec<String>, Vec<(String, String)>)> {
    let mut vocab = vec![UNK_TOKEN.to_string()];
    let mut seen: BTreeSet<String> = vocab.iter().cloned().collect();
    let mut push = |word: &str, vocab: &mut Vec<String>| {
        if seen.insert(word.to_string()) {
            vocab.push(word.to_string());
        }
    };

    let mut context_words = BTreeSet::new();
    for relation in dataset.relations() {
        for template in &relation.prompt_templates {
            for word in template.replace("{}", " ").split_whitespace() {
                context_words.insert(word.to_string());
                push(word, &mut vocab);
            }
        }
        for sample in &relation.samples {
            for word in sample.object.split_whitespace() {
                context_words.insert(word.to_string());
                push(word, &mut vocab);
            }
        }
    }

    let mut wiring: Vec<(String, String)> = Vec::new();
    let mut wired_objects: BTreeMap<String, String> = BTreeMap::new();
    for relation in dataset.relations() {
        for Sample { subject, object } in &relation.samples {
            if subject.split_whitespace().count() != 1 || subject.trim() != subject {
                return Err(LreError::Dataset(format!(
                    "synthetic subject {subject:?} must be a single word"
                )));
            }
            if context_words.contains(subject) {
                return Err(LreError::Dataset(format!(
                    "synthetic subject {subject:?} is also a template or object word"
                )));
            }
            push(subject, &mut vocab);
            if unwired.contains(subject) {
                continue;
            }
            let first = object.split_whitespace().next().ok_or_else(|| {
                LreError::Dataset(format!("subject {subject:?} has an empty object"))
            })?;
            match wired_objects.get(subject) {
                Some(existing) if existing != first => {
                    return Err(LreError::Dataset(format!(
                        "subject {subject:?} maps to both {existing:?} and {first:?}"
                    )));
                }
                Some(_) => {}
                None => {
                    wired_objects.insert(subject.clone(), first.to_string());
                    wiring.push((subject.clone(), first.to_string()));
                }
            }
        }
    }
    for subject in unwired {
        push(subject, &mut vocab);
    }
    Ok((vocab, wiring))
}

// ---------------------------------------------------------------------------
// SyntheticWorld
// ---------------------------------------------------------------------------

/// A relation dataset together with a model that encodes it exactly.
#[derive(Debug)]
pub struct SyntheticWorld {
    dataset: RelationDataset,
    vocab: Vec<String>,
    strengths: BTreeMap<String, f32>,
    config: TokenShiftConfig,
    tensors: HashMap<String, Tensor>,
    source_layer: usize,
    model: LreModel,
}

impl SyntheticWorld {
    /// Start building a world.
    #[must_use]
    pub fn builder() -> SyntheticWorldBuilder {
        SyntheticWorldBuilder::default()
    }

    /// Ten country → capital samples under `"The capital of {} is"`.
    ///
    /// # Errors
    ///
    /// Propagates construction errors.
    pub fn capitals() -> Result<Self> {
        Self::builder()
            .relation(capital_relation()?)
            .build(&Device::Cpu)
    }

    /// Capitals plus a country → language relation, with an extra
    /// capital sample whose subject the model does not know.
    ///
    /// # Errors
    ///
    /// Propagates construction errors.
    pub fn atlas() -> Result<Self> {
        let mut capitals = capital_relation()?;
        capitals.samples.push(Sample::new("Atlantis", "Poseidonia"));
        Self::builder()
            .relation(capitals)
            .relation(language_relation()?)
            .unwired_subject("Atlantis")
            .build(&Device::Cpu)
    }

    /// The relations this world encodes.
    #[must_use]
    pub const fn dataset(&self) -> &RelationDataset {
        &self.dataset
    }

    /// A relation by name.
    #[must_use]
    pub fn relation(&self, name: &str) -> Option<&Relation> {
        self.dataset.get(name)
    }

    /// The model encoding the relations.
    #[must_use]
    pub const fn model(&self) -> &LreModel {
        &self.model
    }

    /// Layer whose block output holds the clean subject embedding.
    #[must_use]
    pub const fn source_layer(&self) -> usize {
        self.source_layer
    }

    /// Word-level vocabulary in ID order.
    #[must_use]
    pub fn vocab(&self) -> &[String] {
        &self.vocab
    }

    /// Vocabulary ID of `word`, or the `[UNK]` ID.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::as_conversions)]
    pub fn token_id(&self, word: &str) -> u32 {
        self.vocab.iter().position(|w| w == word).unwrap_or(0) as u32
    }

    /// Wired strength `σ` of `subject`, or 0 for unwired subjects.
    #[must_use]
    pub fn strength(&self, subject: &str) -> f32 {
        self.strengths.get(subject).copied().unwrap_or(0.0)
    }

    /// Write the model as a loadable directory (`config.json`,
    /// `model.safetensors`, `tokenizer.json`).
    ///
    /// # Errors
    ///
    /// Returns [`LreError::Io`] on write failures and propagates
    /// serialization errors.
    pub fn write_model_dir(&self, dir: impl AsRef<Path>) -> Result<()> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let config = serde_json::to_string_pretty(&self.config.to_hf_config())?;
        std::fs::write(dir.join("config.json"), config)?;
        candle_core::safetensors::save(&self.tensors, dir.join("model.safetensors"))?;
        self.model.tokenizer().save(dir.join("tokenizer.json"))?;
        Ok(())
    }
}

fn capital_relation() -> Result<Relation> {
    let pairs = [
        ("France", "Paris"),
        ("Japan", "Tokyo"),
        ("Peru", "Lima"),
        ("Egypt", "Cairo"),
        ("Kenya", "Nairobi"),
        ("Italy", "Rome"),
        ("Spain", "Madrid"),
        ("Chile", "Santiago"),
        ("Canada", "Ottawa"),
        ("Norway", "Oslo"),
    ];
    Relation::new(
        "country capital city",
        vec!["The capital of {} is".to_string()],
        pairs.iter().map(|(s, o)| Sample::new(*s, *o)).collect(),
    )
}

fn language_relation() -> Result<Relation> {
    let pairs = [
        ("Brazil", "Portuguese"),
        ("Germany", "German"),
        ("Mexico", "Spanish"),
        ("Sweden", "Swedish"),
        ("Greece", "Greek"),
        ("Turkey", "Turkish"),
        ("Poland", "Polish"),
        ("Iran", "Persian"),
        ("China", "Mandarin"),
        ("Russia", "Russian"),
    ];
    Relation::new(
        "country language",
        vec!["People in {} speak".to_string()],
        pairs.iter().map(|(s, o)| Sample::new(*s, *o)).collect(),
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
