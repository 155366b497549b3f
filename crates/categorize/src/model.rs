//! Trained categorization model: TF-IDF vectorizer, random-forest classifier
//! and label encoder, exported as three JSON artifacts in one directory.
//!
//! The three artifacts are loaded together or not at all. A model that is
//! absent or fails validation leaves the engine in keyword fallback mode.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use regex::Regex;
use serde::Deserialize;
use thiserror::Error;
use tracing::{error, info, warn};

pub const VECTORIZER_FILE: &str = "vectorizer.json";
pub const CLASSIFIER_FILE: &str = "categorization_model.json";
pub const LABEL_ENCODER_FILE: &str = "label_encoder.json";

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("Failed to read {path}: {source}")]
    Io { path: PathBuf, source: std::io::Error },
    #[error("Failed to parse {path}: {source}")]
    Parse { path: PathBuf, source: serde_json::Error },
    #[error("Inconsistent model artifacts: {0}")]
    Inconsistent(String),
    #[error("Malformed tree #{tree}: {reason}")]
    MalformedTree { tree: usize, reason: String },
}

// ── Vectorizer ────────────────────────────────────────────────────────────────

fn re_token() -> &'static Regex {
    static R: OnceLock<Regex> = OnceLock::new();
    R.get_or_init(|| Regex::new(r"\b\w\w+\b").expect("invalid regex"))
}

fn default_ngram_range() -> (usize, usize) {
    (1, 1)
}

/// Word n-gram TF-IDF vectorizer with L2 normalization.
#[derive(Debug, Clone, Deserialize)]
pub struct TfidfVectorizer {
    vocabulary: HashMap<String, usize>,
    idf: Vec<f32>,
    #[serde(default = "default_ngram_range")]
    ngram_range: (usize, usize),
    #[serde(default)]
    sublinear_tf: bool,
}

impl TfidfVectorizer {
    pub fn new(vocabulary: HashMap<String, usize>, idf: Vec<f32>, ngram_range: (usize, usize)) -> Self {
        Self { vocabulary, idf, ngram_range, sublinear_tf: false }
    }

    pub fn n_features(&self) -> usize {
        self.idf.len()
    }

    fn validate(&self) -> Result<(), ModelError> {
        let (lo, hi) = self.ngram_range;
        if lo == 0 || lo > hi {
            return Err(ModelError::Inconsistent(format!("bad ngram_range ({lo}, {hi})")));
        }
        if let Some((term, idx)) = self.vocabulary.iter().find(|&(_, &i)| i >= self.idf.len()) {
            return Err(ModelError::Inconsistent(format!(
                "term '{term}' maps to feature {idx} but idf has {} entries",
                self.idf.len()
            )));
        }
        Ok(())
    }

    fn ngrams(&self, text: &str) -> Vec<String> {
        let lowered = text.to_lowercase();
        let tokens: Vec<&str> = re_token().find_iter(&lowered).map(|m| m.as_str()).collect();
        let (lo, hi) = self.ngram_range;
        let mut grams = Vec::new();
        for n in lo..=hi {
            if n > tokens.len() {
                break;
            }
            grams.extend(tokens.windows(n).map(|w| w.join(" ")));
        }
        grams
    }

    /// Dense, L2-normalized TF-IDF vector. All zeros when no term is known.
    pub fn transform(&self, text: &str) -> Vec<f32> {
        let mut counts: HashMap<usize, f32> = HashMap::new();
        for gram in self.ngrams(text) {
            if let Some(&idx) = self.vocabulary.get(&gram) {
                *counts.entry(idx).or_default() += 1.0;
            }
        }

        let mut vector = vec![0.0f32; self.idf.len()];
        for (idx, tf) in counts {
            let tf = if self.sublinear_tf { 1.0 + tf.ln() } else { tf };
            vector[idx] = tf * self.idf[idx];
        }

        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|v| *v /= norm);
        }
        vector
    }
}

// ── Random forest ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum TreeNode {
    Split { feature: usize, threshold: f32, left: usize, right: usize },
    Leaf { value: Vec<f32> },
}

#[derive(Debug, Clone, Deserialize)]
pub struct DecisionTree {
    pub nodes: Vec<TreeNode>,
}

impl DecisionTree {
    /// Normalized class distribution of the leaf `x` falls into.
    fn predict_proba(&self, tree_idx: usize, x: &[f32]) -> Result<Vec<f32>, ModelError> {
        let malformed = |reason: String| ModelError::MalformedTree { tree: tree_idx, reason };
        let mut node = 0usize;
        // A well-formed tree reaches a leaf in fewer steps than it has nodes.
        for _ in 0..self.nodes.len() {
            match self.nodes.get(node) {
                Some(TreeNode::Split { feature, threshold, left, right }) => {
                    let v = x
                        .get(*feature)
                        .ok_or_else(|| malformed(format!("feature {feature} out of range")))?;
                    node = if *v <= *threshold { *left } else { *right };
                }
                Some(TreeNode::Leaf { value }) => {
                    let total: f32 = value.iter().sum();
                    if !total.is_finite() || total <= 0.0 {
                        return Err(malformed(format!("leaf {node} has empty distribution")));
                    }
                    return Ok(value.iter().map(|v| v / total).collect());
                }
                None => return Err(malformed(format!("node {node} does not exist"))),
            }
        }
        Err(malformed("cycle detected".to_string()))
    }

    fn validate(&self, tree_idx: usize, n_features: usize, n_classes: usize) -> Result<(), ModelError> {
        let malformed = |reason: String| ModelError::MalformedTree { tree: tree_idx, reason };
        if self.nodes.is_empty() {
            return Err(malformed("no nodes".to_string()));
        }
        for (i, node) in self.nodes.iter().enumerate() {
            match node {
                TreeNode::Split { feature, left, right, .. } => {
                    if *feature >= n_features {
                        return Err(malformed(format!("node {i} splits on unknown feature {feature}")));
                    }
                    if *left >= self.nodes.len() || *right >= self.nodes.len() {
                        return Err(malformed(format!("node {i} has a dangling child")));
                    }
                }
                TreeNode::Leaf { value } => {
                    if value.len() != n_classes {
                        return Err(malformed(format!(
                            "leaf {i} has {} classes, expected {n_classes}",
                            value.len()
                        )));
                    }
                    if value.iter().any(|v| !v.is_finite() || *v < 0.0) {
                        return Err(malformed(format!("leaf {i} has a negative or non-finite count")));
                    }
                    let total: f32 = value.iter().sum();
                    if !total.is_finite() || total <= 0.0 {
                        return Err(malformed(format!("leaf {i} has empty distribution")));
                    }
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RandomForest {
    pub trees: Vec<DecisionTree>,
}

impl RandomForest {
    /// Mean of the per-tree leaf distributions.
    pub fn predict_proba(&self, x: &[f32], n_classes: usize) -> Result<Vec<f32>, ModelError> {
        if self.trees.is_empty() {
            return Err(ModelError::Inconsistent("forest has no trees".to_string()));
        }
        let mut acc = vec![0.0f32; n_classes];
        for (i, tree) in self.trees.iter().enumerate() {
            let proba = tree.predict_proba(i, x)?;
            if proba.len() != n_classes {
                return Err(ModelError::MalformedTree {
                    tree: i,
                    reason: format!("leaf has {} classes, expected {n_classes}", proba.len()),
                });
            }
            acc.iter_mut().zip(proba).for_each(|(a, p)| *a += p);
        }
        let n = self.trees.len() as f32;
        Ok(acc.into_iter().map(|a| a / n).collect())
    }
}

// ── Label encoder ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct LabelEncoder {
    pub classes: Vec<String>,
}

impl LabelEncoder {
    pub fn decode(&self, idx: usize) -> Option<&str> {
        self.classes.get(idx).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }
}

// ── Bundle ────────────────────────────────────────────────────────────────────

/// The three artifacts, validated against each other. Read-only once built.
#[derive(Debug, Clone)]
pub struct CategorizationModel {
    vectorizer: TfidfVectorizer,
    classifier: RandomForest,
    labels: LabelEncoder,
}

impl CategorizationModel {
    pub fn new(
        vectorizer: TfidfVectorizer,
        classifier: RandomForest,
        labels: LabelEncoder,
    ) -> Result<Self, ModelError> {
        vectorizer.validate()?;
        if labels.is_empty() {
            return Err(ModelError::Inconsistent("label encoder has no classes".to_string()));
        }
        if classifier.trees.is_empty() {
            return Err(ModelError::Inconsistent("forest has no trees".to_string()));
        }
        for (i, tree) in classifier.trees.iter().enumerate() {
            tree.validate(i, vectorizer.n_features(), labels.len())?;
        }
        Ok(Self { vectorizer, classifier, labels })
    }

    /// Load all three artifacts from `dir`.
    pub fn from_dir(dir: &Path) -> Result<Self, ModelError> {
        let vectorizer = read_json(&dir.join(VECTORIZER_FILE))?;
        let classifier = read_json(&dir.join(CLASSIFIER_FILE))?;
        let labels = read_json(&dir.join(LABEL_ENCODER_FILE))?;
        Self::new(vectorizer, classifier, labels)
    }

    pub fn labels(&self) -> &LabelEncoder {
        &self.labels
    }

    /// Probability per class, aligned with `labels().classes`.
    pub fn predict_proba(&self, text: &str) -> Result<Vec<f32>, ModelError> {
        let x = self.vectorizer.transform(text);
        self.classifier.predict_proba(&x, self.labels.len())
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ModelError> {
    let bytes = std::fs::read(path).map_err(|source| ModelError::Io { path: path.to_path_buf(), source })?;
    serde_json::from_slice(&bytes).map_err(|source| ModelError::Parse { path: path.to_path_buf(), source })
}

/// Whether a trained model backs the engine.
#[derive(Debug, Clone)]
pub enum ModelState {
    Loaded(Arc<CategorizationModel>),
    Absent,
}

impl ModelState {
    /// Load the model from `dir`. Missing or unreadable artifacts yield
    /// `Absent`; this never fails.
    pub fn load(dir: &Path) -> Self {
        let missing: Vec<&str> = [VECTORIZER_FILE, CLASSIFIER_FILE, LABEL_ENCODER_FILE]
            .into_iter()
            .filter(|f| !dir.join(f).is_file())
            .collect();
        if !missing.is_empty() {
            warn!(
                "Categorization model not found in {} (missing: {}); using keyword fallback",
                dir.display(),
                missing.join(", ")
            );
            return ModelState::Absent;
        }

        match CategorizationModel::from_dir(dir) {
            Ok(model) => {
                info!(
                    "Categorization model loaded from {} ({} classes)",
                    dir.display(),
                    model.labels().len()
                );
                ModelState::Loaded(Arc::new(model))
            }
            Err(e) => {
                error!("Error loading categorization model: {e}");
                ModelState::Absent
            }
        }
    }

    pub fn is_loaded(&self) -> bool {
        matches!(self, ModelState::Loaded(_))
    }
}

impl From<CategorizationModel> for ModelState {
    fn from(model: CategorizationModel) -> Self {
        ModelState::Loaded(Arc::new(model))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const VECTORIZER_JSON: &str = r#"{
        "vocabulary": {"такси": 0, "пятерочка": 1, "хлеб": 2, "яндекс такси": 3},
        "idf": [1.5, 1.2, 1.8, 2.0],
        "ngram_range": [1, 2]
    }"#;

    // Tree 0 splits on "такси", tree 1 on "пятерочка".
    pub(crate) const CLASSIFIER_JSON: &str = r#"{
        "trees": [
            {"nodes": [
                {"feature": 0, "threshold": 0.0, "left": 1, "right": 2},
                {"value": [6.0, 3.0, 1.0]},
                {"value": [0.0, 0.0, 10.0]}
            ]},
            {"nodes": [
                {"feature": 1, "threshold": 0.0, "left": 1, "right": 2},
                {"value": [2.0, 2.0, 6.0]},
                {"value": [10.0, 0.0, 0.0]}
            ]}
        ]
    }"#;

    pub(crate) const LABELS_JSON: &str = r#"{"classes": ["Продукты", "Прочее", "Такси"]}"#;

    pub(crate) fn write_artifacts(dir: &Path) {
        std::fs::write(dir.join(VECTORIZER_FILE), VECTORIZER_JSON).unwrap();
        std::fs::write(dir.join(CLASSIFIER_FILE), CLASSIFIER_JSON).unwrap();
        std::fs::write(dir.join(LABEL_ENCODER_FILE), LABELS_JSON).unwrap();
    }

    pub(crate) fn sample_model() -> CategorizationModel {
        CategorizationModel::new(
            serde_json::from_str(VECTORIZER_JSON).unwrap(),
            serde_json::from_str(CLASSIFIER_JSON).unwrap(),
            serde_json::from_str(LABELS_JSON).unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn transform_is_l2_normalized() {
        let v: TfidfVectorizer = serde_json::from_str(VECTORIZER_JSON).unwrap();
        let x = v.transform("Яндекс Такси до дома");
        let norm: f32 = x.iter().map(|a| a * a).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
        // unigram "такси" and bigram "яндекс такси" both present
        assert!(x[0] > 0.0 && x[3] > 0.0);
        assert_eq!(x[1], 0.0);
    }

    #[test]
    fn transform_unknown_text_is_zero() {
        let v: TfidfVectorizer = serde_json::from_str(VECTORIZER_JSON).unwrap();
        assert!(v.transform("совсем неизвестно").iter().all(|&a| a == 0.0));
        assert!(v.transform("").iter().all(|&a| a == 0.0));
    }

    #[test]
    fn single_char_tokens_are_ignored() {
        let v = TfidfVectorizer::new(HashMap::from([("a".to_string(), 0)]), vec![1.0], (1, 1));
        assert_eq!(v.transform("a a a"), vec![0.0]);
    }

    #[test]
    fn forest_averages_tree_distributions() {
        let model = sample_model();
        let p = model.predict_proba("такси").unwrap();
        // tree0 right leaf [0,0,1], tree1 left leaf [0.2,0.2,0.6]
        assert!((p[0] - 0.1).abs() < 1e-6);
        assert!((p[1] - 0.1).abs() < 1e-6);
        assert!((p[2] - 0.8).abs() < 1e-6);
        assert!((p.iter().sum::<f32>() - 1.0).abs() < 1e-5);
    }

    #[test]
    fn inconsistent_leaf_width_is_rejected() {
        let classifier: RandomForest =
            serde_json::from_str(r#"{"trees": [{"nodes": [{"value": [1.0, 2.0]}]}]}"#).unwrap();
        let err = CategorizationModel::new(
            serde_json::from_str(VECTORIZER_JSON).unwrap(),
            classifier,
            serde_json::from_str(LABELS_JSON).unwrap(),
        )
        .unwrap_err();
        assert!(matches!(err, ModelError::MalformedTree { tree: 0, .. }));
    }

    #[test]
    fn leaf_with_bad_counts_is_rejected() {
        for leaf in [r#"[1.0, -2.0, 3.0]"#, r#"[0.0, 0.0, 0.0]"#, r#"[3.0e38, 3.0e38, 0.0]"#] {
            let classifier: RandomForest =
                serde_json::from_str(&format!(r#"{{"trees": [{{"nodes": [{{"value": {leaf}}}]}}]}}"#)).unwrap();
            let err = CategorizationModel::new(
                serde_json::from_str(VECTORIZER_JSON).unwrap(),
                classifier,
                serde_json::from_str(LABELS_JSON).unwrap(),
            )
            .unwrap_err();
            assert!(matches!(err, ModelError::MalformedTree { tree: 0, .. }), "{leaf}");
        }
    }

    #[test]
    fn unknown_feature_is_rejected() {
        let classifier: RandomForest = serde_json::from_str(
            r#"{"trees": [{"nodes": [
                {"feature": 99, "threshold": 0.0, "left": 1, "right": 1},
                {"value": [1.0, 0.0, 0.0]}
            ]}]}"#,
        )
        .unwrap();
        let result = CategorizationModel::new(
            serde_json::from_str(VECTORIZER_JSON).unwrap(),
            classifier,
            serde_json::from_str(LABELS_JSON).unwrap(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn cyclic_tree_errors_at_scoring_time() {
        let tree: DecisionTree = serde_json::from_str(
            r#"{"nodes": [{"feature": 0, "threshold": 0.0, "left": 0, "right": 0}]}"#,
        )
        .unwrap();
        assert!(matches!(tree.predict_proba(0, &[0.0]), Err(ModelError::MalformedTree { .. })));
    }

    #[test]
    fn load_with_all_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        write_artifacts(dir.path());
        assert!(ModelState::load(dir.path()).is_loaded());
    }

    #[test]
    fn load_with_partial_artifacts_is_absent() {
        let dir = tempfile::tempdir().unwrap();
        write_artifacts(dir.path());
        std::fs::remove_file(dir.path().join(LABEL_ENCODER_FILE)).unwrap();
        assert!(!ModelState::load(dir.path()).is_loaded());
    }

    #[test]
    fn load_with_corrupt_artifact_is_absent() {
        let dir = tempfile::tempdir().unwrap();
        write_artifacts(dir.path());
        std::fs::write(dir.path().join(CLASSIFIER_FILE), "not json").unwrap();
        assert!(!ModelState::load(dir.path()).is_loaded());
        assert!(matches!(
            CategorizationModel::from_dir(dir.path()),
            Err(ModelError::Parse { .. })
        ));
    }

    #[test]
    fn load_from_missing_dir_is_absent() {
        assert!(!ModelState::load(Path::new("/nonexistent/finwise/models")).is_loaded());
    }
}
