use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use finwise_core::{CategorizableTransaction, CategorizationResult, CategoryAlternative};

use crate::model::{CategorizationModel, ModelError, ModelState};
use crate::rules::KeywordRules;

/// Tunable constants of the categorizer. Defaults are the calibrated values
/// the product shipped with.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CategorizerConfig {
    /// Confidence reported for a keyword-rule match.
    pub keyword_confidence: f32,
    /// Confidence of the synthetic default-category alternative on a keyword match.
    pub keyword_alternative_confidence: f32,
    /// Category returned when nothing matches.
    pub default_category: String,
    /// Confidence reported when nothing matches.
    pub default_confidence: f32,
    /// Model alternatives at or below this probability are dropped.
    pub alternative_threshold: f32,
    pub max_alternatives: usize,
}

impl Default for CategorizerConfig {
    fn default() -> Self {
        Self {
            keyword_confidence: 0.70,
            keyword_alternative_confidence: 0.20,
            default_category: "Прочее".to_string(),
            default_confidence: 0.30,
            alternative_threshold: 0.05,
            max_alternatives: 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CategorizationMode {
    Model,
    Fallback,
}

impl std::fmt::Display for CategorizationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CategorizationMode::Model => write!(f, "model"),
            CategorizationMode::Fallback => write!(f, "fallback"),
        }
    }
}

/// Assigns a spending category to a transaction description.
///
/// Uses the trained model when one is loaded, otherwise the keyword table.
/// Never fails: a scoring error falls back to the keyword table as well.
pub struct CategorizationEngine {
    model: ModelState,
    rules: KeywordRules,
    config: CategorizerConfig,
}

impl CategorizationEngine {
    pub fn new(model: ModelState, rules: KeywordRules, config: CategorizerConfig) -> Self {
        Self { model, rules, config }
    }

    /// Keyword table only, default constants.
    pub fn fallback_only() -> Self {
        Self::new(ModelState::Absent, KeywordRules::default(), CategorizerConfig::default())
    }

    pub fn mode(&self) -> CategorizationMode {
        match self.model {
            ModelState::Loaded(_) => CategorizationMode::Model,
            ModelState::Absent => CategorizationMode::Fallback,
        }
    }

    pub fn categorize(&self, tx: &CategorizableTransaction) -> CategorizationResult {
        let result = match &self.model {
            ModelState::Loaded(model) => match self.score_with_model(model, tx) {
                Ok(result) => result,
                Err(e) => {
                    warn!("Model scoring failed, using keyword fallback: {e}");
                    self.fallback(tx)
                }
            },
            ModelState::Absent => self.fallback(tx),
        };
        info!(
            "Categorized '{}' ({}) as '{}' with confidence {:.2}",
            tx.description, tx.amount, result.category, result.confidence
        );
        result
    }

    pub fn categorize_batch(&self, txs: &[CategorizableTransaction]) -> Vec<CategorizationResult> {
        txs.iter().map(|tx| self.categorize(tx)).collect()
    }

    fn score_with_model(
        &self,
        model: &CategorizationModel,
        tx: &CategorizableTransaction,
    ) -> Result<CategorizationResult, ModelError> {
        let text = model_input_text(tx);
        let proba = model.predict_proba(&text)?;

        let mut ranked: Vec<usize> = (0..proba.len()).collect();
        // Stable: equal probabilities keep label order, so the lowest index wins ties.
        ranked.sort_by(|&a, &b| proba[b].total_cmp(&proba[a]));

        let &best = ranked
            .first()
            .ok_or_else(|| ModelError::Inconsistent("empty probability vector".to_string()))?;
        let category = decode(model, best)?;

        let alternatives = ranked
            .iter()
            .skip(1)
            .take(self.config.max_alternatives)
            .filter(|&&idx| proba[idx] > self.config.alternative_threshold)
            .map(|&idx| Ok(CategoryAlternative::new(decode(model, idx)?, proba[idx])))
            .collect::<Result<Vec<_>, ModelError>>()?;

        debug!("Model probabilities for '{text}': {proba:?}");
        Ok(CategorizationResult::new(category, proba[best], alternatives))
    }

    fn fallback(&self, tx: &CategorizableTransaction) -> CategorizationResult {
        let cfg = &self.config;
        match self.rules.find_match(&tx.description) {
            Some(rule) => CategorizationResult::new(
                rule.category.clone(),
                cfg.keyword_confidence,
                vec![CategoryAlternative::new(
                    cfg.default_category.clone(),
                    cfg.keyword_alternative_confidence,
                )],
            ),
            None => CategorizationResult::new(cfg.default_category.clone(), cfg.default_confidence, vec![]),
        }
    }
}

fn decode(model: &CategorizationModel, idx: usize) -> Result<&str, ModelError> {
    model
        .labels()
        .decode(idx)
        .ok_or_else(|| ModelError::Inconsistent(format!("no label for class {idx}")))
}

/// Description, merchant and item names joined into one lowercase blob.
fn model_input_text(tx: &CategorizableTransaction) -> String {
    let mut parts = vec![tx.description.as_str()];
    if let Some(merchant) = tx.merchant_name.as_deref().filter(|m| !m.is_empty()) {
        parts.push(merchant);
    }
    parts.extend(tx.items.iter().map(String::as_str));
    parts.join(" ").to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::tests::{sample_model, LABELS_JSON, VECTORIZER_JSON};
    use crate::rules::KeywordRule;
    use finwise_core::Money;

    fn tx(desc: &str) -> CategorizableTransaction {
        CategorizableTransaction::new(desc, Money::from_cents(45000))
    }

    fn model_engine() -> CategorizationEngine {
        CategorizationEngine::new(
            sample_model().into(),
            KeywordRules::default(),
            CategorizerConfig::default(),
        )
    }

    // ── Fallback mode ─────────────────────────────────────────────────────────

    #[test]
    fn fallback_keyword_match_is_deterministic() {
        let engine = CategorizationEngine::fallback_only();
        for _ in 0..3 {
            let r = engine.categorize(&tx("Пятерочка Хлеб Молоко"));
            assert_eq!(r.category, "Продукты");
            assert_eq!(r.confidence, 0.70);
            assert_eq!(r.alternatives, vec![CategoryAlternative::new("Прочее", 0.20)]);
        }
    }

    #[test]
    fn fallback_no_match_returns_default() {
        let engine = CategorizationEngine::fallback_only();
        let r = engine.categorize(&tx("Перевод другу"));
        assert_eq!(r.category, "Прочее");
        assert_eq!(r.confidence, 0.30);
        assert!(r.alternatives.is_empty());
    }

    #[test]
    fn fallback_handles_empty_description() {
        let r = CategorizationEngine::fallback_only().categorize(&tx(""));
        assert_eq!(r.category, "Прочее");
    }

    #[test]
    fn fallback_matches_description_only() {
        let engine = CategorizationEngine::fallback_only();
        let r = engine.categorize(&tx("Покупка").with_merchant("Пятерочка"));
        assert_eq!(r.category, "Прочее");
    }

    #[test]
    fn fallback_constants_are_configurable() {
        let config = CategorizerConfig {
            keyword_confidence: 0.9,
            default_category: "Other".into(),
            ..CategorizerConfig::default()
        };
        let engine = CategorizationEngine::new(ModelState::Absent, KeywordRules::default(), config);
        let r = engine.categorize(&tx("такси"));
        assert_eq!(r.confidence, 0.9);
        assert_eq!(r.alternatives[0].category, "Other");
        assert_eq!(engine.categorize(&tx("???")).category, "Other");
    }

    #[test]
    fn fallback_rule_equal_to_default_has_no_self_alternative() {
        let rules = KeywordRules::new(vec![KeywordRule {
            category: "Прочее".into(),
            keywords: vec!["разное".into()],
        }]);
        let engine = CategorizationEngine::new(ModelState::Absent, rules, CategorizerConfig::default());
        let r = engine.categorize(&tx("разное"));
        assert_eq!(r.category, "Прочее");
        assert!(r.alternatives.is_empty());
    }

    // ── Model mode ────────────────────────────────────────────────────────────

    #[test]
    fn model_mode_picks_argmax() {
        let engine = model_engine();
        assert_eq!(engine.mode(), CategorizationMode::Model);
        let r = engine.categorize(&tx("Яндекс Такси"));
        assert_eq!(r.category, "Такси");
        assert!((r.confidence - 0.8).abs() < 1e-6);
        // 0.1 / 0.1 both above the threshold, label order breaks the tie
        let names: Vec<_> = r.alternatives.iter().map(|a| a.category.as_str()).collect();
        assert_eq!(names, vec!["Продукты", "Прочее"]);
    }

    #[test]
    fn model_mode_uses_merchant_and_items() {
        let engine = model_engine();
        // no known term: tree0 [.6,.3,.1], tree1 [.2,.2,.6] → [.4,.25,.35]
        assert_eq!(engine.categorize(&tx("покупка")).category, "Продукты");
        let by_merchant = engine.categorize(&tx("покупка").with_merchant("Яндекс Такси"));
        assert_eq!(by_merchant.category, "Такси");
        let by_items = engine.categorize(&tx("покупка").with_items(["такси"]));
        assert_eq!(by_items.category, "Такси");
    }

    #[test]
    fn model_alternatives_respect_threshold_and_limit() {
        let engine = model_engine();
        let r = engine.categorize(&tx("пятерочка"));
        // tree0 [.6,.3,.1], tree1 [1,0,0] → [.8,.15,.05]
        assert_eq!(r.category, "Продукты");
        assert_eq!(r.alternatives.len(), 1);
        assert_eq!(r.alternatives[0].category, "Прочее");
        assert!(r.alternatives.len() <= 2);
        assert!(r.alternatives.iter().all(|a| a.category != r.category));
    }

    #[test]
    fn scoring_error_falls_back_to_keywords() {
        // Passes load-time validation but never reaches a leaf.
        let cyclic = CategorizationModel::new(
            serde_json::from_str(VECTORIZER_JSON).unwrap(),
            serde_json::from_str(
                r#"{"trees": [{"nodes": [{"feature": 0, "threshold": 0.0, "left": 0, "right": 0}]}]}"#,
            )
            .unwrap(),
            serde_json::from_str(LABELS_JSON).unwrap(),
        )
        .unwrap();
        let engine =
            CategorizationEngine::new(cyclic.into(), KeywordRules::default(), CategorizerConfig::default());
        assert_eq!(engine.mode(), CategorizationMode::Model);

        let r = engine.categorize(&tx("пятерочка"));
        assert_eq!(r.category, "Продукты");
        assert_eq!(r.confidence, 0.70);
        assert_eq!(r.alternatives, vec![CategoryAlternative::new("Прочее", 0.20)]);
    }

    #[test]
    fn confidence_always_in_unit_interval() {
        let engine = model_engine();
        let fallback = CategorizationEngine::fallback_only();
        for d in ["такси", "пятерочка хлеб", "", "zzz", "АЗС Лукойл АИ-95"] {
            for r in [engine.categorize(&tx(d)), fallback.categorize(&tx(d))] {
                assert!((0.0..=1.0).contains(&r.confidence));
                assert!(r.alternatives.len() <= 2);
                assert!(r.alternatives.iter().all(|a| a.category != r.category));
            }
        }
    }

    #[test]
    fn batch_preserves_order() {
        let engine = CategorizationEngine::fallback_only();
        let results = engine.categorize_batch(&[tx("такси"), tx("аптека"), tx("???")]);
        let cats: Vec<_> = results.iter().map(|r| r.category.as_str()).collect();
        assert_eq!(cats, vec!["Такси", "Аптека", "Прочее"]);
    }

    #[test]
    fn model_input_joins_hints_lowercase() {
        let t = tx("Покупка").with_merchant("МАГНИТ").with_items(["Хлеб", "Сыр"]);
        assert_eq!(model_input_text(&t), "покупка магнит хлеб сыр");
    }
}
