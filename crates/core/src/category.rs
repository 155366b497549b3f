use serde::{Deserialize, Serialize};

use crate::money::Money;

/// Input to categorization: a free-text description plus optional hints.
#[derive(Debug, Clone, Default)]
pub struct CategorizableTransaction {
    pub description: String,
    pub amount: Money,
    pub merchant_name: Option<String>,
    pub items: Vec<String>,
}

impl CategorizableTransaction {
    pub fn new(description: impl Into<String>, amount: Money) -> Self {
        Self { description: description.into(), amount, merchant_name: None, items: vec![] }
    }

    pub fn with_merchant(mut self, merchant: impl Into<String>) -> Self {
        self.merchant_name = Some(merchant.into());
        self
    }

    pub fn with_items<I, S>(mut self, items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.items = items.into_iter().map(Into::into).collect();
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CategoryAlternative {
    pub category: String,
    pub confidence: f32,
}

impl CategoryAlternative {
    pub fn new(category: impl Into<String>, confidence: f32) -> Self {
        Self { category: category.into(), confidence: confidence.clamp(0.0, 1.0) }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CategorizationResult {
    pub category: String,
    /// Always within 0.0–1.0.
    pub confidence: f32,
    /// Ranked by descending confidence; never contains `category`.
    pub alternatives: Vec<CategoryAlternative>,
}

impl CategorizationResult {
    pub fn new(
        category: impl Into<String>,
        confidence: f32,
        alternatives: Vec<CategoryAlternative>,
    ) -> Self {
        let category = category.into();
        let alternatives = alternatives.into_iter().filter(|a| a.category != category).collect();
        Self { category, confidence: confidence.clamp(0.0, 1.0), alternatives }
    }
}
