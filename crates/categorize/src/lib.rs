pub mod engine;
pub mod model;
pub mod rules;

pub use engine::{CategorizationEngine, CategorizationMode, CategorizerConfig};
pub use model::{CategorizationModel, ModelError, ModelState};
pub use rules::{KeywordRule, KeywordRules, RulesError};
