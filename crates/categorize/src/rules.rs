use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RulesError {
    #[error("Failed to read rules file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse rules TOML: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Rule for '{0}' has no keywords")]
    EmptyRule(String),
}

/// One row of the keyword table: a category and the substrings that select it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KeywordRule {
    pub category: String,
    pub keywords: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RulesFile {
    #[serde(rename = "rule", default)]
    rules: Vec<KeywordRule>,
}

/// Ordered keyword table. The first rule with a matching keyword wins, so
/// table order is tie-break precedence.
#[derive(Debug, Clone)]
pub struct KeywordRules {
    rules: Vec<KeywordRule>,
}

const DEFAULT_TABLE: &[(&str, &[&str])] = &[
    ("Продукты", &["пятерочка", "магнит", "лента", "дикси", "перекресток", "продукты", "молоко", "хлеб"]),
    ("Топливо (АЗС)", &["азс", "лукойл", "роснефть", "газпром", "shell", "бензин", "топливо", "аи-"]),
    ("Рестораны и кафе", &["макдональд", "бургер", "kfc", "кофе", "ресторан", "кафе", "пицца", "суши"]),
    ("Такси", &["такси", "яндекс.такси", "uber", "gett", "ситимобил"]),
    ("Транспорт", &["метро", "тройка", "электричка", "автобус", "проездной"]),
    ("Подписки", &["netflix", "spotify", "youtube", "подписка", "яндекс.плюс", "okko"]),
    ("Аптека", &["аптека", "лекарство", "ригла", "36.6", "медикамент"]),
    ("Интернет и связь", &["мтс", "билайн", "мегафон", "ростелеком", "интернет", "связь", "телефон"]),
    ("Одежда и обувь", &["ozon одежда", "wildberries", "zara", "h&m", "одежда", "обувь", "кроссовки"]),
    ("Спорт и фитнес", &["спортмастер", "фитнес", "worldclass", "бассейн", "тренажер"]),
    ("Развлечения", &["кино", "театр", "концерт", "музей", "парк", "аттракцион"]),
    ("Дом и ремонт", &["леруа", "ikea", "obi", "ремонт", "мебель", "инструмент"]),
    ("Электроника", &["dns", "м.видео", "связной", "эльдорадо", "ноутбук", "телефон", "наушники"]),
    ("Образование", &["курс", "университет", "учебник", "книга", "образование"]),
    ("Коммунальные услуги", &["жкх", "коммунальные", "электричество", "вода", "газ"]),
    ("Путешествия", &["booking", "aviasales", "билет", "отель", "путешеств"]),
    ("Красота и здоровье", &["летуаль", "косметика", "салон", "маникюр", "парфюм"]),
];

/// Lowercase and fold `ё` into `е` so "Пятёрочка" and "пятерочка" compare equal.
pub(crate) fn normalize(text: &str) -> String {
    text.to_lowercase().replace('ё', "е")
}

impl KeywordRules {
    pub fn new(rules: Vec<KeywordRule>) -> Self {
        let rules = rules
            .into_iter()
            .map(|r| KeywordRule {
                category: r.category,
                keywords: r
                    .keywords
                    .iter()
                    .map(|k| normalize(k.trim()))
                    .filter(|k| !k.is_empty())
                    .collect(),
            })
            .collect();
        Self { rules }
    }

    pub fn from_toml(toml_content: &str) -> Result<Self, RulesError> {
        let file: RulesFile = toml::from_str(toml_content)?;
        if let Some(empty) = file.rules.iter().find(|r| r.keywords.iter().all(|k| k.trim().is_empty())) {
            return Err(RulesError::EmptyRule(empty.category.clone()));
        }
        Ok(Self::new(file.rules))
    }

    pub fn from_file(path: &Path) -> Result<Self, RulesError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// First rule (in table order) with a keyword occurring in `text`.
    pub fn find_match(&self, text: &str) -> Option<&KeywordRule> {
        let text = normalize(text);
        self.rules
            .iter()
            .find(|rule| rule.keywords.iter().any(|k| text.contains(k.as_str())))
    }
}

impl Default for KeywordRules {
    fn default() -> Self {
        Self::new(
            DEFAULT_TABLE
                .iter()
                .map(|(category, keywords)| KeywordRule {
                    category: (*category).to_string(),
                    keywords: keywords.iter().map(|k| (*k).to_string()).collect(),
                })
                .collect(),
        )
    }
}
