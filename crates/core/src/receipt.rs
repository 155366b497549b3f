use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::money::Money;

/// One product/service line parsed from a receipt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LineItem {
    pub name: String,
    pub unit_price: Money,
    pub quantity: u32,
    /// Always strictly positive.
    pub line_sum: Money,
    pub category: Option<String>,
}

impl LineItem {
    /// Minimum number of characters a name needs to count as an item.
    pub const MIN_NAME_CHARS: usize = 3;

    /// A single-unit line: unit price equals the line sum.
    /// `None` unless the name has at least three characters and the sum is positive.
    pub fn new(name: impl Into<String>, line_sum: Money) -> Option<Self> {
        Self::with_quantity(name, line_sum, 1, line_sum)
    }

    pub fn with_quantity(
        name: impl Into<String>,
        unit_price: Money,
        quantity: u32,
        line_sum: Money,
    ) -> Option<Self> {
        let name = name.into().trim().to_string();
        if name.chars().count() < Self::MIN_NAME_CHARS || !line_sum.is_positive() || quantity == 0 {
            return None;
        }
        Some(Self { name, unit_price, quantity, line_sum, category: None })
    }

    pub fn categorized(self, category: Option<String>) -> Self {
        Self { category, ..self }
    }
}

/// Structured view of a recognized receipt. Every field the parser
/// could not find is `None` (or empty for `items`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReceiptDocument {
    pub retailer: Option<String>,
    /// Serialized as ISO-8601 `YYYY-MM-DD`.
    pub date: Option<NaiveDate>,
    pub total: Option<Money>,
    pub items: Vec<LineItem>,
    pub raw_text: String,
}

impl ReceiptDocument {
    pub fn is_empty(&self) -> bool {
        self.retailer.is_none() && self.date.is_none() && self.total.is_none() && self.items.is_empty()
    }
}
