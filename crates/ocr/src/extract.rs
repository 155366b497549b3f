use std::sync::OnceLock;

use chrono::NaiveDate;
use finwise_core::{LineItem, Money, ReceiptDocument};
use regex::Regex;

// ── Compiled regex cache ─────────────────────────────────────────────────────

macro_rules! re {
    ($name:ident, $pat:expr) => {
        fn $name() -> &'static Regex {
            static R: OnceLock<Regex> = OnceLock::new();
            R.get_or_init(|| Regex::new($pat).expect("invalid regex"))
        }
    };
}

// Applied to lowercased lines.
re!(re_total_decimal,
    r"(?:итого|итог|к\s*оплате|сумма|total)[:\s]+(\d+[.,]\d{2})");
re!(re_total_integer,
    r"(?:итого|итог|к\s*оплате|сумма|total)[:\s]+(\d+)\b");
re!(re_amount,
    r"\b(\d{1,6}[.,]\d{2})\b");

re!(re_date_dmy,
    r"\b(\d{2})([./])(\d{2})([./])(\d{4}|\d{2})\b");
re!(re_date_ymd,
    r"\b(\d{4})([-./])(\d{2})([-./])(\d{2})\b");

re!(re_item,
    r"^(.+?)\s+(\d+[.,]\d{2})\s*$");
re!(re_item_qty,
    r"^(.+?)\s+(\d+[.,]\d{2})(?:\s*[xх*×]\s*|\s+)(\d{1,4})\s*=?\s*(\d+[.,]\d{2})\s*$");

/// Lines mentioning any of these are summary lines, never items.
const SKIP_KEYWORDS: &[&str] = &[
    "итого", "итог", "сумма", "к оплате", "наличные", "безналичные", "сдача",
    "скидка", "nds", "ндс", "total", "cash", "change", "discount",
];

/// Matched case-insensitively as substrings of the first lines.
const KNOWN_RETAILERS: &[&str] = &[
    "пятёрочка", "пятерочка", "магнит", "лента", "перекрёсток", "перекресток",
    "дикси", "ашан", "metro", "spar", "окей", "вкусвилл", "fix price",
    "wildberries", "ozon", "яндекс", "kfc", "макдональдс", "бургер кинг",
    "subway", "coffee",
];

const RETAILER_SCAN_LINES: usize = 5;

// ── Public extraction API ─────────────────────────────────────────────────────

/// Heuristic receipt parser. Every field is optional; a miss never fails
/// the whole parse.
pub struct Extractor;

impl Extractor {
    /// Extract structured fields from raw OCR text.
    pub fn parse(ocr_text: &str) -> ReceiptDocument {
        let lines: Vec<&str> = ocr_text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .collect();

        ReceiptDocument {
            retailer: Self::extract_retailer(&lines),
            date: Self::extract_date(&lines),
            total: Self::extract_total(&lines),
            items: Self::extract_items(&lines),
            raw_text: ocr_text.to_string(),
        }
    }

    // ── Total ─────────────────────────────────────────────────────────────────

    /// Labelled total nearest the end of the receipt; otherwise the largest
    /// amount-shaped token anywhere.
    pub fn extract_total(lines: &[&str]) -> Option<Money> {
        let labelled = lines.iter().rev().find_map(|line| {
            let lower = line.to_lowercase();
            [re_total_decimal(), re_total_integer()]
                .into_iter()
                .find_map(|re| Money::parse(re.captures(&lower)?.get(1)?.as_str()))
        });
        if labelled.is_some() {
            return labelled;
        }

        lines
            .iter()
            .flat_map(|line| re_amount().captures_iter(line))
            .filter_map(|c| Money::parse(c.get(1)?.as_str()))
            .max()
    }

    // ── Date ─────────────────────────────────────────────────────────────────

    /// First valid date, scanning lines top-down. Day-month-year wins over
    /// year-month-day on the same line.
    pub fn extract_date(lines: &[&str]) -> Option<NaiveDate> {
        lines
            .iter()
            .find_map(|line| try_date_dmy(line).or_else(|| try_date_ymd(line)))
    }

    // ── Retailer ──────────────────────────────────────────────────────────────

    /// First header line that names a known chain or has more than three
    /// characters.
    pub fn extract_retailer(lines: &[&str]) -> Option<String> {
        lines
            .iter()
            .take(RETAILER_SCAN_LINES)
            .find(|line| {
                let lower = line.to_lowercase();
                KNOWN_RETAILERS.iter().any(|name| lower.contains(name)) || line.chars().count() > 3
            })
            .map(|line| line.to_string())
    }

    // ── Items ─────────────────────────────────────────────────────────────────

    pub fn extract_items(lines: &[&str]) -> Vec<LineItem> {
        lines
            .iter()
            .filter(|line| !is_summary_line(line))
            .filter_map(|line| parse_item_line(line))
            .collect()
    }
}

fn is_summary_line(line: &str) -> bool {
    let lower = line.to_lowercase();
    SKIP_KEYWORDS.iter().any(|kw| lower.contains(kw))
}

/// `name price qty sum` when the arithmetic checks out, else `name sum`.
fn parse_item_line(line: &str) -> Option<LineItem> {
    if let Some(c) = re_item_qty().captures(line) {
        let price = Money::parse(c.get(2)?.as_str());
        let qty = c.get(3)?.as_str().parse::<u32>().ok();
        let sum = Money::parse(c.get(4)?.as_str());
        if let (Some(price), Some(qty), Some(sum)) = (price, qty, sum) {
            if qty > 0 && price.checked_mul(qty) == Some(sum) {
                return LineItem::with_quantity(c.get(1)?.as_str(), price, qty, sum);
            }
        }
    }

    let c = re_item().captures(line)?;
    let sum = Money::parse(c.get(2)?.as_str())?;
    LineItem::new(c.get(1)?.as_str(), sum)
}

// ── Date helpers ──────────────────────────────────────────────────────────────

fn try_date_dmy(line: &str) -> Option<NaiveDate> {
    re_date_dmy().captures_iter(line).find_map(|c| {
        if c.get(2)?.as_str() != c.get(4)?.as_str() {
            return None;
        }
        let day: u32 = c.get(1)?.as_str().parse().ok()?;
        let month: u32 = c.get(3)?.as_str().parse().ok()?;
        let year = expand_year(c.get(5)?.as_str())?;
        NaiveDate::from_ymd_opt(year, month, day)
    })
}

fn try_date_ymd(line: &str) -> Option<NaiveDate> {
    re_date_ymd().captures_iter(line).find_map(|c| {
        if c.get(2)?.as_str() != c.get(4)?.as_str() {
            return None;
        }
        let year: i32 = c.get(1)?.as_str().parse().ok()?;
        let month: u32 = c.get(3)?.as_str().parse().ok()?;
        let day: u32 = c.get(5)?.as_str().parse().ok()?;
        NaiveDate::from_ymd_opt(year, month, day)
    })
}

/// Two-digit years pivot like strptime's `%y`: 00–68 → 20xx, 69–99 → 19xx.
fn expand_year(s: &str) -> Option<i32> {
    let y: i32 = s.parse().ok()?;
    Some(match s.len() {
        2 if y <= 68 => 2000 + y,
        2 => 1900 + y,
        _ => y,
    })
}

// ── Tests ─────────────────────────────────────────────────────────────────────
