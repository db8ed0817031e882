//! Core domain model, closed lookup tables, and field parsers for PPB.

use std::str::FromStr;

use chrono::{DateTime, Duration, FixedOffset, Months, NaiveDate, NaiveTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "ppb-core";

/// Canonical field names a sheet header can resolve to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordField {
    ContractId,
    SignatureDate,
    Buyer,
    Seller,
    TotalAmount,
    Participants,
    ProductName,
    ProductDetails,
    Price,
    Region,
}

impl RecordField {
    pub fn name(self) -> &'static str {
        match self {
            RecordField::ContractId => "contract_id",
            RecordField::SignatureDate => "signature_date",
            RecordField::Buyer => "buyer",
            RecordField::Seller => "seller",
            RecordField::TotalAmount => "total_amount",
            RecordField::Participants => "participants",
            RecordField::ProductName => "product_name",
            RecordField::ProductDetails => "product_details",
            RecordField::Price => "price",
            RecordField::Region => "region",
        }
    }

    /// Resolves a sheet header label (any casing, surrounding whitespace
    /// ignored) against the fixed header table. Known misspellings from the
    /// upstream spreadsheets are part of the table.
    pub fn for_header(label: &str) -> Option<Self> {
        let needle = label.trim().to_lowercase();
        HEADER_LABELS
            .iter()
            .find(|(variant, _)| *variant == needle)
            .map(|(_, field)| *field)
    }
}

const HEADER_LABELS: &[(&str, RecordField)] = &[
    ("ідентифікатор договору", RecordField::ContractId),
    ("дата підписання", RecordField::SignatureDate),
    ("організатор", RecordField::Buyer),
    ("переможець", RecordField::Seller),
    ("сума договору", RecordField::TotalAmount),
    ("кількусть учасників", RecordField::Participants),
    ("кількість учасників", RecordField::Participants),
    ("назва продукту", RecordField::ProductName),
    ("характеристика продутку", RecordField::ProductDetails),
    ("характеристика продукту", RecordField::ProductDetails),
    ("ціна за кг", RecordField::Price),
    ("область та м. київ", RecordField::Region),
];

/// Variant spelling -> canonical oblast display value. Collapses the latin-i
/// and swapped-soft-sign spellings seen in the source sheets.
const REGION_VARIANTS: &[(&str, &str)] = &[
    ("вiнницька", "Вінницька"),
    ("вінницька", "Вінницька"),
    ("волинська", "Волинська"),
    ("дніпропетровська", "Дніпропетровська"),
    ("донецька", "Донецька"),
    ("житомирська", "Житомирська"),
    ("закарпатська", "Закарпатська"),
    ("запорізька", "Запорізька"),
    ("київ", "Київ"),
    ("київська", "Київська"),
    ("кіровоградська", "Кіровоградська"),
    ("луганська", "Луганська"),
    ("львівська", "Львівська"),
    ("миколаївська", "Миколаївська"),
    ("одеська", "Одеська"),
    ("полтавська", "Полтавська"),
    ("рівненська", "Рівненська"),
    ("сумська", "Сумська"),
    ("тернопільська", "Тернопільська"),
    ("харківська", "Харківська"),
    ("харківьска", "Харківська"),
    ("херсонська", "Херсонська"),
    ("хмельницька", "Хмельницька"),
    ("черкаська", "Черкаська"),
    ("чернівецька", "Чернівецька"),
    ("чернігівська", "Чернігівська"),
    ("івано-франківська", "Івано-Франківська"),
];

const CATEGORY_VARIANTS: &[(&str, &str)] = &[
    ("риба", "риба"),
    ("твердий сир", "твердий сир"),
    ("масло вершкове", "масло вершкове"),
    ("молоко", "молоко"),
    ("цукор", "цукор"),
    ("мед", "мед"),
];

/// Canonical oblast value. Constructible only through the closed region table.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Region(String);

impl Region {
    pub fn parse(raw: &str) -> Option<Self> {
        let needle = raw.trim().to_lowercase();
        REGION_VARIANTS
            .iter()
            .find(|(variant, _)| *variant == needle)
            .map(|(_, canonical)| Self((*canonical).to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Canonical product category value. Constructible only through the closed
/// category table.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Category(String);

impl Category {
    pub fn parse(raw: &str) -> Option<Self> {
        let needle = raw.trim().to_lowercase();
        CATEGORY_VARIANTS
            .iter()
            .find(|(variant, _)| *variant == needle)
            .map(|(_, canonical)| Self((*canonical).to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// One normalized procurement line item, unique per natural key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub contract_id: String,
    pub signature_date: DateTime<Utc>,
    pub buyer: String,
    pub seller: String,
    pub total_amount: Decimal,
    pub participants: u32,
    pub product_name: Category,
    pub product_details: String,
    pub product_hash: String,
    pub price: Decimal,
    pub region: Region,
}

impl CanonicalRecord {
    pub fn natural_key(&self) -> RecordKey {
        RecordKey {
            contract_id: self.contract_id.clone(),
            product_name: self.product_name.clone(),
            product_hash: self.product_hash.clone(),
        }
    }

    /// Disambiguation hash for otherwise-identical contracts: lowercased,
    /// trimmed product details.
    pub fn product_hash_for(details: &str) -> String {
        details.trim().to_lowercase()
    }
}

/// Natural key of a canonical record.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RecordKey {
    pub contract_id: String,
    pub product_name: Category,
    pub product_hash: String,
}

/// Notification frequency class of a subscription.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Cadence {
    Daily,
    Weekly,
    Monthly,
}

impl Cadence {
    pub const ALL: [Cadence; 3] = [Cadence::Daily, Cadence::Weekly, Cadence::Monthly];

    pub fn as_str(self) -> &'static str {
        match self {
            Cadence::Daily => "daily",
            Cadence::Weekly => "weekly",
            Cadence::Monthly => "monthly",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "daily" => Some(Cadence::Daily),
            "weekly" => Some(Cadence::Weekly),
            "monthly" => Some(Cadence::Monthly),
            _ => None,
        }
    }

    /// First day of the trailing window that ends at `today`.
    pub fn span_start(self, today: NaiveDate) -> NaiveDate {
        match self {
            Cadence::Daily => today - Duration::days(1),
            Cadence::Weekly => today - Duration::days(7),
            Cadence::Monthly => today.checked_sub_months(Months::new(1)).unwrap_or(today),
        }
    }
}

/// A standing request for periodic digests, unique per
/// (user, region, product, cadence).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: Uuid,
    pub user_id: String,
    pub region: Region,
    pub product_name: Category,
    pub cadence: Cadence,
    /// Opaque token shown to the user for unsubscribing.
    pub external_id: String,
    pub created_at: DateTime<Utc>,
}

impl Subscription {
    pub fn new(user_id: impl Into<String>, region: Region, product_name: Category, cadence: Cadence) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            region,
            product_name,
            cadence,
            external_id: Uuid::new_v4().simple().to_string(),
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SendStatus {
    Ok,
    Fail,
}

impl SendStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SendStatus::Ok => "ok",
            SendStatus::Fail => "fail",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "ok" => Some(SendStatus::Ok),
            "fail" => Some(SendStatus::Fail),
            _ => None,
        }
    }
}

/// Dedup witness for one dispatch attempt; at most one per
/// (subscription, calendar date).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SentLogEntry {
    pub subscription_id: Uuid,
    pub date: NaiveDate,
    pub status: SendStatus,
}

/// Aggregate price statistics over a set of matching records. Absence of any
/// matching records is expressed by the caller as `None`, never as a
/// zero-count `Stats`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stats {
    pub count: u64,
    pub total: Decimal,
    pub min: Decimal,
    pub max: Decimal,
    pub avg: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("not a number: {0:?}")]
    InvalidNumber(String),
    #[error("not an integer: {0:?}")]
    InvalidInteger(String),
    #[error("unrecognized date: {0:?}")]
    InvalidDate(String),
}

/// Strips grouping artifacts: surrounding whitespace, embedded ordinary and
/// non-breaking spaces, and a comma decimal separator.
fn num_strip(raw: &str) -> String {
    raw.trim()
        .chars()
        .filter(|c| *c != ' ' && *c != '\u{a0}')
        .map(|c| if c == ',' { '.' } else { c })
        .collect()
}

pub fn parse_amount(raw: &str) -> Result<Decimal, ParseError> {
    Decimal::from_str(&num_strip(raw)).map_err(|_| ParseError::InvalidNumber(raw.to_string()))
}

pub fn parse_int(raw: &str) -> Result<i64, ParseError> {
    num_strip(raw)
        .parse::<i64>()
        .map_err(|_| ParseError::InvalidInteger(raw.to_string()))
}

/// Parses a day-first textual date and anchors it at local midnight in the
/// given offset.
pub fn parse_localized_date(raw: &str, tz: FixedOffset) -> Result<DateTime<Utc>, ParseError> {
    let cleaned = raw.trim();
    for format in ["%d.%m.%Y", "%d.%m.%y", "%d/%m/%Y", "%d-%m-%Y"] {
        if let Ok(date) = NaiveDate::parse_from_str(cleaned, format) {
            return date
                .and_time(NaiveTime::MIN)
                .and_local_timezone(tz)
                .single()
                .map(|local| local.with_timezone(&Utc))
                .ok_or_else(|| ParseError::InvalidDate(raw.to_string()));
        }
    }
    Err(ParseError::InvalidDate(raw.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn amounts_tolerate_grouping_spaces_and_comma_decimal() {
        let expected = Decimal::new(123450, 2);
        assert_eq!(parse_amount("1 234,50").unwrap(), expected);
        assert_eq!(parse_amount("1\u{a0}234,50").unwrap(), expected);
        assert_eq!(parse_amount("  1234.50  ").unwrap(), expected);
    }

    #[test]
    fn non_numeric_amount_is_a_parse_error() {
        assert_eq!(
            parse_amount("abc"),
            Err(ParseError::InvalidNumber("abc".to_string()))
        );
    }

    #[test]
    fn integers_strip_like_amounts_but_reject_fractions() {
        assert_eq!(parse_int("1 024").unwrap(), 1024);
        assert!(matches!(parse_int("3,5"), Err(ParseError::InvalidInteger(_))));
    }

    #[test]
    fn day_first_dates_resolve_to_local_midnight() {
        let kyiv = FixedOffset::east_opt(2 * 3600).unwrap();
        let parsed = parse_localized_date("15.08.2026", kyiv).unwrap();
        assert_eq!(parsed.to_rfc3339(), "2026-08-14T22:00:00+00:00");
        assert!(parse_localized_date("August 15", kyiv).is_err());
    }

    #[test]
    fn region_lookup_is_case_insensitive_and_collapses_variants() {
        assert_eq!(Region::parse("ВІННИЦЬКА").unwrap().as_str(), "Вінницька");
        // Latin "i" spelling seen in the source sheets.
        assert_eq!(Region::parse("вiнницька").unwrap().as_str(), "Вінницька");
        assert_eq!(Region::parse("харківьска").unwrap().as_str(), "Харківська");
        assert!(Region::parse("атлантида").is_none());
    }

    #[test]
    fn category_lookup_is_closed() {
        assert_eq!(Category::parse(" Мед ").unwrap().as_str(), "мед");
        assert!(Category::parse("кава").is_none());
    }

    #[test]
    fn product_hash_lowercases_and_trims() {
        assert_eq!(
            CanonicalRecord::product_hash_for("  Молоко 2,5%  "),
            "молоко 2,5%"
        );
    }

    #[test]
    fn cadence_spans_walk_back_from_today() {
        let today = NaiveDate::from_ymd_opt(2026, 3, 31).unwrap();
        assert_eq!(
            Cadence::Daily.span_start(today),
            NaiveDate::from_ymd_opt(2026, 3, 30).unwrap()
        );
        assert_eq!(
            Cadence::Weekly.span_start(today),
            NaiveDate::from_ymd_opt(2026, 3, 24).unwrap()
        );
        // Calendar-month step clamps to the last day of the shorter month.
        assert_eq!(
            Cadence::Monthly.span_start(today),
            NaiveDate::from_ymd_opt(2026, 2, 28).unwrap()
        );
    }

    #[test]
    fn header_table_resolves_known_misspellings() {
        assert_eq!(
            RecordField::for_header("Кількусть учасників"),
            Some(RecordField::Participants)
        );
        assert_eq!(
            RecordField::for_header("характеристика продутку"),
            Some(RecordField::ProductDetails)
        );
        assert_eq!(RecordField::for_header("невідома колонка"), None);
    }
}
